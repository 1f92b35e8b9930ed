use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Error,
}

/// Short-lived message meant for the user, not for the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
}

impl Toast {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: ToastLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: ToastLevel::Error,
            message: message.into(),
        }
    }
}

impl fmt::Display for Toast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            ToastLevel::Info => write!(f, "{}", self.message),
            ToastLevel::Error => write!(f, "error: {}", self.message),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, toast: Toast);
}

/// Forwards toasts to whatever front-end drains the receiver
impl Notifier for mpsc::UnboundedSender<Toast> {
    fn notify(&self, toast: Toast) {
        if self.send(toast).is_err() {
            debug!("toast dropped, no receiver");
        }
    }
}

/// Writes toasts to the log only; used when nothing displays them
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, toast: Toast) {
        match toast.level {
            ToastLevel::Info => info!(message = %toast.message, "toast"),
            ToastLevel::Error => warn!(message = %toast.message, "toast"),
        }
    }
}
