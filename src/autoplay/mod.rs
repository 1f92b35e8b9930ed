//! Automatic progression to the next episode once playback ends.
//!
//! [`Orchestrator`] holds the session and performs every transition;
//! [`Autoplay`] runs it as a single task that owns the countdown timers and is
//! the handle callers and observers use.

mod orchestrator;
mod runner;
mod session;

pub use orchestrator::Orchestrator;
pub use runner::Autoplay;
pub use session::{AutoplayState, COUNTDOWN_SECS, Phase, PlaybackContext, SourceKind};

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::player::DispatchError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutoplayError {
    #[error("autoplay is disabled in settings")]
    Disabled,
    #[error("autoplay is already active")]
    AlreadyActive,
    #[error("no next episode to play")]
    NoNextUnit,
    #[error("failed to play next episode: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("unknown streaming type")]
    UnknownSourceKind,
    #[error("autoplay task is not running")]
    Closed,
}

/// The one setting autoplay reads
pub trait AutoplaySettings: Send + Sync {
    fn autoplay_enabled(&self) -> bool;
}

impl AutoplaySettings for AtomicBool {
    fn autoplay_enabled(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

impl AutoplaySettings for crate::config::LibraryConfig {
    fn autoplay_enabled(&self) -> bool {
        self.auto_play_next_episode
    }
}
