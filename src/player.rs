use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::episode::Episode;

/// Failure raised while handing a unit to the player or the stream selector.
/// Only covers what happens synchronously; the request itself runs detached.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("failed to launch player '{0}': {1}. Is the player installed and in your PATH?")]
    PlayerError(String, String),

    #[error("episode {0} has no AniDB code and cannot be streamed")]
    MissingAniDbCode(i32),

    #[error("no async runtime available to dispatch request")]
    NoRuntime,

    #[error("{0}")]
    Rejected(String),
}

/// Starts playback of a local file. Fire-and-forget: implementations report
/// late failures through their own channel.
pub trait PlayerLauncher: Send + Sync {
    fn play(&self, path: &str, media_id: i64, episode: &Episode) -> Result<(), DispatchError>;
}

/// Launches a local media player process for downloaded files
pub struct CommandLauncher {
    command: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn build_command(&self, path: &str, episode: &Episode) -> Command {
        let mut cmd = Command::new(&self.command);

        if self.command.contains("mpv") {
            cmd.args(["--hwdec=auto", "--really-quiet"]);
            if !episode.display_title.is_empty() {
                cmd.arg(format!("--force-media-title={}", episode.display_title));
            }
        }

        cmd.args(&self.args);
        cmd.arg(path);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl PlayerLauncher for CommandLauncher {
    fn play(&self, path: &str, media_id: i64, episode: &Episode) -> Result<(), DispatchError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;

        let mut child = self
            .build_command(path, episode)
            .spawn()
            .map_err(|e| DispatchError::PlayerError(self.command.clone(), e.to_string()))?;

        info!(path, media_id, episode = episode.episode_number, "player started");

        // Reap the process so it does not linger as a zombie
        let command = self.command.clone();
        runtime.spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!(%command, "player exited"),
                Ok(status) => debug!(%command, %status, "player exited with error status"),
                Err(e) => error!(%command, error = %e, "failed waiting for player"),
            }
        });

        Ok(())
    }
}
