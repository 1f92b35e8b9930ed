use crate::episode::Episode;

/// Seconds between the end of playback and the next episode starting
pub const COUNTDOWN_SECS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    CountingDown,
    Executing,
}

/// Where the next episode comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Local,
    DebridStream,
}

/// The playback that just finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackContext {
    pub media_id: i64,
    pub progress_number: i32,
}

/// Snapshot of the autoplay session as shown to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoplayState {
    pub phase: Phase,
    /// Display only; the deferred action is what starts playback
    pub countdown: u32,
    pub next_episode: Option<Episode>,
    pub source: Option<SourceKind>,
}

impl AutoplayState {
    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }
}

impl Default for AutoplayState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            countdown: COUNTDOWN_SECS,
            next_episode: None,
            source: None,
        }
    }
}
