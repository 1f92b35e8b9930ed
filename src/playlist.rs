use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::episode::{Episode, MediaRef};
use crate::notify::{Notifier, Toast};
use crate::player::{DispatchError, PlayerLauncher};
use crate::stream::{
    SelectedStreamMemo, StreamDispatch, StreamRequest, StreamSelector, dispatch_stream,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaylistError {
    #[error("no playlist state")]
    NoPlaylistState,
    #[error("no entry")]
    NoEntry,
    #[error("episode not found for {0}")]
    EpisodeNotFound(String),
    #[error("local file not found")]
    LocalFileNotFound,
    #[error("episode {0} has no AniDB code")]
    MissingAniDbCode(i32),
    #[error("no episode handler for this playback type")]
    NoHandler,
    #[error("failed to play episode: {0}")]
    Dispatch(#[from] DispatchError),
}

/// How the current video is being played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackKind {
    LocalFile,
    /// Watch-party playback synced from a peer; plays through local files
    Nakama,
    DebridStream,
    /// Any other stream type, handled by the caller
    Other,
}

impl PlaybackKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "localfile" => Self::LocalFile,
            "nakama" => Self::Nakama,
            "debrid" | "debridstream" => Self::DebridStream,
            _ => Self::Other,
        }
    }

    pub fn uses_library(self) -> bool {
        matches!(self, Self::LocalFile | Self::Nakama)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaylistTarget {
    Previous,
    Next,
    /// Episode with this AniDB code
    Episode(String),
}

impl PlaylistTarget {
    pub fn parse(s: &str) -> Self {
        match s {
            "previous" | "prev" => Self::Previous,
            "next" => Self::Next,
            code => Self::Episode(code.to_string()),
        }
    }

    fn label(&self) -> &str {
        match self {
            Self::Previous => "previous",
            Self::Next => "next",
            Self::Episode(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

/// A playlist owned by something else that, while active, takes over
/// previous/next navigation entirely.
pub trait GlobalPlaylist: Send + Sync {
    fn is_active(&self) -> bool;
    fn has_episode(&self, direction: Direction) -> bool;
    fn play(&self, direction: Direction);
}

/// Fallback for playback kinds the navigator cannot start itself
pub type EpisodeHandler = Box<dyn Fn(&PlaylistTarget) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistState {
    pub kind: PlaybackKind,
    pub entry: Option<MediaRef>,
    pub episodes: Vec<Episode>,
    pub current: Episode,
    pub previous: Option<Episode>,
    pub next: Option<Episode>,
}

fn at_progress(episodes: &[Episode], progress: i32) -> Option<&Episode> {
    episodes.iter().find(|ep| ep.progress_number == progress)
}

impl PlaylistState {
    /// Build the playlist around the episode at `current_progress`.
    ///
    /// Local and watch-party playback walk the library's main episodes; every
    /// other kind walks the stream episode collection, optionally restricted
    /// to `only_numbers`. `None` when the current episode is not in the list.
    pub fn build(
        kind: PlaybackKind,
        entry: Option<MediaRef>,
        library: &[Episode],
        collection: &[Episode],
        only_numbers: Option<&[i32]>,
        current_progress: i32,
    ) -> Option<Self> {
        let episodes: Vec<Episode> = if kind.uses_library() {
            library.iter().filter(|ep| ep.is_main()).cloned().collect()
        } else {
            collection
                .iter()
                .filter(|ep| only_numbers.is_none_or(|nums| nums.contains(&ep.episode_number)))
                .cloned()
                .collect()
        };

        let current = at_progress(&episodes, current_progress)?.clone();
        let previous = current_progress
            .checked_sub(1)
            .and_then(|p| at_progress(&episodes, p))
            .cloned();
        let next = current_progress
            .checked_add(1)
            .and_then(|p| at_progress(&episodes, p))
            .cloned();

        info!(
            target: "playlist",
            kind = ?kind,
            episode_count = episodes.len(),
            current = current.episode_number,
            next = next.as_ref().map(|e| e.episode_number),
            previous = previous.as_ref().map(|e| e.episode_number),
            "playlist updated"
        );

        Some(Self {
            kind,
            entry,
            episodes,
            current,
            previous,
            next,
        })
    }

    fn resolve(&self, target: &PlaylistTarget) -> Option<&Episode> {
        match target {
            PlaylistTarget::Previous => self.previous.as_ref(),
            PlaylistTarget::Next => self.next.as_ref(),
            PlaylistTarget::Episode(code) => self
                .episodes
                .iter()
                .find(|ep| ep.anidb_episode.as_deref() == Some(code.as_str())),
        }
    }
}

/// What a navigation request ended up doing
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistOutcome {
    /// Watch-party peers do not navigate
    Skipped,
    /// Handed to the active global playlist
    Global,
    PlayedFile(Episode),
    Streamed(Episode, StreamDispatch),
    Handler,
}

pub struct PlaylistNavigator {
    state: Option<PlaylistState>,
    player: Arc<dyn PlayerLauncher>,
    streams: Arc<dyn StreamSelector>,
    notifier: Arc<dyn Notifier>,
    global: Option<Arc<dyn GlobalPlaylist>>,
    handler: Option<EpisodeHandler>,
    selected_stream: Option<SelectedStreamMemo>,
    watch_party_peer: bool,
    auto_select_stream: bool,
}

impl PlaylistNavigator {
    pub fn new(
        player: Arc<dyn PlayerLauncher>,
        streams: Arc<dyn StreamSelector>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            state: None,
            player,
            streams,
            notifier,
            global: None,
            handler: None,
            selected_stream: None,
            watch_party_peer: false,
            auto_select_stream: false,
        }
    }

    pub fn with_global_playlist(mut self, global: Arc<dyn GlobalPlaylist>) -> Self {
        self.global = Some(global);
        self
    }

    pub fn with_handler(mut self, handler: EpisodeHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn set_state(&mut self, state: Option<PlaylistState>) {
        if state.is_none() {
            info!(target: "playlist", "clearing playlist state");
        }
        self.state = state;
    }

    pub fn state(&self) -> Option<&PlaylistState> {
        self.state.as_ref()
    }

    pub fn set_selected_stream(&mut self, memo: Option<SelectedStreamMemo>) {
        self.selected_stream = memo;
    }

    pub fn set_watch_party_peer(&mut self, peer: bool) {
        self.watch_party_peer = peer;
    }

    /// Debrid sessions where the user let the server pick every stream
    pub fn set_auto_select_stream(&mut self, auto: bool) {
        self.auto_select_stream = auto;
    }

    pub fn has_previous_episode(&self) -> bool {
        !self.watch_party_peer && self.state.as_ref().is_some_and(|s| s.previous.is_some())
    }

    pub fn has_next_episode(&self) -> bool {
        !self.watch_party_peer && self.state.as_ref().is_some_and(|s| s.next.is_some())
    }

    fn fail(&self, err: PlaylistError) -> PlaylistError {
        self.notifier.notify(Toast::error(match &err {
            PlaylistError::NoPlaylistState => "Unexpected error: No playlist state".to_string(),
            PlaylistError::NoEntry => "Unexpected error: No entry".to_string(),
            PlaylistError::LocalFileNotFound => "Local file not found".to_string(),
            other => other.to_string(),
        }));
        err
    }

    pub fn play_episode(&self, target: PlaylistTarget) -> Result<PlaylistOutcome, PlaylistError> {
        if self.watch_party_peer {
            return Ok(PlaylistOutcome::Skipped);
        }

        let Some(state) = self.state.as_ref() else {
            return Err(self.fail(PlaylistError::NoPlaylistState));
        };
        let Some(entry) = state.entry.as_ref() else {
            return Err(self.fail(PlaylistError::NoEntry));
        };

        info!(target: "playlist", requested = target.label(), "requesting episode");

        if let Some(global) = self.global.as_ref().filter(|g| g.is_active()) {
            info!(
                target: "playlist",
                requested = target.label(),
                "playing global playlist episode"
            );
            let direction = match target {
                PlaylistTarget::Previous => Some(Direction::Previous),
                PlaylistTarget::Next => Some(Direction::Next),
                PlaylistTarget::Episode(_) => None,
            };
            if let Some(direction) = direction
                && global.has_episode(direction)
            {
                global.play(direction);
            }
            return Ok(PlaylistOutcome::Global);
        }

        let Some(episode) = state.resolve(&target) else {
            info!(target: "playlist", requested = target.label(), "episode not found");
            return Err(PlaylistError::EpisodeNotFound(target.label().to_string()));
        };

        info!(target: "playlist", episode = episode.episode_number, "playing episode");

        match state.kind {
            PlaybackKind::LocalFile | PlaybackKind::Nakama => {
                let Some(path) = episode.local_path() else {
                    return Err(self.fail(PlaylistError::LocalFileNotFound));
                };
                self.player
                    .play(path, entry.media_id, episode)
                    .map_err(|e| self.fail(e.into()))?;
                Ok(PlaylistOutcome::PlayedFile(episode.clone()))
            }
            PlaybackKind::DebridStream => {
                let dispatch = self.start_stream(entry, episode)?;
                Ok(PlaylistOutcome::Streamed(episode.clone(), dispatch))
            }
            PlaybackKind::Other => match &self.handler {
                Some(handler) => {
                    handler(&target);
                    Ok(PlaylistOutcome::Handler)
                }
                None => {
                    error!(
                        target: "playlist",
                        kind = ?state.kind,
                        "no episode handler for playback type"
                    );
                    Err(PlaylistError::NoHandler)
                }
            },
        }
    }

    fn start_stream(
        &self,
        entry: &MediaRef,
        episode: &Episode,
    ) -> Result<StreamDispatch, PlaylistError> {
        let Some(code) = episode.anidb_code() else {
            info!(
                target: "playlist",
                episode = episode.episode_number,
                "episode has no AniDB code, not streaming"
            );
            return Err(PlaylistError::MissingAniDbCode(episode.episode_number));
        };
        info!(target: "playlist", episode = episode.episode_number, "stream requested");

        let request = StreamRequest {
            media_id: entry.media_id,
            episode_number: episode.episode_number,
            anidb_episode: code.to_string(),
        };
        let memo = if self.auto_select_stream {
            None
        } else {
            self.selected_stream.as_ref()
        };

        dispatch_stream(self.streams.as_ref(), memo, request).map_err(|e| self.fail(e.into()))
    }
}
