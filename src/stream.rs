use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::episode::{Episode, MediaRef, next_main_episode};
use crate::player::DispatchError;

/// A torrent as returned by the server's torrent providers. Provider specific
/// fields are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Torrent {
    pub name: String,
    #[serde(default)]
    pub is_batch: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFile {
    pub index: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
}

/// Files of a batch torrent and the one currently being played
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEpisodeFiles {
    pub current: u32,
    pub current_episode_number: i32,
    #[serde(rename = "currentAniDBEpisode")]
    pub current_anidb_episode: String,
    #[serde(default)]
    pub files: Vec<BatchFile>,
}

impl BatchEpisodeFiles {
    /// The file whose index directly follows the current one
    pub fn next_file(&self) -> Option<&BatchFile> {
        let next = self.current.checked_add(1)?;
        self.files.iter().find(|f| f.index == next)
    }
}

/// Stream the user last picked, remembered so autoplay can continue from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedStreamMemo {
    pub entry: MediaRef,
    pub torrent: Torrent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_files: Option<BatchEpisodeFiles>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BingeKind {
    #[serde(rename = "debridstream")]
    DebridStream,
}

/// Persisted position of a debrid binge: the episode to request next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebridAutoplayInfo {
    pub all_episodes: Vec<Episode>,
    pub entry: MediaRef,
    pub episode_number: i32,
    #[serde(rename = "aniDBEpisode")]
    pub anidb_episode: String,
    #[serde(rename = "type")]
    pub kind: BingeKind,
}

impl DebridAutoplayInfo {
    /// Start a binge at `episode`. Returns `None` when the episode cannot be
    /// streamed (no AniDB code).
    pub fn new(entry: MediaRef, all_episodes: Vec<Episode>, episode: &Episode) -> Option<Self> {
        let code = episode.anidb_code()?.to_string();
        Some(Self {
            all_episodes,
            entry,
            episode_number: episode.episode_number,
            anidb_episode: code,
            kind: BingeKind::DebridStream,
        })
    }

    pub fn request(&self) -> StreamRequest {
        StreamRequest {
            media_id: self.entry.media_id,
            episode_number: self.episode_number,
            anidb_episode: self.anidb_episode.clone(),
        }
    }

    fn current_progress(&self) -> i32 {
        self.all_episodes
            .iter()
            .find(|ep| ep.episode_number == self.episode_number)
            .map(|ep| ep.progress_number)
            .unwrap_or(self.episode_number)
    }

    /// Main episode following the current one by progress number
    pub fn following_episode(&self) -> Option<&Episode> {
        next_main_episode(&self.all_episodes, self.current_progress())
    }

    /// Binge state pointing at the following episode. `None` ends the binge,
    /// including when that episode has no AniDB code.
    pub fn advance(&self) -> Option<(Self, Episode)> {
        let next = self.following_episode()?;
        let code = next.anidb_code()?.to_string();
        let info = Self {
            all_episodes: self.all_episodes.clone(),
            entry: self.entry.clone(),
            episode_number: next.episode_number,
            anidb_episode: code,
            kind: BingeKind::DebridStream,
        };
        Some((info, next.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub media_id: i64,
    pub episode_number: i32,
    #[serde(rename = "aniDBEpisode")]
    pub anidb_episode: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplicitSelection {
    pub request: StreamRequest,
    pub torrent: Torrent,
    pub chosen_file_id: Option<String>,
    pub batch_files: Option<BatchEpisodeFiles>,
}

/// Resolves a stream on the server and starts it. Both calls return as soon as
/// the request is handed off.
pub trait StreamSelector: Send + Sync {
    fn select_explicit(&self, selection: ExplicitSelection) -> Result<(), DispatchError>;

    fn select_auto(&self, request: StreamRequest) -> Result<(), DispatchError>;
}

/// What a stream dispatch ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDispatch {
    /// Next file of the remembered batch; carries the memo with its cursor moved
    BatchFile(SelectedStreamMemo),
    Auto,
}

/// Request `request`, continuing the remembered batch when the memo points at
/// one for the same media and the following file is known. Anything else is
/// auto-selected.
pub fn dispatch_stream(
    selector: &dyn StreamSelector,
    memo: Option<&SelectedStreamMemo>,
    request: StreamRequest,
) -> Result<StreamDispatch, DispatchError> {
    let next = memo
        .filter(|m| m.torrent.is_batch && m.entry.media_id == request.media_id)
        .and_then(|m| {
            let batch = m.batch_files.as_ref()?;
            let file = batch.next_file()?;
            Some((m, batch, file.index))
        });

    match next {
        Some((memo, batch, index)) => {
            debug!(index, torrent = %memo.torrent.name, "continuing batch");
            let batch_files = BatchEpisodeFiles {
                current: index,
                current_episode_number: request.episode_number,
                current_anidb_episode: request.anidb_episode.clone(),
                files: batch.files.clone(),
            };
            selector.select_explicit(ExplicitSelection {
                request,
                torrent: memo.torrent.clone(),
                chosen_file_id: Some(index.to_string()),
                batch_files: Some(batch_files.clone()),
            })?;
            Ok(StreamDispatch::BatchFile(SelectedStreamMemo {
                entry: memo.entry.clone(),
                torrent: memo.torrent.clone(),
                batch_files: Some(batch_files),
            }))
        }
        None => {
            selector.select_auto(request)?;
            Ok(StreamDispatch::Auto)
        }
    }
}
