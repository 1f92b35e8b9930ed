use serde::{Deserialize, Serialize};

/// Kind of episode as reported by the library. Only `Main` episodes take part
/// in next/previous resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    #[default]
    Main,
    Special,
    Nc,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFile {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub episode_number: i32,
    /// Sequential watch position, distinct from `episode_number`
    pub progress_number: i32,
    #[serde(rename = "aniDBEpisode", default, skip_serializing_if = "Option::is_none")]
    pub anidb_episode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_file: Option<LocalFile>,
    #[serde(default)]
    pub display_title: String,
    #[serde(rename = "type", default)]
    pub kind: EpisodeType,
}

impl Episode {
    pub fn is_main(&self) -> bool {
        self.kind == EpisodeType::Main
    }

    pub fn local_path(&self) -> Option<&str> {
        self.local_file
            .as_ref()
            .map(|f| f.path.as_str())
            .filter(|p| !p.is_empty())
    }

    /// AniDB code, treating an empty string as missing
    pub fn anidb_code(&self) -> Option<&str> {
        self.anidb_episode.as_deref().filter(|c| !c.is_empty())
    }
}

/// The media entry a playback or binge belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub media_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl MediaRef {
    pub fn new(media_id: i64) -> Self {
        Self {
            media_id,
            title: None,
        }
    }
}

/// Exact match on progress number, main episodes only.
pub fn find_by_progress(episodes: &[Episode], progress: i32) -> Option<&Episode> {
    episodes
        .iter()
        .filter(|ep| ep.is_main())
        .find(|ep| ep.progress_number == progress)
}

pub fn next_main_episode(episodes: &[Episode], current_progress: i32) -> Option<&Episode> {
    find_by_progress(episodes, current_progress.checked_add(1)?)
}

pub fn previous_main_episode(episodes: &[Episode], current_progress: i32) -> Option<&Episode> {
    find_by_progress(episodes, current_progress.checked_sub(1)?)
}
