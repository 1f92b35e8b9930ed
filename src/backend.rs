use std::future::Future;
use std::sync::Arc;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::episode::{Episode, MediaRef, next_main_episode};
use crate::notify::{LogNotifier, Notifier, Toast};
use crate::player::{DispatchError, PlayerLauncher};
use crate::stream::{BatchEpisodeFiles, ExplicitSelection, StreamRequest, StreamSelector, Torrent};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("server error: {0}")]
    Server(String),
    #[error("empty response from server")]
    EmptyResponse,
}

/// Every server response is wrapped in `{ "data": .. }` or `{ "error": .. }`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimeEntry {
    pub media_id: i64,
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

impl AnimeEntry {
    pub fn media_ref(&self) -> MediaRef {
        MediaRef::new(self.media_id)
    }

    pub fn main_episodes(&self) -> Vec<Episode> {
        self.episodes.iter().filter(|ep| ep.is_main()).cloned().collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EpisodeCollection {
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebridStartRequest {
    pub media_id: i64,
    pub episode_number: i32,
    #[serde(rename = "aniDBEpisode")]
    pub anidb_episode: String,
    pub auto_select: bool,
    pub torrent: Option<Torrent>,
    pub file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_episode_files: Option<BatchEpisodeFiles>,
    pub playback_type: &'static str,
}

impl DebridStartRequest {
    fn auto(request: StreamRequest) -> Self {
        Self {
            media_id: request.media_id,
            episode_number: request.episode_number,
            anidb_episode: request.anidb_episode,
            auto_select: true,
            torrent: None,
            file_id: String::new(),
            batch_episode_files: None,
            playback_type: "default",
        }
    }

    fn explicit(selection: ExplicitSelection) -> Self {
        Self {
            media_id: selection.request.media_id,
            episode_number: selection.request.episode_number,
            anidb_episode: selection.request.anidb_episode,
            auto_select: false,
            torrent: Some(selection.torrent),
            file_id: selection.chosen_file_id.unwrap_or_default(),
            batch_episode_files: selection.batch_files,
            playback_type: "default",
        }
    }
}

#[derive(Debug, Serialize)]
struct PlayRequest<'a> {
    path: &'a str,
}

/// Looks up the episodes of a media entry.
pub trait EpisodeResolver: Send + Sync {
    /// Main-sequence episodes, in library order
    fn main_episodes(
        &self,
        media_id: i64,
    ) -> impl Future<Output = Result<Vec<Episode>, BackendError>> + Send;
}

/// Episode following `current_progress` in the library, if any
pub async fn resolve_next_episode<R: EpisodeResolver>(
    resolver: &R,
    media_id: i64,
    current_progress: i32,
) -> Result<Option<Episode>, BackendError> {
    let episodes = resolver.main_episodes(media_id).await?;
    Ok(next_main_episode(&episodes, current_progress).cloned())
}

/// Client for the media server's REST API
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
    notifier: Arc<dyn Notifier>,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        url::Url::parse(base_url)?;
        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            notifier: Arc::new(LogNotifier),
        })
    }

    /// Where failures of detached requests are reported
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BackendError> {
        let status = response.status();
        let envelope: Envelope<T> = match response.json().await {
            Ok(env) => env,
            Err(e) if !status.is_success() => {
                return Err(BackendError::Server(format!("status {}: {}", status, e)));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(err) = envelope.error {
            return Err(BackendError::Server(err));
        }
        envelope.data.ok_or(BackendError::EmptyResponse)
    }

    /// For endpoints whose payload is irrelevant, only the error field counts
    async fn check(response: reqwest::Response) -> Result<(), BackendError> {
        let status = response.status();
        let envelope: Envelope<serde_json::Value> = response.json().await.unwrap_or(Envelope {
            data: None,
            error: None,
        });
        if let Some(err) = envelope.error {
            return Err(BackendError::Server(err));
        }
        if !status.is_success() {
            return Err(BackendError::Server(format!("status {}", status)));
        }
        Ok(())
    }

    pub async fn get_anime_entry(&self, media_id: i64) -> Result<AnimeEntry, BackendError> {
        let url = format!("{}/api/v1/library/anime-entry/{}", self.base_url, media_id);

        debug!(target: "backend", media_id, "fetching anime entry");

        let response = self.client.get(&url).send().await?;
        Self::read(response).await
    }

    pub async fn get_episode_collection(
        &self,
        media_id: i64,
    ) -> Result<EpisodeCollection, BackendError> {
        let url = format!(
            "{}/api/v1/anime/episode-collection/{}",
            self.base_url, media_id
        );

        debug!(target: "backend", media_id, "fetching episode collection");

        let response = self.client.get(&url).send().await?;
        Self::read(response).await
    }

    pub async fn start_debrid_stream(&self, body: &DebridStartRequest) -> Result<(), BackendError> {
        let url = format!("{}/api/v1/debrid/stream/start", self.base_url);

        info!(
            target: "backend",
            media_id = body.media_id,
            episode = body.episode_number,
            auto_select = body.auto_select,
            "requesting debrid stream"
        );

        let response = self.client.post(&url).json(body).send().await?;
        Self::check(response).await
    }

    pub async fn play_media_file(&self, path: &str) -> Result<(), BackendError> {
        let url = format!("{}/api/v1/media-player/play", self.base_url);

        info!(target: "backend", path, "requesting playback");

        let response = self.client.post(&url).json(&PlayRequest { path }).send().await?;
        Self::check(response).await
    }

    fn spawn_debrid_start(&self, body: DebridStartRequest) -> Result<(), DispatchError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let this = self.clone();
        runtime.spawn(async move {
            if let Err(e) = this.start_debrid_stream(&body).await {
                error!(
                    target: "backend",
                    error = %e,
                    episode = body.episode_number,
                    "debrid stream request failed"
                );
                this.notifier
                    .notify(Toast::error(format!("Failed to start stream: {}", e)));
            }
        });
        Ok(())
    }
}

impl EpisodeResolver for BackendClient {
    async fn main_episodes(&self, media_id: i64) -> Result<Vec<Episode>, BackendError> {
        Ok(self.get_anime_entry(media_id).await?.main_episodes())
    }
}

impl StreamSelector for BackendClient {
    fn select_explicit(&self, selection: ExplicitSelection) -> Result<(), DispatchError> {
        if selection.request.anidb_episode.is_empty() {
            return Err(DispatchError::MissingAniDbCode(
                selection.request.episode_number,
            ));
        }
        self.spawn_debrid_start(DebridStartRequest::explicit(selection))
    }

    fn select_auto(&self, request: StreamRequest) -> Result<(), DispatchError> {
        if request.anidb_episode.is_empty() {
            return Err(DispatchError::MissingAniDbCode(request.episode_number));
        }
        self.spawn_debrid_start(DebridStartRequest::auto(request))
    }
}

/// Plays local files through the server's configured media player
impl PlayerLauncher for BackendClient {
    fn play(&self, path: &str, media_id: i64, episode: &Episode) -> Result<(), DispatchError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let this = self.clone();
        let path = path.to_string();
        let episode_number = episode.episode_number;
        runtime.spawn(async move {
            if let Err(e) = this.play_media_file(&path).await {
                error!(
                    target: "backend",
                    error = %e,
                    media_id,
                    episode = episode_number,
                    "playback request failed"
                );
                this.notifier
                    .notify(Toast::error(format!("Failed to play file: {}", e)));
            }
        });
        Ok(())
    }
}
