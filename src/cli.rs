use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use serde_json::Map;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::autoplay::{
    Autoplay, AutoplayError, AutoplaySettings, Orchestrator, Phase, PlaybackContext,
};
use crate::backend::{AnimeEntry, BackendClient, BackendError, resolve_next_episode};
use crate::config::Config;
use crate::episode::{MediaRef, find_by_progress};
use crate::notify::{Notifier, Toast};
use crate::player::{CommandLauncher, DispatchError, PlayerLauncher};
use crate::playlist::{
    PlaybackKind, PlaylistNavigator, PlaylistOutcome, PlaylistState, PlaylistTarget,
};
use crate::store::{JsonFileStore, KeyValueStore, MemoryStore};
use crate::stream::{
    BatchEpisodeFiles, BatchFile, DebridAutoplayInfo, ExplicitSelection, SelectedStreamMemo,
    StreamDispatch, StreamRequest, StreamSelector, Torrent,
};

#[derive(Error, Debug)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Autoplay(#[from] AutoplayError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

const HELP: &str = "\
commands:
  ended <media-id> <progress>                 playback finished, autoplay the next episode
  cancel                                      stop the autoplay countdown
  binge <media-id> <progress>                 stream an episode and keep going with the next ones
  select <media-id> <progress> <file>[/<last>] <torrent name>
                                              stream a file of a chosen torrent; with /<last>
                                              the torrent is a batch of files <file>..=<last>
  playlist <kind> <media-id> <progress>       set the current playlist
                                              (localfile, nakama, debrid, ...)
  next | prev | play <anidb-code>             navigate the current playlist
  status                                      show autoplay state
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Ended { media_id: i64, progress: i32 },
    Cancel,
    Binge { media_id: i64, progress: i32 },
    Select(StreamChoice),
    Playlist {
        kind: PlaybackKind,
        media_id: i64,
        progress: i32,
    },
    Navigate(PlaylistTarget),
    Status,
    Help,
    Quit,
}

/// A torrent file picked by the user
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamChoice {
    media_id: i64,
    progress: i32,
    file_index: u32,
    /// Last file of a batch torrent
    last_index: Option<u32>,
    torrent: String,
}

impl StreamChoice {
    fn memo(&self, request: &StreamRequest) -> SelectedStreamMemo {
        let batch_files = self.last_index.map(|last| BatchEpisodeFiles {
            current: self.file_index,
            current_episode_number: request.episode_number,
            current_anidb_episode: request.anidb_episode.clone(),
            files: (self.file_index..=last)
                .map(|index| BatchFile {
                    index,
                    name: String::new(),
                    path: String::new(),
                })
                .collect(),
        });
        SelectedStreamMemo {
            entry: MediaRef::new(self.media_id),
            torrent: Torrent {
                name: self.torrent.clone(),
                is_batch: batch_files.is_some(),
                extra: Map::new(),
            },
            batch_files,
        }
    }
}

fn parse_number<T: std::str::FromStr>(arg: Option<&str>, name: &str) -> Result<T, String> {
    arg.ok_or_else(|| format!("missing {}", name))?
        .parse()
        .map_err(|_| format!("invalid {}", name))
}

fn parse_input(line: &str) -> Result<Input, String> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Err("empty command".to_string());
    };

    match cmd {
        "ended" => Ok(Input::Ended {
            media_id: parse_number(parts.next(), "media id")?,
            progress: parse_number(parts.next(), "progress")?,
        }),
        "binge" => Ok(Input::Binge {
            media_id: parse_number(parts.next(), "media id")?,
            progress: parse_number(parts.next(), "progress")?,
        }),
        "select" => {
            let media_id = parse_number(parts.next(), "media id")?;
            let progress = parse_number(parts.next(), "progress")?;
            let files = parts.next().ok_or("missing file index")?;
            let (file_index, last_index) = match files.split_once('/') {
                Some((first, last)) => (
                    parse_number(Some(first), "file index")?,
                    Some(parse_number(Some(last), "last file index")?),
                ),
                None => (parse_number(Some(files), "file index")?, None),
            };
            if last_index.is_some_and(|last| last < file_index) {
                return Err("invalid file range".to_string());
            }
            let torrent = parts.collect::<Vec<_>>().join(" ");
            if torrent.is_empty() {
                return Err("missing torrent name".to_string());
            }
            Ok(Input::Select(StreamChoice {
                media_id,
                progress,
                file_index,
                last_index,
                torrent,
            }))
        }
        "playlist" => {
            let kind = parts.next().ok_or("missing playback kind")?;
            Ok(Input::Playlist {
                kind: PlaybackKind::parse(kind),
                media_id: parse_number(parts.next(), "media id")?,
                progress: parse_number(parts.next(), "progress")?,
            })
        }
        "cancel" => Ok(Input::Cancel),
        "next" => Ok(Input::Navigate(PlaylistTarget::Next)),
        "prev" | "previous" => Ok(Input::Navigate(PlaylistTarget::Previous)),
        "play" => {
            let code = parts.next().ok_or("missing AniDB code")?;
            Ok(Input::Navigate(PlaylistTarget::Episode(code.to_string())))
        }
        "status" => Ok(Input::Status),
        "help" | "?" => Ok(Input::Help),
        "quit" | "exit" | "q" => Ok(Input::Quit),
        other => Err(format!("unknown command '{}'", other)),
    }
}

struct Console {
    backend: BackendClient,
    autoplay: Autoplay,
    navigator: PlaylistNavigator,
}

impl Console {
    async fn on_playback_ended(&self, media_id: i64, progress: i32) -> Result<(), CliError> {
        let context = PlaybackContext {
            media_id,
            progress_number: progress,
        };

        // A pending debrid binge resolves its own episode
        let next = if self.autoplay.has_next_episode().await? {
            None
        } else {
            resolve_next_episode(&self.backend, media_id, progress).await?
        };

        match self.autoplay.start(context, next, None).await {
            Ok(()) => println!("Next episode starting soon, type 'cancel' to stop"),
            Err(e) => println!("autoplay: {}", e),
        }
        Ok(())
    }

    /// Binge state at the episode with `progress`, or `None` after telling
    /// the user why there is none
    async fn binge_at(
        &self,
        media_id: i64,
        progress: i32,
    ) -> Result<Option<DebridAutoplayInfo>, CliError> {
        let collection = self.backend.get_episode_collection(media_id).await?;
        let Some(episode) = find_by_progress(&collection.episodes, progress) else {
            println!("episode {} not found", progress);
            return Ok(None);
        };
        let info =
            DebridAutoplayInfo::new(MediaRef::new(media_id), collection.episodes.clone(), episode);
        if info.is_none() {
            println!("episode {} cannot be streamed", progress);
        }
        Ok(info)
    }

    async fn on_binge(&self, media_id: i64, progress: i32) -> Result<(), CliError> {
        let Some(info) = self.binge_at(media_id, progress).await? else {
            return Ok(());
        };

        // The server picks the stream, so no earlier pick applies any more
        self.autoplay.forget_stream().await?;
        self.backend.select_auto(info.request())?;
        self.continue_binge(&info).await
    }

    async fn on_select(&self, choice: StreamChoice) -> Result<(), CliError> {
        let Some(info) = self.binge_at(choice.media_id, choice.progress).await? else {
            return Ok(());
        };

        let request = info.request();
        let memo = choice.memo(&request);
        self.backend.select_explicit(ExplicitSelection {
            request,
            torrent: memo.torrent.clone(),
            chosen_file_id: Some(choice.file_index.to_string()),
            batch_files: memo.batch_files.clone(),
        })?;
        self.autoplay.remember_stream(memo).await?;
        self.continue_binge(&info).await
    }

    async fn continue_binge(&self, info: &DebridAutoplayInfo) -> Result<(), CliError> {
        match info.advance() {
            Some((next, episode)) => {
                self.autoplay.begin_debrid_binge(next).await?;
                println!("Streaming, autoplay will continue with {}", episode.display_title);
            }
            None => println!("Streaming the last available episode"),
        }
        Ok(())
    }

    async fn on_playlist(
        &mut self,
        kind: PlaybackKind,
        media_id: i64,
        progress: i32,
    ) -> Result<(), CliError> {
        let entry = match self.backend.get_anime_entry(media_id).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(media_id, error = %e, "anime entry unavailable");
                None
            }
        };
        let collection = if kind.uses_library() {
            Vec::new()
        } else {
            self.backend.get_episode_collection(media_id).await?.episodes
        };
        let library = entry.as_ref().map(|e| e.episodes.as_slice()).unwrap_or_default();

        let state = PlaylistState::build(
            kind,
            entry.as_ref().map(AnimeEntry::media_ref),
            library,
            &collection,
            None,
            progress,
        );
        match &state {
            Some(s) => println!(
                "Playlist set: {} episodes, previous: {}, next: {}",
                s.episodes.len(),
                s.previous.is_some(),
                s.next.is_some()
            ),
            None => println!("No playlist for episode {}", progress),
        }
        self.navigator.set_state(state);
        Ok(())
    }

    async fn on_navigate(&mut self, target: PlaylistTarget) -> Result<(), CliError> {
        self.navigator
            .set_selected_stream(self.autoplay.selected_stream().await?);

        match self.navigator.play_episode(target) {
            Ok(PlaylistOutcome::Streamed(episode, StreamDispatch::BatchFile(memo))) => {
                self.autoplay.remember_stream(memo).await?;
                println!("Requesting {}", episode.display_title);
            }
            Ok(PlaylistOutcome::Streamed(episode, StreamDispatch::Auto))
            | Ok(PlaylistOutcome::PlayedFile(episode)) => {
                println!("Requesting {}", episode.display_title);
            }
            Ok(_) => {}
            Err(e) => info!(target: "playlist", error = %e, "navigation failed"),
        }
        Ok(())
    }

    fn print_status(&self) {
        let state = self.autoplay.state();
        match state.phase {
            Phase::Idle => println!("autoplay idle"),
            phase => println!(
                "autoplay {:?}: {}s, next: {}",
                phase,
                state.countdown,
                state
                    .next_episode
                    .as_ref()
                    .map(|e| e.display_title.as_str())
                    .unwrap_or("(stream)")
            ),
        }
    }
}

fn open_store(config: &Config) -> Box<dyn KeyValueStore> {
    match config.storage.state_file() {
        Some(path) => {
            info!(path = %path.display(), "using state file");
            Box::new(JsonFileStore::open(path))
        }
        None => {
            warn!("no data directory, autoplay state will not persist");
            Box::new(MemoryStore::new())
        }
    }
}

impl Console {
    /// Wire the backend, player, store and autoplay task from `config`
    fn new(
        config: &Config,
        notifier: Arc<dyn Notifier>,
    ) -> Result<(Self, JoinHandle<()>), CliError> {
        let backend = BackendClient::new(&config.server.url)?.with_notifier(notifier.clone());
        let player: Arc<dyn PlayerLauncher> = match &config.player.command {
            Some(command) => Arc::new(CommandLauncher::new(command, config.player.args.clone())),
            None => Arc::new(backend.clone()),
        };
        let streams: Arc<dyn StreamSelector> = Arc::new(backend.clone());
        let settings: Arc<dyn AutoplaySettings> = Arc::new(config.library.clone());

        let orchestrator = Orchestrator::new(
            settings,
            open_store(config),
            player.clone(),
            streams.clone(),
            notifier.clone(),
        );
        let (autoplay, join) = Autoplay::spawn(orchestrator);

        let mut navigator = PlaylistNavigator::new(player, streams, notifier);
        navigator.set_auto_select_stream(config.debrid.auto_select_file);

        let console = Self {
            backend,
            autoplay,
            navigator,
        };
        Ok((console, join))
    }
}

pub async fn run(config: Config) -> Result<(), CliError> {
    let (toast_tx, mut toast_rx) = mpsc::unbounded_channel::<Toast>();
    let (mut console, join) = Console::new(&config, Arc::new(toast_tx))?;

    tokio::spawn(async move {
        while let Some(toast) = toast_rx.recv().await {
            println!("{}", toast);
        }
    });

    let mut countdown = console.autoplay.subscribe();
    tokio::spawn(async move {
        while countdown.changed().await.is_ok() {
            let state = countdown.borrow_and_update().clone();
            if state.phase == Phase::CountingDown && state.countdown > 0 {
                println!("Next episode in {}...", state.countdown);
            }
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let input = match parse_input(line) {
            Ok(input) => input,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        let result = match input {
            Input::Ended { media_id, progress } => {
                console.on_playback_ended(media_id, progress).await
            }
            Input::Cancel => match console.autoplay.cancel().await {
                Ok(true) => {
                    println!("Autoplay cancelled");
                    Ok(())
                }
                Ok(false) => Ok(()),
                Err(e) => Err(e.into()),
            },
            Input::Binge { media_id, progress } => console.on_binge(media_id, progress).await,
            Input::Select(choice) => console.on_select(choice).await,
            Input::Playlist {
                kind,
                media_id,
                progress,
            } => console.on_playlist(kind, media_id, progress).await,
            Input::Navigate(target) => console.on_navigate(target).await,
            Input::Status => {
                console.print_status();
                Ok(())
            }
            Input::Help => {
                println!("{}", HELP);
                Ok(())
            }
            Input::Quit => break,
        };

        if let Err(e) = result {
            println!("error: {}", e);
        }
    }

    console.autoplay.shutdown();
    let _ = join.await;
    Ok(())
}
