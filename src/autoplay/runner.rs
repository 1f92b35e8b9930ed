use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, Sleep, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::orchestrator::Orchestrator;
use super::session::{AutoplayState, COUNTDOWN_SECS, PlaybackContext, SourceKind};
use super::AutoplayError;
use crate::episode::Episode;
use crate::stream::{DebridAutoplayInfo, SelectedStreamMemo};

const TICK: Duration = Duration::from_secs(1);

enum Command {
    Start {
        context: PlaybackContext,
        next: Option<Episode>,
        kind: Option<SourceKind>,
        reply: oneshot::Sender<Result<(), AutoplayError>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    BeginBinge {
        info: DebridAutoplayInfo,
        reply: oneshot::Sender<()>,
    },
    RememberStream {
        memo: SelectedStreamMemo,
        reply: oneshot::Sender<()>,
    },
    ForgetStream {
        reply: oneshot::Sender<()>,
    },
    HasNext {
        reply: oneshot::Sender<bool>,
    },
    SelectedStream {
        reply: oneshot::Sender<Option<SelectedStreamMemo>>,
    },
}

/// The two timers of a session. Dropping them cancels them.
#[derive(Default)]
struct Timers {
    tick: Option<Interval>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl Timers {
    fn arm(&mut self) {
        let now = Instant::now();
        self.tick = Some(interval_at(now + TICK, TICK));
        self.deadline = Some(Box::pin(sleep_until(
            now + Duration::from_secs(u64::from(COUNTDOWN_SECS)),
        )));
    }

    fn clear(&mut self) {
        self.tick = None;
        self.deadline = None;
    }
}

async fn next_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn expired(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

/// Handle to the autoplay task. Cheap to clone; the task stops when every
/// handle is dropped or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct Autoplay {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<AutoplayState>,
    shutdown: CancellationToken,
}

impl Autoplay {
    pub fn spawn(orchestrator: Orchestrator) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let state = orchestrator.subscribe();
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(run(orchestrator, rx, shutdown.clone()));
        (
            Self {
                commands: tx,
                state,
                shutdown,
            },
            join,
        )
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, AutoplayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| AutoplayError::Closed)?;
        rx.await.map_err(|_| AutoplayError::Closed)
    }

    /// Start the countdown towards the next episode. Rejected while a session
    /// is already running.
    pub async fn start(
        &self,
        context: PlaybackContext,
        next: Option<Episode>,
        kind: Option<SourceKind>,
    ) -> Result<(), AutoplayError> {
        self.request(|reply| Command::Start {
            context,
            next,
            kind,
            reply,
        })
        .await?
    }

    /// Returns whether a countdown was actually cancelled
    pub async fn cancel(&self) -> Result<bool, AutoplayError> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    pub async fn begin_debrid_binge(&self, info: DebridAutoplayInfo) -> Result<(), AutoplayError> {
        self.request(|reply| Command::BeginBinge { info, reply }).await
    }

    pub async fn remember_stream(&self, memo: SelectedStreamMemo) -> Result<(), AutoplayError> {
        self.request(|reply| Command::RememberStream { memo, reply })
            .await
    }

    pub async fn forget_stream(&self) -> Result<(), AutoplayError> {
        self.request(|reply| Command::ForgetStream { reply }).await
    }

    pub async fn has_next_episode(&self) -> Result<bool, AutoplayError> {
        self.request(|reply| Command::HasNext { reply }).await
    }

    pub async fn selected_stream(&self) -> Result<Option<SelectedStreamMemo>, AutoplayError> {
        self.request(|reply| Command::SelectedStream { reply }).await
    }

    pub fn state(&self) -> AutoplayState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AutoplayState> {
        self.state.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run(
    mut orchestrator: Orchestrator,
    mut commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
) {
    let mut timers = Timers::default();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(target: "autoplay", "autoplay task shutting down");
                break;
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    debug!(target: "autoplay", "all handles dropped");
                    break;
                };
                handle(&mut orchestrator, &mut timers, cmd);
            }
            _ = next_tick(&mut timers.tick) => {
                if !orchestrator.tick() {
                    timers.tick = None;
                }
            }
            _ = expired(&mut timers.deadline) => {
                timers.clear();
                let _ = orchestrator.execute();
            }
        }
    }

    timers.clear();
}

fn handle(orchestrator: &mut Orchestrator, timers: &mut Timers, cmd: Command) {
    match cmd {
        Command::Start {
            context,
            next,
            kind,
            reply,
        } => {
            let result = orchestrator.start(context, next, kind);
            if result.is_ok() {
                timers.arm();
            }
            let _ = reply.send(result);
        }
        Command::Cancel { reply } => {
            timers.clear();
            let _ = reply.send(orchestrator.cancel());
        }
        Command::BeginBinge { info, reply } => {
            orchestrator.begin_debrid_binge(info);
            let _ = reply.send(());
        }
        Command::RememberStream { memo, reply } => {
            orchestrator.remember_stream(memo);
            let _ = reply.send(());
        }
        Command::ForgetStream { reply } => {
            orchestrator.forget_stream();
            let _ = reply.send(());
        }
        Command::HasNext { reply } => {
            let _ = reply.send(orchestrator.has_next_episode());
        }
        Command::SelectedStream { reply } => {
            let _ = reply.send(orchestrator.selected_stream());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoplay::Phase;
    use crate::episode::MediaRef;
    use crate::episode::fixtures::{episode, local_episode};
    use crate::notify::LogNotifier;
    use crate::player::fixtures::RecordingLauncher;
    use crate::store::MemoryStore;
    use crate::stream::fixtures::RecordingSelector;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use tokio::time::{advance, sleep};

    fn spawn_with(enabled: bool, player: Arc<RecordingLauncher>) -> (Autoplay, JoinHandle<()>) {
        let orchestrator = Orchestrator::new(
            Arc::new(AtomicBool::new(enabled)),
            Box::new(MemoryStore::new()),
            player,
            Arc::new(RecordingSelector::default()),
            Arc::new(LogNotifier),
        );
        Autoplay::spawn(orchestrator)
    }

    fn ctx() -> PlaybackContext {
        PlaybackContext {
            media_id: 21,
            progress_number: 1,
        }
    }

    /// Let the autoplay task process whatever is ready
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_after_five_seconds() {
        let player = Arc::new(RecordingLauncher::default());
        let (autoplay, _join) = spawn_with(true, player.clone());

        autoplay
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .await
            .unwrap();
        assert_eq!(autoplay.state().phase, Phase::CountingDown);

        advance(Duration::from_millis(4900)).await;
        settle().await;
        assert!(player.take().is_empty());
        assert!(autoplay.state().is_active());

        advance(Duration::from_millis(200)).await;
        settle().await;

        assert_eq!(player.take(), vec![("/a/ep2.mkv".to_string(), 21, 2)]);
        assert_eq!(autoplay.state(), AutoplayState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_ticks_once_per_second() {
        let player = Arc::new(RecordingLauncher::default());
        let (autoplay, _join) = spawn_with(true, player);

        autoplay
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            advance(Duration::from_secs(1)).await;
            settle().await;
            seen.push(autoplay.state().countdown);
        }
        assert_eq!(seen, vec![4, 3, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_playback() {
        let player = Arc::new(RecordingLauncher::default());
        let (autoplay, _join) = spawn_with(true, player.clone());

        autoplay
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .await
            .unwrap();
        advance(Duration::from_secs(2)).await;
        settle().await;

        assert!(autoplay.cancel().await.unwrap());
        assert_eq!(autoplay.state(), AutoplayState::default());

        sleep(Duration::from_secs(10)).await;
        settle().await;
        assert!(player.take().is_empty());
        assert_eq!(autoplay.state(), AutoplayState::default());
        assert!(!autoplay.cancel().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_schedules_nothing() {
        let player = Arc::new(RecordingLauncher::default());
        let (autoplay, _join) = spawn_with(false, player.clone());

        let err = autoplay
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .await
            .unwrap_err();
        assert_eq!(err, AutoplayError::Disabled);

        sleep(Duration::from_secs(10)).await;
        settle().await;
        assert!(player.take().is_empty());
        assert_eq!(autoplay.state(), AutoplayState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_rejected_and_first_still_fires() {
        let player = Arc::new(RecordingLauncher::default());
        let (autoplay, _join) = spawn_with(true, player.clone());

        autoplay
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .await
            .unwrap();
        advance(Duration::from_secs(3)).await;
        settle().await;

        let err = autoplay
            .start(ctx(), Some(local_episode(3, "/a/ep3.mkv")), None)
            .await
            .unwrap_err();
        assert_eq!(err, AutoplayError::AlreadyActive);
        assert_eq!(autoplay.state().countdown, 2);

        sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(player.take(), vec![("/a/ep2.mkv".to_string(), 21, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_binge_through_handle() {
        let player = Arc::new(RecordingLauncher::default());
        let (autoplay, _join) = spawn_with(true, player);

        assert!(!autoplay.has_next_episode().await.unwrap());
        let info = DebridAutoplayInfo::new(
            MediaRef::new(21),
            vec![episode(1), episode(2)],
            &episode(1),
        )
        .unwrap();
        autoplay.begin_debrid_binge(info).await.unwrap();
        assert!(autoplay.has_next_episode().await.unwrap());

        autoplay.start(ctx(), None, None).await.unwrap();
        assert_eq!(autoplay.state().source, Some(SourceKind::DebridStream));

        sleep(Duration::from_secs(6)).await;
        settle().await;
        assert!(!autoplay.state().is_active());
        // Binge now points at episode 2, the last one
        assert!(autoplay.has_next_episode().await.unwrap());
        autoplay.start(ctx(), None, None).await.unwrap();
        sleep(Duration::from_secs(6)).await;
        settle().await;
        assert!(!autoplay.has_next_episode().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_task() {
        let player = Arc::new(RecordingLauncher::default());
        let (autoplay, join) = spawn_with(true, player.clone());

        autoplay
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .await
            .unwrap();
        autoplay.shutdown();
        join.await.unwrap();

        sleep(Duration::from_secs(10)).await;
        assert!(player.take().is_empty());
        assert_eq!(autoplay.cancel().await, Err(AutoplayError::Closed));
    }
}
