use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::session::{AutoplayState, COUNTDOWN_SECS, Phase, PlaybackContext, SourceKind};
use super::{AutoplayError, AutoplaySettings};
use crate::episode::Episode;
use crate::notify::{Notifier, Toast};
use crate::player::{DispatchError, PlayerLauncher};
use crate::store::{DEBRID_AUTOPLAY_INFO, KeyValueStore, SELECTED_STREAM};
use crate::stream::{
    DebridAutoplayInfo, SelectedStreamMemo, StreamDispatch, StreamSelector, dispatch_stream,
};

/// Owns the autoplay session and is its only writer.
///
/// Timers live outside (see `runner`); this type only exposes the transitions
/// they trigger: [`tick`](Self::tick) every second and
/// [`execute`](Self::execute) when the countdown deadline passes.
pub struct Orchestrator {
    settings: Arc<dyn AutoplaySettings>,
    store: Box<dyn KeyValueStore>,
    player: Arc<dyn PlayerLauncher>,
    streams: Arc<dyn StreamSelector>,
    notifier: Arc<dyn Notifier>,
    state: AutoplayState,
    context: Option<PlaybackContext>,
    state_tx: watch::Sender<AutoplayState>,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<dyn AutoplaySettings>,
        store: Box<dyn KeyValueStore>,
        player: Arc<dyn PlayerLauncher>,
        streams: Arc<dyn StreamSelector>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (state_tx, _) = watch::channel(AutoplayState::default());
        Self {
            settings,
            store,
            player,
            streams,
            notifier,
            state: AutoplayState::default(),
            context: None,
            state_tx,
        }
    }

    pub fn state(&self) -> &AutoplayState {
        &self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<AutoplayState> {
        self.state_tx.subscribe()
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    pub fn debrid_binge(&self) -> Option<DebridAutoplayInfo> {
        DEBRID_AUTOPLAY_INFO.read(self.store.as_ref())
    }

    pub fn selected_stream(&self) -> Option<SelectedStreamMemo> {
        SELECTED_STREAM.read(self.store.as_ref())
    }

    /// Whether finishing the current playback would have something to start
    pub fn has_next_episode(&self) -> bool {
        self.state.next_episode.is_some() || self.debrid_binge().is_some()
    }

    /// Record the debrid binge to continue once the current stream ends
    pub fn begin_debrid_binge(&mut self, info: DebridAutoplayInfo) {
        info!(
            target: "autoplay",
            media_id = info.entry.media_id,
            episode = info.episode_number,
            "debrid binge position saved"
        );
        self.write_binge(Some(&info));
    }

    /// Remember the stream the user picked so autoplay can continue from it
    pub fn remember_stream(&mut self, memo: SelectedStreamMemo) {
        debug!(
            target: "autoplay",
            torrent = %memo.torrent.name,
            batch = memo.torrent.is_batch,
            "stream remembered"
        );
        if let Err(e) = SELECTED_STREAM.write(self.store.as_mut(), Some(&memo)) {
            error!(target: "autoplay", error = %e, "failed to persist selected stream");
        }
    }

    /// Drop the remembered stream; the next debrid request is auto-selected
    pub fn forget_stream(&mut self) {
        if let Err(e) = SELECTED_STREAM.clear(self.store.as_mut()) {
            error!(target: "autoplay", error = %e, "failed to clear selected stream");
        }
    }

    fn write_binge(&mut self, info: Option<&DebridAutoplayInfo>) {
        if let Err(e) = DEBRID_AUTOPLAY_INFO.write(self.store.as_mut(), info) {
            error!(target: "autoplay", error = %e, "failed to persist debrid autoplay info");
        }
    }

    /// Begin the countdown towards the next episode.
    ///
    /// `next` is the episode the caller resolved (local playback); without it
    /// a pending debrid binge is continued instead.
    pub fn start(
        &mut self,
        context: PlaybackContext,
        next: Option<Episode>,
        kind: Option<SourceKind>,
    ) -> Result<(), AutoplayError> {
        if !self.settings.autoplay_enabled() {
            info!(target: "autoplay", "autoplay disabled in settings");
            return Err(AutoplayError::Disabled);
        }

        if self.state.is_active() {
            info!(target: "autoplay", "autoplay already active");
            return Err(AutoplayError::AlreadyActive);
        }

        let binge_pending = self.debrid_binge().is_some();
        let source = match (&next, binge_pending) {
            (Some(_), _) => kind.unwrap_or(SourceKind::Local),
            (None, true) => SourceKind::DebridStream,
            (None, false) => {
                info!(target: "autoplay", "no next episode found");
                return Err(AutoplayError::NoNextUnit);
            }
        };

        info!(
            target: "autoplay",
            next_episode = next.as_ref().map(|e| e.display_title.as_str()),
            source = ?source,
            "starting autoplay countdown"
        );

        self.state = AutoplayState {
            phase: Phase::CountingDown,
            countdown: COUNTDOWN_SECS,
            next_episode: next,
            source: Some(source),
        };
        self.context = Some(context);
        self.publish();
        Ok(())
    }

    /// One-second countdown step. Returns `false` once the countdown reached
    /// zero (or nothing is counting down) so the caller can stop ticking.
    pub fn tick(&mut self) -> bool {
        if self.state.phase != Phase::CountingDown {
            return false;
        }
        self.state.countdown = self.state.countdown.saturating_sub(1);
        self.publish();
        self.state.countdown > 0
    }

    /// Abort the countdown and end any debrid binge. Returns whether a session
    /// was active.
    pub fn cancel(&mut self) -> bool {
        if !self.state.is_active() {
            return false;
        }
        info!(target: "autoplay", "cancelling autoplay");
        self.reset();
        self.write_binge(None);
        true
    }

    /// Start the resolved unit. The session is back to idle afterwards whatever
    /// the outcome; errors are reported here and returned for the caller's
    /// information only.
    pub fn execute(&mut self) -> Result<(), AutoplayError> {
        if self.state.phase != Phase::CountingDown {
            debug!(
                target: "autoplay",
                phase = ?self.state.phase,
                "execute ignored, not counting down"
            );
            return Ok(());
        }

        info!(
            target: "autoplay",
            source = ?self.state.source,
            episode = self.state.next_episode.as_ref().map(|e| e.display_title.as_str()),
            "executing autoplay"
        );
        self.state.phase = Phase::Executing;
        self.publish();

        let outcome = match self.state.source {
            Some(SourceKind::Local) => self.play_local().map_err(AutoplayError::from),
            Some(SourceKind::DebridStream) => self.play_debrid().map_err(AutoplayError::from),
            None => Err(AutoplayError::UnknownSourceKind),
        };

        match &outcome {
            Err(AutoplayError::Dispatch(e)) => {
                error!(target: "autoplay", error = %e, "error executing autoplay");
                self.notifier.notify(Toast::error("Failed to play next episode"));
            }
            Err(e) => warn!(target: "autoplay", error = %e, "autoplay not executed"),
            Ok(()) => {}
        }

        info!(target: "autoplay", "autoplay execution finished, resetting state");
        self.reset();
        outcome
    }

    fn reset(&mut self) {
        self.state = AutoplayState::default();
        self.context = None;
        self.publish();
    }

    fn play_local(&self) -> Result<(), DispatchError> {
        let Some(episode) = self.state.next_episode.as_ref() else {
            debug!(target: "autoplay", "no episode resolved for local playback");
            return Ok(());
        };
        let Some(path) = episode.local_path() else {
            debug!(
                target: "autoplay",
                episode = episode.episode_number,
                "episode has no local file"
            );
            return Ok(());
        };
        let media_id = self.context.as_ref().map(|c| c.media_id).unwrap_or_default();

        self.player.play(path, media_id, episode)?;
        self.notifier.notify(Toast::info("Playing next episode"));
        Ok(())
    }

    fn play_debrid(&mut self) -> Result<(), DispatchError> {
        let Some(info) = self.debrid_binge() else {
            warn!(target: "autoplay", "debrid binge ended before execution");
            return Ok(());
        };
        let memo = self.selected_stream();

        match dispatch_stream(self.streams.as_ref(), memo.as_ref(), info.request())? {
            StreamDispatch::BatchFile(moved) => self.remember_stream(moved),
            StreamDispatch::Auto => {}
        }

        match info.advance() {
            Some((next_info, next_episode)) => {
                debug!(
                    target: "autoplay",
                    episode = next_info.episode_number,
                    "debrid binge advanced"
                );
                self.write_binge(Some(&next_info));
                self.state.next_episode = Some(next_episode);
                self.publish();
            }
            None => {
                info!(target: "autoplay", "no further streamable episode, debrid binge ended");
                self.write_binge(None);
            }
        }

        self.notifier.notify(Toast::info("Requesting next episode"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::MediaRef;
    use crate::episode::fixtures::{episode, local_episode};
    use crate::notify::ToastLevel;
    use crate::player::fixtures::RecordingLauncher;
    use crate::store::MemoryStore;
    use crate::stream::fixtures::{RecordingSelector, Selection, batch_memo};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    struct Harness {
        orchestrator: Orchestrator,
        player: Arc<RecordingLauncher>,
        streams: Arc<RecordingSelector>,
        toasts: mpsc::UnboundedReceiver<Toast>,
    }

    fn harness_with(
        enabled: bool,
        store: MemoryStore,
        player: RecordingLauncher,
        streams: RecordingSelector,
    ) -> Harness {
        let player = Arc::new(player);
        let streams = Arc::new(streams);
        let (tx, toasts) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(
            Arc::new(AtomicBool::new(enabled)),
            Box::new(store),
            player.clone(),
            streams.clone(),
            Arc::new(tx),
        );
        Harness {
            orchestrator,
            player,
            streams,
            toasts,
        }
    }

    fn harness() -> Harness {
        harness_with(
            true,
            MemoryStore::new(),
            RecordingLauncher::default(),
            RecordingSelector::default(),
        )
    }

    fn ctx() -> PlaybackContext {
        PlaybackContext {
            media_id: 21,
            progress_number: 1,
        }
    }

    fn binge_at(episodes: Vec<Episode>, at: i32) -> DebridAutoplayInfo {
        let current = episodes
            .iter()
            .find(|e| e.progress_number == at)
            .cloned()
            .unwrap();
        DebridAutoplayInfo::new(MediaRef::new(21), episodes, &current).unwrap()
    }

    fn assert_baseline(state: &AutoplayState) {
        assert_eq!(state.phase, Phase::Idle);
        assert!(!state.is_active());
        assert_eq!(state.countdown, COUNTDOWN_SECS);
        assert!(state.next_episode.is_none());
        assert!(state.source.is_none());
    }

    #[test]
    fn test_disabled_setting_rejects_start() {
        let mut h = harness_with(
            false,
            MemoryStore::new(),
            RecordingLauncher::default(),
            RecordingSelector::default(),
        );
        let err = h
            .orchestrator
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .unwrap_err();
        assert_eq!(err, AutoplayError::Disabled);
        assert_baseline(h.orchestrator.state());
    }

    #[test]
    fn test_nothing_to_play() {
        let mut h = harness();
        assert!(!h.orchestrator.has_next_episode());
        let err = h.orchestrator.start(ctx(), None, None).unwrap_err();
        assert_eq!(err, AutoplayError::NoNextUnit);
        assert_baseline(h.orchestrator.state());
    }

    #[test]
    fn test_start_seeds_countdown_with_local_default() {
        let mut h = harness();
        h.orchestrator
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .unwrap();

        let state = h.orchestrator.state();
        assert_eq!(state.phase, Phase::CountingDown);
        assert_eq!(state.countdown, 5);
        assert_eq!(state.source, Some(SourceKind::Local));
        assert_eq!(state.next_episode.as_ref().map(|e| e.progress_number), Some(2));
    }

    #[test]
    fn test_reentrant_start_leaves_session_alone() {
        let mut h = harness();
        h.orchestrator
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .unwrap();
        h.orchestrator.tick();

        let err = h
            .orchestrator
            .start(ctx(), Some(local_episode(3, "/a/ep3.mkv")), None)
            .unwrap_err();

        assert_eq!(err, AutoplayError::AlreadyActive);
        let state = h.orchestrator.state();
        assert_eq!(state.countdown, 4);
        assert_eq!(state.next_episode.as_ref().map(|e| e.progress_number), Some(2));
    }

    #[test]
    fn test_tick_floors_at_zero() {
        let mut h = harness();
        h.orchestrator
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .unwrap();

        let running: Vec<bool> = (0..5).map(|_| h.orchestrator.tick()).collect();
        assert_eq!(running, vec![true, true, true, true, false]);
        assert_eq!(h.orchestrator.state().countdown, 0);

        assert!(!h.orchestrator.tick());
        assert_eq!(h.orchestrator.state().countdown, 0);
    }

    #[test]
    fn test_execute_local_plays_file_and_resets() {
        let mut h = harness();
        h.orchestrator
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .unwrap();

        h.orchestrator.execute().unwrap();

        assert_eq!(h.player.take(), vec![("/a/ep2.mkv".to_string(), 21, 2)]);
        assert_baseline(h.orchestrator.state());
        assert_eq!(h.toasts.try_recv().unwrap(), Toast::info("Playing next episode"));
    }

    #[test]
    fn test_execute_local_without_file_plays_nothing() {
        let mut h = harness();
        h.orchestrator.start(ctx(), Some(episode(2)), None).unwrap();

        h.orchestrator.execute().unwrap();

        assert!(h.player.take().is_empty());
        assert_baseline(h.orchestrator.state());
    }

    #[test]
    fn test_dispatch_failure_is_reported_and_resets() {
        let mut h = harness_with(
            true,
            MemoryStore::new(),
            RecordingLauncher::failing(),
            RecordingSelector::default(),
        );
        h.orchestrator
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .unwrap();

        let err = h.orchestrator.execute().unwrap_err();

        assert!(matches!(err, AutoplayError::Dispatch(_)));
        assert_baseline(h.orchestrator.state());
        let toast = h.toasts.try_recv().unwrap();
        assert_eq!(toast.level, ToastLevel::Error);
        assert_eq!(toast.message, "Failed to play next episode");
    }

    #[test]
    fn test_cancel_resets_and_ends_binge() {
        let mut store = MemoryStore::new();
        DEBRID_AUTOPLAY_INFO
            .write(&mut store, Some(&binge_at(vec![episode(1), episode(2)], 1)))
            .unwrap();
        let mut h = harness_with(
            true,
            store,
            RecordingLauncher::default(),
            RecordingSelector::default(),
        );
        h.orchestrator.start(ctx(), None, None).unwrap();

        assert!(h.orchestrator.cancel());

        assert_baseline(h.orchestrator.state());
        assert!(h.orchestrator.debrid_binge().is_none());
        // A late deadline must not dispatch anything
        h.orchestrator.execute().unwrap();
        assert!(h.streams.take().is_empty());
    }

    #[test]
    fn test_cancel_when_idle_is_noop() {
        let mut store = MemoryStore::new();
        DEBRID_AUTOPLAY_INFO
            .write(&mut store, Some(&binge_at(vec![episode(1), episode(2)], 1)))
            .unwrap();
        let mut h = harness_with(
            true,
            store,
            RecordingLauncher::default(),
            RecordingSelector::default(),
        );

        assert!(!h.orchestrator.cancel());
        assert!(h.orchestrator.debrid_binge().is_some());
    }

    #[test]
    fn test_debrid_binge_advances_then_ends() {
        let mut third = episode(3);
        third.anidb_episode = None;
        let episodes = vec![episode(1), episode(2), third];

        let mut h = harness();
        h.orchestrator.begin_debrid_binge(binge_at(episodes, 1));
        assert!(h.orchestrator.has_next_episode());

        h.orchestrator.start(ctx(), None, None).unwrap();
        assert_eq!(h.orchestrator.state().source, Some(SourceKind::DebridStream));
        assert!(h.orchestrator.state().next_episode.is_none());
        h.orchestrator.execute().unwrap();

        let binge = h.orchestrator.debrid_binge().unwrap();
        assert_eq!(binge.episode_number, 2);
        assert_eq!(binge.anidb_episode, "2");
        assert_baseline(h.orchestrator.state());

        h.orchestrator.start(ctx(), None, None).unwrap();
        h.orchestrator.execute().unwrap();
        assert!(h.orchestrator.debrid_binge().is_none());

        let calls = h.streams.take();
        assert_eq!(calls.len(), 2);
        match (&calls[0], &calls[1]) {
            (Selection::Auto(first), Selection::Auto(second)) => {
                assert_eq!(first.episode_number, 1);
                assert_eq!(first.anidb_episode, "1");
                assert_eq!(second.episode_number, 2);
            }
            other => panic!("expected auto selections, got {:?}", other),
        }

        // Binge over, nothing left
        assert_eq!(
            h.orchestrator.start(ctx(), None, None).unwrap_err(),
            AutoplayError::NoNextUnit
        );
    }

    #[test]
    fn test_debrid_batch_continues_next_file_and_moves_cursor() {
        let mut store = MemoryStore::new();
        DEBRID_AUTOPLAY_INFO
            .write(
                &mut store,
                Some(&binge_at(vec![episode(1), episode(2), episode(3)], 2)),
            )
            .unwrap();
        SELECTED_STREAM
            .write(&mut store, Some(&batch_memo(1, &[1, 2, 3])))
            .unwrap();
        let mut h = harness_with(
            true,
            store,
            RecordingLauncher::default(),
            RecordingSelector::default(),
        );

        h.orchestrator.start(ctx(), None, None).unwrap();
        h.orchestrator.execute().unwrap();

        match h.streams.take().as_slice() {
            [Selection::Explicit(sel)] => {
                assert_eq!(sel.chosen_file_id.as_deref(), Some("2"));
                assert_eq!(sel.request.episode_number, 2);
            }
            other => panic!("expected one explicit selection, got {:?}", other),
        }
        let memo = h.orchestrator.selected_stream().unwrap();
        assert_eq!(memo.batch_files.unwrap().current, 2);
        assert_eq!(h.orchestrator.debrid_binge().unwrap().episode_number, 3);
    }

    #[test]
    fn test_batch_memo_of_other_media_is_not_replayed() {
        let mut store = MemoryStore::new();
        DEBRID_AUTOPLAY_INFO
            .write(
                &mut store,
                Some(&binge_at(vec![episode(1), episode(2), episode(3)], 2)),
            )
            .unwrap();
        let mut memo = batch_memo(1, &[1, 2, 3]);
        memo.entry = MediaRef::new(99);
        SELECTED_STREAM.write(&mut store, Some(&memo)).unwrap();
        let mut h = harness_with(
            true,
            store,
            RecordingLauncher::default(),
            RecordingSelector::default(),
        );

        h.orchestrator.start(ctx(), None, None).unwrap();
        h.orchestrator.execute().unwrap();

        match h.streams.take().as_slice() {
            [Selection::Auto(req)] => {
                assert_eq!(req.media_id, 21);
                assert_eq!(req.episode_number, 2);
            }
            other => panic!("expected one auto selection, got {:?}", other),
        }
        // The other title's memo is left as it was
        assert_eq!(h.orchestrator.selected_stream(), Some(memo));
    }

    #[test]
    fn test_forget_stream_clears_memo() {
        let mut store = MemoryStore::new();
        SELECTED_STREAM
            .write(&mut store, Some(&batch_memo(1, &[1, 2])))
            .unwrap();
        let mut h = harness_with(
            true,
            store,
            RecordingLauncher::default(),
            RecordingSelector::default(),
        );

        h.orchestrator.forget_stream();
        assert!(h.orchestrator.selected_stream().is_none());
    }

    #[test]
    fn test_explicit_episode_wins_over_binge() {
        let mut h = harness();
        h.orchestrator
            .begin_debrid_binge(binge_at(vec![episode(1), episode(2)], 1));

        h.orchestrator
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .unwrap();
        assert_eq!(h.orchestrator.state().source, Some(SourceKind::Local));
        h.orchestrator.execute().unwrap();

        assert_eq!(h.player.take().len(), 1);
        assert!(h.streams.take().is_empty());
        // The binge is untouched by a local advance
        assert_eq!(h.orchestrator.debrid_binge().unwrap().episode_number, 1);
    }

    #[test]
    fn test_debrid_selector_failure_keeps_binge_position() {
        let mut h = harness_with(
            true,
            MemoryStore::new(),
            RecordingLauncher::default(),
            RecordingSelector::failing(),
        );
        h.orchestrator
            .begin_debrid_binge(binge_at(vec![episode(1), episode(2)], 1));
        h.orchestrator.start(ctx(), None, None).unwrap();

        assert!(h.orchestrator.execute().is_err());
        assert_baseline(h.orchestrator.state());
        assert_eq!(h.orchestrator.debrid_binge().unwrap().episode_number, 1);
    }

    #[test]
    fn test_observers_see_transitions() {
        let mut h = harness();
        let mut rx = h.orchestrator.subscribe();

        h.orchestrator
            .start(ctx(), Some(local_episode(2, "/a/ep2.mkv")), None)
            .unwrap();
        assert_eq!(rx.borrow_and_update().phase, Phase::CountingDown);

        h.orchestrator.tick();
        assert_eq!(rx.borrow_and_update().countdown, 4);

        h.orchestrator.execute().unwrap();
        assert_eq!(*rx.borrow_and_update(), AutoplayState::default());
    }
}
