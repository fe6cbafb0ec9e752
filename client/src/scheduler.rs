use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::address::{group_for_time, groups_overlapping};
use crate::buffer;
use crate::config::FetchConfig;
use crate::fetch::{FetchError, FetchRequest, FetchTransport};
use crate::player::Player;
use crate::protocol::Role;
use crate::session::SessionError;

/// Groups re-fetched behind the landing point of a cursor jump.
const JUMP_BACK_GROUPS: u64 = 1;
/// Groups fetched beyond the landing point of an explicit seek.
const SEEK_LOOKAHEAD_GROUPS: u64 = 2;

/// Cross-task nudges the scheduler drains at iteration boundaries.
#[derive(Debug, Clone, Copy)]
pub enum SchedulerNotice {
    /// The playhead moved abruptly; prime the landing window before
    /// streaming on.
    SeekTo(f64),
    /// A join (or rejoin) completed; one cursor jump is allowed again.
    Rejoined,
}

struct FetchState {
    next_group: u64,
    buffered: HashSet<u64>,
    jumped: bool,
    pending: VecDeque<Bytes>,
    appending: bool,
}

/// Keeps the player fed: fetches groups around the effective playhead,
/// appends them in arrival order and evicts what the window has outgrown.
///
/// Followers schedule around the leader-reported position so their buffers
/// track the shared playhead even while their own lags. Any fetch or append
/// failure ends the run; the session treats both as fatal.
pub struct Scheduler {
    player: Arc<dyn Player>,
    transport: Arc<dyn FetchTransport>,
    config: FetchConfig,
    track: String,
    role_rx: watch::Receiver<Role>,
    leader_pos_rx: watch::Receiver<Option<f64>>,
    notice_rx: mpsc::UnboundedReceiver<SchedulerNotice>,
    active: Arc<AtomicBool>,
    state: FetchState,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        player: Arc<dyn Player>,
        transport: Arc<dyn FetchTransport>,
        config: FetchConfig,
        track: String,
        role_rx: watch::Receiver<Role>,
        leader_pos_rx: watch::Receiver<Option<f64>>,
        notice_rx: mpsc::UnboundedReceiver<SchedulerNotice>,
        active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            player,
            transport,
            config,
            track,
            role_rx,
            leader_pos_rx,
            notice_rx,
            active,
            state: FetchState {
                next_group: 1,
                buffered: HashSet::new(),
                jumped: false,
                pending: VecDeque::new(),
                appending: false,
            },
        }
    }

    pub async fn run(mut self) -> Result<(), SessionError> {
        timeout(self.config.handshake_timeout, self.player.wait_until_ready())
            .await
            .map_err(|_| SessionError::HandshakeTimeout)?
            .map_err(SessionError::Player)?;

        // Group 0 carries the track's initialization segment. It goes in
        // before any media and is never tracked as buffered content.
        self.fetch_into_pending(FetchRequest::init_segment(&self.track))
            .await?;
        self.drain_appends().await?;
        tracing::info!("Initialized track {}", self.track);

        while self.active.load(Ordering::Relaxed) {
            self.drain_notices().await?;
            let effective = self.effective_time();
            self.maybe_jump_cursor(effective);
            self.fetch_step(effective).await?;
            self.evict(effective).await?;
            tokio::time::sleep(self.config.tick_interval).await;
        }
        Ok(())
    }

    async fn drain_notices(&mut self) -> Result<(), SessionError> {
        while let Ok(notice) = self.notice_rx.try_recv() {
            match notice {
                SchedulerNotice::SeekTo(target) => self.prime_seek_window(target).await?,
                SchedulerNotice::Rejoined => self.state.jumped = false,
            }
        }
        Ok(())
    }

    /// Followers fetch around where the leader says playback is; their own
    /// playhead may still be catching up.
    fn effective_time(&self) -> f64 {
        match *self.role_rx.borrow() {
            Role::Leader => self.player.current_time(),
            Role::Follower => {
                (*self.leader_pos_rx.borrow()).unwrap_or_else(|| self.player.current_time())
            }
        }
    }

    /// Jump the cursor to the playback region, at most once per join.
    fn maybe_jump_cursor(&mut self, effective: f64) {
        if self.state.jumped {
            return;
        }
        let group = group_for_time(effective, self.config.groups_per_second);
        if group > self.state.next_group && group - self.state.next_group > self.groups_ahead() {
            let target = group.saturating_sub(JUMP_BACK_GROUPS).max(1);
            tracing::info!(
                "Fetch cursor jumping from group {} to {}",
                self.state.next_group,
                target
            );
            self.state.next_group = target;
            self.state.jumped = true;
        }
    }

    async fn fetch_step(&mut self, effective: f64) -> Result<(), SessionError> {
        let effective_group = group_for_time(effective, self.config.groups_per_second);
        let max_group = effective_group + self.groups_ahead();
        if self.state.next_group > max_group {
            return Ok(());
        }
        let group = self.state.next_group;
        if !self.state.buffered.contains(&group) {
            self.fetch_group(group).await?;
        }
        self.state.next_group += 1;
        Ok(())
    }

    async fn prime_seek_window(&mut self, target: f64) -> Result<(), SessionError> {
        let start = group_for_time(target, self.config.groups_per_second).max(1);
        let end = start + SEEK_LOOKAHEAD_GROUPS;
        for group in start..=end {
            if !self.state.buffered.contains(&group) {
                self.fetch_group(group).await?;
            }
        }
        // Streaming resumes right past the primed window.
        self.state.next_group = end + 1;
        Ok(())
    }

    async fn fetch_group(&mut self, group: u64) -> Result<(), SessionError> {
        let request = FetchRequest::for_group(&self.track, group, self.config.objects_per_group);
        self.fetch_into_pending(request).await?;
        self.drain_appends().await?;
        // Only fully appended groups count as buffered.
        self.state.buffered.insert(group);
        tracing::debug!("Buffered group {group}");
        Ok(())
    }

    async fn fetch_into_pending(&mut self, request: FetchRequest) -> Result<(), SessionError> {
        let deadline = self.config.fetch_timeout;
        let mut stream = timeout(deadline, self.transport.fetch(request))
            .await
            .map_err(|_| SessionError::Fetch(FetchError::Timeout(deadline)))?
            .map_err(SessionError::Fetch)?;
        loop {
            let item = timeout(deadline, stream.next())
                .await
                .map_err(|_| SessionError::Fetch(FetchError::Timeout(deadline)))?;
            match item {
                Some(Ok(object)) => self.state.pending.push_back(object.payload),
                Some(Err(err)) => return Err(SessionError::Fetch(err)),
                None => break,
            }
        }
        Ok(())
    }

    /// Feed queued payloads to the player, strictly in arrival order, with
    /// at most one append in flight.
    async fn drain_appends(&mut self) -> Result<(), SessionError> {
        if self.state.appending {
            return Ok(());
        }
        self.state.appending = true;
        while let Some(payload) = self.state.pending.pop_front() {
            if let Err(err) = self.player.append(payload).await {
                self.state.appending = false;
                return Err(SessionError::Append(err));
            }
        }
        self.state.appending = false;
        Ok(())
    }

    async fn evict(&mut self, effective: f64) -> Result<(), SessionError> {
        let ranges = self.player.buffered();
        let Some(eviction) = buffer::plan(
            &ranges,
            effective,
            self.config.back_buffer,
            self.config.fetch_ahead,
            self.config.max_buffer,
        ) else {
            return Ok(());
        };
        self.player
            .remove(eviction.start, eviction.end)
            .await
            .map_err(SessionError::Player)?;
        for group in groups_overlapping(eviction.start, eviction.end, self.config.groups_per_second) {
            self.state.buffered.remove(&group);
        }
        tracing::debug!("Evicted [{:.2}s, {:.2}s)", eviction.start, eviction.end);
        Ok(())
    }

    fn groups_ahead(&self) -> u64 {
        (self.config.fetch_ahead * self.config.groups_per_second).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchedObject, ObjectStream};
    use crate::player::{PlayerError, SimulatedPlayer};
    use async_trait::async_trait;
    use futures_util::stream;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct ScriptedTransport {
        requests: Mutex<Vec<FetchRequest>>,
        fail_group: Option<u64>,
        empty_payloads: bool,
    }

    impl ScriptedTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                fail_group: None,
                empty_payloads: false,
            })
        }

        fn failing_at(group: u64) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                fail_group: Some(group),
                empty_payloads: false,
            })
        }

        fn with_empty_payloads() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                fail_group: None,
                empty_payloads: true,
            })
        }

        fn requested_groups(&self) -> Vec<u64> {
            self.requests
                .lock()
                .iter()
                .map(|request| request.start.group)
                .collect()
        }
    }

    #[async_trait]
    impl FetchTransport for ScriptedTransport {
        async fn fetch(&self, request: FetchRequest) -> Result<ObjectStream, FetchError> {
            self.requests.lock().push(request.clone());
            if self.fail_group == Some(request.start.group) {
                return Err(FetchError::Transport("scripted failure".into()));
            }
            let payload = if self.empty_payloads {
                Bytes::new()
            } else {
                Bytes::from_static(b"segment")
            };
            let object = FetchedObject {
                address: request.start,
                payload,
            };
            Ok(stream::iter([Ok(object)]).boxed())
        }
    }

    struct Rig {
        scheduler: Scheduler,
        player: Arc<SimulatedPlayer>,
        transport: Arc<ScriptedTransport>,
        notice_tx: mpsc::UnboundedSender<SchedulerNotice>,
        leader_tx: watch::Sender<Option<f64>>,
    }

    fn rig_with(transport: Arc<ScriptedTransport>, role: Role, leader_pos: Option<f64>) -> Rig {
        let player = Arc::new(SimulatedPlayer::with_segment_span(1.0));
        let (_role_tx, role_rx) = watch::channel(role);
        let (leader_tx, leader_pos_rx) = watch::channel(leader_pos);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(
            Arc::clone(&player) as Arc<dyn Player>,
            Arc::clone(&transport) as Arc<dyn FetchTransport>,
            FetchConfig::default(),
            "bbb/video".to_string(),
            role_rx,
            leader_pos_rx,
            notice_rx,
            // Leaving the flag down lets `run` initialize and return.
            Arc::new(AtomicBool::new(false)),
        );
        Rig {
            scheduler,
            player,
            transport,
            notice_tx,
            leader_tx,
        }
    }

    fn rig(role: Role, leader_pos: Option<f64>) -> Rig {
        rig_with(ScriptedTransport::new(), role, leader_pos)
    }

    #[tokio::test]
    async fn a_run_opens_with_the_init_segment() {
        let test = rig(Role::Leader, None);
        // The active flag is down, so the run initializes and returns.
        test.scheduler.run().await.unwrap();

        assert_eq!(test.transport.requested_groups(), vec![0]);
        assert_eq!(test.player.appended_segments(), 1);
    }

    #[tokio::test]
    async fn the_window_is_fetched_one_group_per_iteration() {
        let mut test = rig(Role::Leader, None);
        test.scheduler.state.next_group = 5;

        // Playhead mid-group 5 allows groups up to 5 + 5 of look-ahead.
        for _ in 0..7 {
            test.scheduler.fetch_step(5.25).await.unwrap();
        }

        assert_eq!(test.transport.requested_groups(), vec![5, 6, 7, 8, 9, 10]);
        assert_eq!(test.scheduler.state.next_group, 11);
        for group in 5..=10 {
            assert!(test.scheduler.state.buffered.contains(&group));
        }
    }

    #[tokio::test]
    async fn buffered_groups_are_skipped_but_the_cursor_still_advances() {
        let mut test = rig(Role::Leader, None);
        test.scheduler.state.next_group = 6;
        test.scheduler.state.buffered.insert(6);

        test.scheduler.fetch_step(5.25).await.unwrap();

        assert!(test.transport.requested_groups().is_empty());
        assert_eq!(test.scheduler.state.next_group, 7);
    }

    #[tokio::test]
    async fn the_cursor_jumps_to_the_leader_region_once_per_join() {
        let mut test = rig(Role::Follower, Some(120.5));

        let effective = test.scheduler.effective_time();
        test.scheduler.maybe_jump_cursor(effective);
        assert_eq!(test.scheduler.state.next_group, 119);
        assert!(test.scheduler.state.jumped);

        // A further leader move does not jump again.
        test.leader_tx.send(Some(300.0)).unwrap();
        let effective = test.scheduler.effective_time();
        test.scheduler.maybe_jump_cursor(effective);
        assert_eq!(test.scheduler.state.next_group, 119);

        // A rejoin re-arms exactly one more jump.
        test.notice_tx.send(SchedulerNotice::Rejoined).unwrap();
        test.scheduler.drain_notices().await.unwrap();
        let effective = test.scheduler.effective_time();
        test.scheduler.maybe_jump_cursor(effective);
        assert_eq!(test.scheduler.state.next_group, 299);
    }

    #[tokio::test]
    async fn a_cursor_already_in_range_never_jumps() {
        let mut test = rig(Role::Leader, None);
        test.scheduler.state.next_group = 4;
        test.scheduler.maybe_jump_cursor(6.0);
        assert_eq!(test.scheduler.state.next_group, 4);
        assert!(!test.scheduler.state.jumped);
    }

    #[tokio::test]
    async fn followers_fall_back_to_their_own_playhead() {
        let test = rig(Role::Follower, None);
        test.player.set_position(33.0);
        assert_eq!(test.scheduler.effective_time(), 33.0);

        test.leader_tx.send(Some(77.5)).unwrap();
        assert_eq!(test.scheduler.effective_time(), 77.5);
    }

    #[tokio::test]
    async fn seeks_prime_the_landing_window_before_streaming_on() {
        let mut test = rig(Role::Leader, None);
        test.scheduler.state.next_group = 2;

        test.notice_tx
            .send(SchedulerNotice::SeekTo(42.3))
            .unwrap();
        test.scheduler.drain_notices().await.unwrap();

        assert_eq!(test.transport.requested_groups(), vec![42, 43, 44]);
        assert_eq!(test.scheduler.state.next_group, 45);
    }

    #[tokio::test]
    async fn a_backward_seek_pulls_the_cursor_back_to_the_landing_window() {
        let mut test = rig(Role::Leader, None);
        test.scheduler.state.next_group = 106;

        test.notice_tx.send(SchedulerNotice::SeekTo(10.0)).unwrap();
        test.scheduler.drain_notices().await.unwrap();

        assert_eq!(test.transport.requested_groups(), vec![10, 11, 12]);
        assert_eq!(test.scheduler.state.next_group, 13);

        // The steady loop continues from the landing region, not group 106.
        test.scheduler.fetch_step(12.5).await.unwrap();
        assert_eq!(test.transport.requested_groups(), vec![10, 11, 12, 13]);
    }

    #[tokio::test]
    async fn fetch_failures_end_the_run() {
        let mut test = rig_with(ScriptedTransport::failing_at(5), Role::Leader, None);
        test.scheduler.state.next_group = 5;

        let result = test.scheduler.fetch_step(5.0).await;
        assert!(matches!(result, Err(SessionError::Fetch(_))));
        assert!(!test.scheduler.state.buffered.contains(&5));
    }

    #[tokio::test]
    async fn append_failures_end_the_run() {
        let mut test = rig_with(ScriptedTransport::with_empty_payloads(), Role::Leader, None);
        test.scheduler.state.next_group = 1;

        let result = test.scheduler.fetch_step(0.5).await;
        assert!(matches!(result, Err(SessionError::Append(_))));
        assert!(!test.scheduler.state.buffered.contains(&1));
    }

    #[tokio::test]
    async fn eviction_forgets_the_dropped_group_ids() {
        let mut test = rig(Role::Leader, None);
        test.player.insert_range(0.0, 20.0);
        test.player.insert_range(50.0, 66.0);
        test.scheduler.state.buffered.extend((0..20).chain(50..66));

        test.scheduler.evict(60.0).await.unwrap();

        let ranges = test.player.buffered();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].start, ranges[0].end), (50.0, 66.0));
        assert!(!test.scheduler.state.buffered.contains(&10));
        assert!(test.scheduler.state.buffered.contains(&55));
    }

    #[tokio::test]
    async fn partially_trimmed_groups_become_refetchable() {
        let mut test = rig(Role::Leader, None);
        test.player.insert_range(0.0, 36.0);
        test.scheduler.state.buffered.extend(0..36);

        // Window [2.75, 17.75] against a 30s budget trims [0, 2.75).
        test.scheduler.evict(12.75).await.unwrap();

        let ranges = test.player.buffered();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].start, ranges[0].end), (2.75, 36.0));
        // Group 2 lost part of its media, so it must drop out of the
        // buffered set and stay fetchable by a later seek.
        for group in 0..3u64 {
            assert!(!test.scheduler.state.buffered.contains(&group));
        }
        assert!(test.scheduler.state.buffered.contains(&3));
    }

    struct NeverReadyPlayer;

    #[async_trait]
    impl Player for NeverReadyPlayer {
        async fn wait_until_ready(&self) -> Result<(), PlayerError> {
            futures_util::future::pending::<()>().await;
            Ok(())
        }
        fn current_time(&self) -> f64 {
            0.0
        }
        fn is_playing(&self) -> bool {
            false
        }
        async fn play(&self) -> Result<(), PlayerError> {
            Ok(())
        }
        async fn pause(&self) -> Result<(), PlayerError> {
            Ok(())
        }
        async fn seek(&self, _position: f64) -> Result<(), PlayerError> {
            Ok(())
        }
        async fn append(&self, _payload: Bytes) -> Result<(), PlayerError> {
            Ok(())
        }
        async fn remove(&self, _start: f64, _end: f64) -> Result<(), PlayerError> {
            Ok(())
        }
        fn buffered(&self) -> Vec<crate::player::BufferedRange> {
            Vec::new()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_stalled_pipeline_times_out_the_handshake() {
        let transport = ScriptedTransport::new();
        let (_role_tx, role_rx) = watch::channel(Role::Leader);
        let (_leader_tx, leader_pos_rx) = watch::channel(None);
        let (_notice_tx, notice_rx) = mpsc::unbounded_channel();
        let config = FetchConfig {
            handshake_timeout: Duration::from_millis(50),
            ..FetchConfig::default()
        };

        let scheduler = Scheduler::new(
            Arc::new(NeverReadyPlayer),
            transport as Arc<dyn FetchTransport>,
            config,
            "bbb/video".to_string(),
            role_rx,
            leader_pos_rx,
            notice_rx,
            Arc::new(AtomicBool::new(true)),
        );

        let result = scheduler.run().await;
        assert!(matches!(result, Err(SessionError::HandshakeTimeout)));
    }
}
