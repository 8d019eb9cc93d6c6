// ====================================================================================
// src/publisher.rs - 限流状态发布器
// ====================================================================================
//
// 每个限流窗口内最多向外发布一次状态，并保证最后一次状态变化一定会被发布。
// 延迟发布在触发时重新采样快照，所以总是以最新状态为准。
use crate::{
    models::{PresenceLevel, PublishRequest},
    sink::PresenceSink,
    status::{compute_desired_status, StatusKey, StatusTemplates},
    tracker::{SnapshotSource, StatusSignal},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct SchedulerState {
    last_publish: Option<Instant>,
    // 为 true 时恰好有一个延迟任务在等待
    update_pending: bool,
}

enum Decision {
    PublishNow,
    Defer(Duration),
    AlreadyPending,
    Skip,
}

struct Inner {
    sink: Arc<dyn PresenceSink>,
    snapshot: Arc<dyn SnapshotSource>,
    templates: StatusTemplates,
    window: Duration,
    state: Mutex<SchedulerState>,
}

#[derive(Clone)]
pub struct DebouncedPublisher {
    inner: Arc<Inner>,
}

impl DebouncedPublisher {
    pub fn new(
        sink: Arc<dyn PresenceSink>,
        snapshot: Arc<dyn SnapshotSource>,
        templates: StatusTemplates,
        window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                snapshot,
                templates,
                window,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    // 消费跟踪器信号，直到发送端全部关闭
    pub async fn run(self, mut signal_rx: mpsc::UnboundedReceiver<StatusSignal>) {
        while let Some(signal) = signal_rx.recv().await {
            match signal {
                StatusSignal::Changed => self.notify(),
                StatusSignal::WaitingOverride => self.publish_override(),
            }
        }
        tracing::debug!("Status signal channel closed, publisher loop exiting");
    }

    // 请求刷新状态，受限流窗口约束，不会阻塞
    pub fn notify(&self) {
        let now = Instant::now();
        let decision = {
            let mut state = self.inner.lock_state();
            match state.last_publish.map(|last| now.duration_since(last)) {
                Some(elapsed) if elapsed < self.inner.window => {
                    if state.update_pending {
                        Decision::AlreadyPending
                    } else {
                        state.update_pending = true;
                        Decision::Defer(self.inner.window - elapsed)
                    }
                }
                _ => {
                    if self.inner.stamp_if_connected(&mut state, now) {
                        Decision::PublishNow
                    } else {
                        Decision::Skip
                    }
                }
            }
        };

        match decision {
            Decision::PublishNow => {
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.publish_current().await });
            }
            Decision::Defer(delay) => {
                tracing::debug!("Queued status update due to rate limit ({:?}).", delay);
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let stamped = {
                        let mut state = inner.lock_state();
                        state.update_pending = false;
                        inner.stamp_if_connected(&mut state, Instant::now())
                    };
                    if stamped {
                        inner.publish_current().await;
                    }
                });
            }
            Decision::AlreadyPending => tracing::debug!("Skipped status update (already queued)."),
            Decision::Skip => {}
        }
    }

    // 立即应用等待玩家模板，忽略限流窗口
    pub fn publish_override(&self) {
        if !self.inner.sink.is_connected() {
            tracing::debug!("Presence sink not connected, skipping waiting-for-players override");
            return;
        }
        let player_count = self.inner.snapshot.snapshot().player_count;
        let request = self.inner.templates.get(StatusKey::WaitingForPlayers).render(player_count);
        tracing::debug!("Forcing WaitingForPlayers state: \"{}\" ({:?})", request.text, request.level);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.send(request).await });
    }

    // 立即发布并重新开始窗口
    pub async fn force_publish(&self) {
        let stamped = {
            let mut state = self.inner.lock_state();
            self.inner.stamp_if_connected(&mut state, Instant::now())
        };
        if stamped {
            self.inner.publish_current().await;
        }
    }

    // 连接就绪后先等名单填充，再发布
    pub async fn activate(&self, grace: Duration) {
        tokio::time::sleep(grace).await;
        self.force_publish().await;
    }

    // 退出时尽力重置在线状态
    pub async fn teardown(&self) {
        if !self.inner.sink.is_connected() {
            tracing::debug!("Presence sink not connected, nothing to clear");
            return;
        }
        if let Err(e) = self.inner.sink.set_activity(None).await {
            tracing::error!("Failed to properly clear Discord status: {}", e);
        }
        if let Err(e) = self.inner.sink.set_presence_level(PresenceLevel::Online).await {
            tracing::error!("Failed to properly clear Discord status: {}", e);
        }
    }

    pub fn desired_status(&self) -> PublishRequest {
        compute_desired_status(&self.inner.snapshot.snapshot(), &self.inner.templates)
    }

    pub fn is_update_pending(&self) -> bool {
        self.inner.lock_state().update_pending
    }

    #[cfg(test)]
    fn last_publish(&self) -> Option<Instant> {
        self.inner.lock_state().last_publish
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // 未连接时跳过，且不推迟窗口
    fn stamp_if_connected(&self, state: &mut SchedulerState, now: Instant) -> bool {
        if !self.sink.is_connected() {
            tracing::debug!("Presence sink not connected, skipping status update");
            return false;
        }
        state.last_publish = Some(now);
        true
    }

    async fn publish_current(&self) {
        let request = compute_desired_status(&self.snapshot.snapshot(), &self.templates);
        self.send(request).await;
    }

    async fn send(&self, request: PublishRequest) {
        tracing::debug!("Updating Discord status: \"{}\" ({:?})", request.text, request.level);
        if let Err(e) = self.sink.set_activity(Some(request.text)).await {
            tracing::error!("Failed to update Discord activity: {}", e);
        }
        if let Err(e) = self.sink.set_presence_level(request.level).await {
            tracing::error!("Failed to update Discord status: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{RoundPhase, Snapshot},
        sink::mock::{RecordingSink, SinkCall},
    };
    use tokio::time::sleep;

    const WINDOW: Duration = Duration::from_secs(3);

    struct StubSnapshot(Mutex<Snapshot>);

    impl StubSnapshot {
        fn set(&self, player_count: u32, round_phase: RoundPhase) {
            *self.0.lock().unwrap() = Snapshot { player_count, round_phase };
        }
    }

    impl SnapshotSource for StubSnapshot {
        fn snapshot(&self) -> Snapshot {
            *self.0.lock().unwrap()
        }
    }

    fn publisher(player_count: u32, round_phase: RoundPhase) -> (DebouncedPublisher, Arc<RecordingSink>, Arc<StubSnapshot>) {
        let sink = Arc::new(RecordingSink::connected());
        let snapshot = Arc::new(StubSnapshot(Mutex::new(Snapshot { player_count, round_phase })));
        let publisher = DebouncedPublisher::new(sink.clone(), snapshot.clone(), StatusTemplates::default(), WINDOW);
        (publisher, sink, snapshot)
    }

    fn text(value: &str) -> Option<String> {
        Some(value.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn burst_inside_one_window_publishes_the_final_state() {
        let (publisher, sink, snapshot) = publisher(1, RoundPhase::InProgress);

        publisher.notify();
        sleep(Duration::from_secs(1)).await;
        snapshot.set(2, RoundPhase::InProgress);
        publisher.notify();
        sleep(Duration::from_secs(1)).await;
        snapshot.set(3, RoundPhase::InProgress);
        publisher.notify();
        snapshot.set(4, RoundPhase::InProgress);

        sleep(Duration::from_millis(900)).await;
        assert_eq!(sink.activities(), vec![text("Players: 1")]);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.activities(), vec![text("Players: 1"), text("Players: 4")]);
        assert!(!publisher.is_update_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_publish_per_window() {
        let (publisher, sink, snapshot) = publisher(1, RoundPhase::InProgress);

        // 10 秒内每 250ms 通知一次
        for n in 0..40 {
            snapshot.set(n, RoundPhase::InProgress);
            publisher.notify();
            sleep(Duration::from_millis(250)).await;
        }
        sleep(WINDOW).await;

        // t=0, 3, 6, 9 以及收尾的 t=12
        let activities = sink.activities();
        assert_eq!(activities.len(), 5);
        assert_eq!(activities.last().unwrap(), &text("Players: 39"));
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_published_without_notifications() {
        let (_publisher, sink, _snapshot) = publisher(3, RoundPhase::InProgress);
        sleep(Duration::from_secs(30)).await;
        assert!(sink.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_publish_samples_state_at_fire_time() {
        let (publisher, sink, snapshot) = publisher(0, RoundPhase::WaitingForPlayers);

        publisher.notify();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(
            sink.calls(),
            vec![SinkCall::Activity(text("Waiting for players...")), SinkCall::Level(PresenceLevel::Idle)]
        );

        sleep(Duration::from_millis(990)).await;
        publisher.notify();
        assert!(publisher.is_update_pending());

        sleep(Duration::from_secs(1)).await;
        publisher.notify();
        assert!(publisher.is_update_pending());

        snapshot.set(6, RoundPhase::InProgress);
        sleep(Duration::from_millis(1010)).await;
        assert_eq!(
            sink.calls()[2..].to_vec(),
            vec![SinkCall::Activity(text("Players: 6")), SinkCall::Level(PresenceLevel::Online)]
        );
        assert!(!publisher.is_update_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn override_bypasses_the_window_and_never_queues() {
        let (publisher, sink, snapshot) = publisher(2, RoundPhase::InProgress);

        publisher.notify();
        sleep(Duration::from_millis(500)).await;
        snapshot.set(2, RoundPhase::WaitingForPlayers);
        publisher.publish_override();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(sink.activities(), vec![text("Players: 2"), text("Waiting for players...")]);
        assert!(!publisher.is_update_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn override_leaves_an_existing_queue_alone() {
        let (publisher, sink, snapshot) = publisher(2, RoundPhase::InProgress);

        publisher.notify();
        sleep(Duration::from_millis(500)).await;
        publisher.notify();
        assert!(publisher.is_update_pending());

        snapshot.set(0, RoundPhase::WaitingForPlayers);
        publisher.publish_override();
        assert!(publisher.is_update_pending());

        sleep(WINDOW).await;
        assert_eq!(
            sink.activities(),
            vec![text("Players: 2"), text("Waiting for players..."), text("Waiting for players...")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_sink_skips_without_extending_the_window() {
        let (publisher, sink, _snapshot) = publisher(1, RoundPhase::InProgress);
        let start = Instant::now();

        publisher.notify();
        sleep(Duration::from_secs(1)).await;
        publisher.notify();
        assert!(publisher.is_update_pending());

        sink.set_connected(false);
        sleep(Duration::from_millis(2100)).await;
        assert_eq!(sink.activities().len(), 1);
        assert!(!publisher.is_update_pending());
        assert_eq!(publisher.last_publish(), Some(start));

        sink.set_connected(true);
        publisher.notify();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.activities().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failures_do_not_touch_scheduler_state() {
        let (publisher, sink, _snapshot) = publisher(1, RoundPhase::InProgress);
        sink.set_failing(true);
        let start = Instant::now();

        publisher.notify();
        sleep(Duration::from_millis(10)).await;

        // 两个调用都会尝试
        assert_eq!(sink.calls().len(), 2);
        assert_eq!(publisher.last_publish(), Some(start));
        assert!(!publisher.is_update_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn force_publish_ignores_the_window() {
        let (publisher, sink, _snapshot) = publisher(1, RoundPhase::Ended);

        publisher.notify();
        sleep(Duration::from_millis(100)).await;
        publisher.force_publish().await;

        assert_eq!(sink.activities(), vec![text("Round ended"), text("Round ended")]);
        assert!(!publisher.is_update_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn activation_waits_for_the_grace_period() {
        let (publisher, sink, _snapshot) = publisher(0, RoundPhase::Unknown);

        let activation = tokio::spawn({
            let publisher = publisher.clone();
            async move { publisher.activate(Duration::from_secs(3)).await }
        });

        sleep(Duration::from_millis(2900)).await;
        assert!(sink.calls().is_empty());

        activation.await.unwrap();
        assert_eq!(sink.activities(), vec![text("Waiting for players...")]);

        // 激活后窗口已开始计时
        publisher.notify();
        assert!(publisher.is_update_pending());
    }

    #[tokio::test]
    async fn teardown_resets_to_neutral() {
        let (publisher, sink, _snapshot) = publisher(5, RoundPhase::InProgress);
        publisher.teardown().await;
        assert_eq!(sink.calls(), vec![SinkCall::Activity(None), SinkCall::Level(PresenceLevel::Online)]);
    }

    #[tokio::test]
    async fn teardown_failures_are_swallowed() {
        let (publisher, sink, _snapshot) = publisher(5, RoundPhase::InProgress);
        sink.set_failing(true);
        publisher.teardown().await;
        assert_eq!(sink.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_routes_signals() {
        let (publisher, sink, _snapshot) = publisher(0, RoundPhase::WaitingForPlayers);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(publisher.clone().run(rx));

        tx.send(StatusSignal::Changed).unwrap();
        tx.send(StatusSignal::WaitingOverride).unwrap();
        drop(tx);
        handle.await.unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(sink.activities().len(), 2);
        assert!(!publisher.is_update_pending());
    }

    #[tokio::test]
    async fn desired_status_reflects_the_snapshot() {
        let (publisher, _sink, snapshot) = publisher(0, RoundPhase::InProgress);
        assert_eq!(publisher.desired_status().text, "Players: 0");
        snapshot.set(8, RoundPhase::InProgress);
        assert_eq!(publisher.desired_status().text, "Players: 8");
    }
}
