// ====================================================================================
// src/tracker.rs - 游戏状态跟踪
// ====================================================================================
use crate::{
    models::{LifecycleEvent, RoundPhase, Snapshot},
    roster::PlayerRoster,
};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

// 发给发布器的信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    Changed,
    // 绕过限流，等待玩家时发送
    WaitingOverride,
}

// 跟踪器的只读视图，发布时读取
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Snapshot;
}

pub struct StateTracker {
    roster: Arc<dyn PlayerRoster>,
    current: RwLock<Snapshot>,
    signal_tx: mpsc::UnboundedSender<StatusSignal>,
    player_left_delay: Duration,
}

impl StateTracker {
    pub fn new(
        roster: Arc<dyn PlayerRoster>,
        signal_tx: mpsc::UnboundedSender<StatusSignal>,
        player_left_delay: Duration,
    ) -> Self {
        Self {
            roster,
            current: RwLock::new(Snapshot::default()),
            signal_tx,
            player_left_delay,
        }
    }

    pub fn handle(self: &Arc<Self>, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::PlayerJoined { .. } => self.on_player_joined(),
            LifecycleEvent::PlayerLeft { .. } => self.on_player_left(),
            LifecycleEvent::RoundStarted => self.on_round_started(),
            LifecycleEvent::WaitingForPlayers => self.on_waiting_for_players(),
            LifecycleEvent::RoundEnded => self.on_round_ended(),
        }
    }

    pub fn on_player_joined(&self) {
        let snapshot = self.recompute(None);
        tracing::debug!("Player joined. New count: {}", snapshot.player_count);
        self.signal(StatusSignal::Changed);
    }

    pub fn on_player_left(self: &Arc<Self>) {
        // 名单可能尚未移除刚离开的玩家，稍等再采样，避免多算一人
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.player_left_delay).await;
            let snapshot = tracker.recompute(None);
            tracing::debug!("Player left. New count: {}", snapshot.player_count);
            tracker.signal(StatusSignal::Changed);
        });
    }

    pub fn on_round_started(&self) {
        tracing::debug!("Round started.");
        self.recompute(Some(RoundPhase::InProgress));
        self.signal(StatusSignal::Changed);
    }

    pub fn on_round_ended(&self) {
        tracing::debug!("Round ended.");
        self.recompute(Some(RoundPhase::Ended));
        self.signal(StatusSignal::Changed);
    }

    pub fn on_waiting_for_players(&self) {
        tracing::debug!("Entered waiting for players state.");
        self.recompute(Some(RoundPhase::WaitingForPlayers));
        self.signal(StatusSignal::WaitingOverride);
    }

    fn recompute(&self, phase: Option<RoundPhase>) -> Snapshot {
        let player_count = self.roster.current_player_count();
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        current.player_count = player_count;
        if let Some(phase) = phase {
            current.round_phase = phase;
        }
        *current
    }

    fn signal(&self, signal: StatusSignal) {
        if self.signal_tx.send(signal).is_err() {
            tracing::debug!("Publisher is gone, dropping {:?}", signal);
        }
    }
}

impl SnapshotSource for StateTracker {
    fn snapshot(&self) -> Snapshot {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }
}
