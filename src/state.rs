// ====================================================================================
// src/state.rs - 共享应用状态
// ====================================================================================
use crate::{
    config::Config, publisher::DebouncedPublisher, roster::InMemoryRoster, sink::PresenceSink,
    tracker::StateTracker,
};
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub roster: Arc<InMemoryRoster>,
    pub tracker: Arc<StateTracker>,
    pub publisher: DebouncedPublisher,
    pub sink: Arc<dyn PresenceSink>,
}
