// ====================================================================================
// src/roster.rs - 在线玩家名单
// ====================================================================================
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

// 在线玩家人数来源，不计入假人和观察者
pub trait PlayerRoster: Send + Sync {
    fn current_player_count(&self) -> u32;
}

// player_id -> 是否为假人
#[derive(Debug, Default)]
pub struct InMemoryRoster {
    players: Mutex<HashMap<String, bool>>,
}

impl InMemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, player_id: &str, is_dummy: bool) {
        self.lock().insert(player_id.to_string(), is_dummy);
    }

    pub fn remove(&self, player_id: &str) -> bool {
        self.lock().remove(player_id).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.players.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PlayerRoster for InMemoryRoster {
    fn current_player_count(&self) -> u32 {
        let count = self.lock().values().filter(|is_dummy| !**is_dummy).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}
