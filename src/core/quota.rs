//! Free-tier message quota.
//!
//! Non-premium users may send [`FREE_LIMIT`] messages per rolling window of
//! [`WINDOW_MS`]. The window start is persisted, so restarting the process
//! does not reset the count. Decisions are pure functions over
//! [`QuotaState`]; persistence goes through the injected [`KeyValueStore`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::clock::Clock;
use crate::core::constants::{FREE_LIMIT, KEY_LAST_RESET, KEY_MESSAGE_COUNT, WINDOW_MS};
use crate::core::store::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaState {
    pub count: u32,
    pub window_start_ms: i64,
}

/// Whether another outbound message is permitted.
pub fn can_send(state: &QuotaState, is_premium: bool) -> bool {
    is_premium || state.count < FREE_LIMIT
}

/// Messages left in the current window, or `None` when unlimited.
pub fn remaining(state: &QuotaState, is_premium: bool) -> Option<u32> {
    if is_premium {
        None
    } else {
        Some(FREE_LIMIT.saturating_sub(state.count))
    }
}

pub struct QuotaGate {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Read the persisted state, starting a fresh window if the stored one
    /// has expired. Never fails: unreadable state counts as absent.
    pub fn load(&self) -> QuotaState {
        let now = self.clock.now_ms();
        let stored = match (
            self.read_value::<u32>(KEY_MESSAGE_COUNT),
            self.read_value::<i64>(KEY_LAST_RESET),
        ) {
            (Some(count), Some(window_start_ms)) => QuotaState {
                count: count.unwrap_or(0),
                window_start_ms: window_start_ms.unwrap_or(0),
            },
            _ => QuotaState::default(),
        };

        if now - stored.window_start_ms > WINDOW_MS {
            let fresh = QuotaState {
                count: 0,
                window_start_ms: now,
            };
            debug!(
                previous_count = stored.count,
                previous_window_start = stored.window_start_ms,
                window_start = now,
                "Quota window expired; starting a new one"
            );
            self.persist(KEY_MESSAGE_COUNT, "0");
            self.persist(KEY_LAST_RESET, &now.to_string());
            fresh
        } else {
            stored
        }
    }

    /// Count one permitted send. Callers must check [`can_send`] first.
    pub fn record_send(&self, state: QuotaState) -> QuotaState {
        let updated = QuotaState {
            count: state.count.saturating_add(1),
            ..state
        };
        self.persist(KEY_MESSAGE_COUNT, &updated.count.to_string());
        updated
    }

    /// Outer `None` means the store could not be read at all; inner `None`
    /// means the key is absent or its value does not parse.
    fn read_value<T: FromStr>(&self, key: &str) -> Option<Option<T>> {
        match self.store.get(key) {
            Ok(Some(raw)) => match raw.trim().parse::<T>() {
                Ok(value) => Some(Some(value)),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring unparseable quota value");
                    Some(None)
                }
            },
            Ok(None) => Some(None),
            Err(err) => {
                warn!(key, error = %err, "Quota store read failed; treating as a fresh window");
                None
            }
        }
    }

    fn persist(&self, key: &str, value: &str) {
        if let Err(err) = self.store.set(key, value) {
            warn!(key, error = %err, "Failed to persist quota value");
        }
    }
}

/// Returned when a non-premium user has used up the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub state: QuotaState,
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Daily message limit of {} reached ({} sent in the current window)",
            FREE_LIMIT, self.state.count
        )
    }
}

impl std::error::Error for QuotaExceeded {}

/// Process-wide quota gate. `acquire` runs load, check and record as one
/// unit so concurrent conversations cannot lose updates.
pub struct SharedQuotaGate {
    gate: Mutex<QuotaGate>,
}

impl SharedQuotaGate {
    pub fn new(gate: QuotaGate) -> Self {
        Self {
            gate: Mutex::new(gate),
        }
    }

    pub async fn acquire(&self, is_premium: bool) -> Result<QuotaState, QuotaExceeded> {
        let gate = self.gate.lock().await;
        let state = gate.load();
        if !can_send(&state, is_premium) {
            debug!(count = state.count, "Send rejected by quota gate");
            return Err(QuotaExceeded { state });
        }
        Ok(gate.record_send(state))
    }

    pub async fn snapshot(&self) -> QuotaState {
        self.gate.lock().await.load()
    }
}
