//! Turn-scoped telemetry identifiers.
//!
//! The orchestrator stamps every turn with a short trace id and a
//! monotonically increasing turn number so log lines from concurrent stages
//! can be correlated. Both live in process-wide atomics and are replaceable
//! in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

static TURN_COUNTER: AtomicU64 = AtomicU64::new(0);
static TRACE_ID: Mutex<Option<String>> = Mutex::new(None);

/// Start a new turn: bumps the turn counter and installs a fresh trace id.
///
/// Returns `(turn, trace_id)`.
pub fn begin_turn() -> (u64, String) {
    let turn = TURN_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let id = short_id();
    if let Ok(mut slot) = TRACE_ID.lock() {
        *slot = Some(id.clone());
    }
    (turn, id)
}

/// The current turn number (0 before the first turn).
pub fn current_turn() -> u64 {
    TURN_COUNTER.load(Ordering::Relaxed)
}

/// The current trace id, if a turn has begun.
pub fn current_trace_id() -> Option<String> {
    TRACE_ID.lock().ok().and_then(|slot| slot.clone())
}

/// Override the trace id (tests).
pub fn set_trace_id(id: impl Into<String>) {
    if let Ok(mut slot) = TRACE_ID.lock() {
        *slot = Some(id.into());
    }
}

fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_owned()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn begin_turn_increments_and_sets_id() {
        let before = current_turn();
        let (turn, id) = begin_turn();
        assert_eq!(turn, before + 1);
        assert_eq!(id.len(), 8);
        assert_eq!(current_trace_id().unwrap(), id);
    }

    #[test]
    fn trace_id_is_injectable() {
        set_trace_id("test-trace");
        assert_eq!(current_trace_id().unwrap(), "test-trace");
    }
}
