use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, OnceLock},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy)]
struct ThrottleSlot {
    last: Instant,
    suppressed: u64,
}

/// Shorten a long hex string (content ids, GUIDs) to `head..tail` for log lines.
pub fn short_hex(value: &str) -> String {
    const HEAD: usize = 8;
    const TAIL: usize = 4;
    if value.len() <= HEAD + TAIL || !value.is_ascii() {
        return value.to_string();
    }
    format!("{}..{}", &value[..HEAD], &value[value.len() - TAIL..])
}

/// Lock a std mutex, recovering the inner value if a previous holder panicked.
pub fn lock_recover<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            if warn_throttled_with_count(what, Duration::from_secs(60)).is_some() {
                tracing::warn!(lock = what, "lock poisoned; continuing with recovered state");
            }
            poisoned.into_inner()
        }
    }
}

/// Returns true when a warning for `key` may be emitted now. Emits a summary of how many
/// warnings were swallowed since the last one.
pub fn warn_throttled(key: &'static str, interval: Duration) -> bool {
    let Some(suppressed) = warn_throttled_with_count(key, interval) else {
        return false;
    };
    if suppressed > 0 {
        tracing::warn!(
            event = "throttled_warning_summary",
            key,
            suppressed,
            "repeated warnings were suppressed"
        );
    }
    true
}

/// `Some(suppressed_since_last)` when `key` is allowed through, `None` while throttled.
pub fn warn_throttled_with_count(key: &'static str, interval: Duration) -> Option<u64> {
    static SLOTS: OnceLock<Mutex<HashMap<&'static str, ThrottleSlot>>> = OnceLock::new();
    let slots = SLOTS.get_or_init(|| Mutex::new(HashMap::new()));
    // Never route through lock_recover here; it calls back into this function.
    let mut guard = match slots.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let now = Instant::now();
    match guard.get_mut(key) {
        Some(slot) if now.saturating_duration_since(slot.last) < interval => {
            slot.suppressed = slot.suppressed.saturating_add(1);
            None
        }
        Some(slot) => {
            let suppressed = slot.suppressed;
            slot.last = now;
            slot.suppressed = 0;
            Some(suppressed)
        }
        None => {
            guard.insert(
                key,
                ThrottleSlot {
                    last: now,
                    suppressed: 0,
                },
            );
            Some(0)
        }
    }
}
