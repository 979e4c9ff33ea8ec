//! Pure policy predicates over peer records.
//!
//! The attempt-class predicates (`has_no_attempts`, `has_pinged`, ...) live
//! on [`PeerRecord`] itself; this module holds the ones that need a clock.

use std::time::Duration;

use tangle_peer::PeerRecord;

/// Exponential backoff: a record may be re-dialed once
/// `now - last_attempt >= min(step * 2^failures, max)`.
/// Records with no recorded attempt always pass.
pub fn passes_exp_backoff(record: &PeerRecord, now_ms: u64, step: Duration, max: Duration) -> bool {
    let Some(last) = record.state_change else {
        return true;
    };
    let step_ms = step.as_millis() as u128;
    let max_ms = max.as_millis() as u128;
    // Shift saturates well past any realistic failure count.
    let factor = 1u128 << record.failures().min(64);
    let wait = (step_ms.saturating_mul(factor)).min(max_ms) as u64;
    now_ms.saturating_sub(last) >= wait
}

/// Debounce group for a record: its host, or its key when the host is
/// absent. Records with neither fall back to a shared bucket.
pub fn group_key(record: &PeerRecord) -> String {
    record.group().unwrap_or_default()
}
