//! # Group-State Tracker - Down Counters for Composite Entities
//!
//! Groups derive their down-state synchronously from their children, so this
//! tracker only persists the counters: consecutive down evaluations, the last
//! notified count, and the downtime start. It also owns the one outstanding
//! deferred-notification handle per group, which the engine uses to hold a
//! group down alert for a short confirmation delay when the group declares
//! dependencies.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::missing_pulse::DownState;

/// Down-counter state scoped to groups
///
/// Mirrors the monitor-side lifecycle: enter down, count consecutive down
/// evaluations, gate still-down re-alerts, clear everything on recovery.
pub struct GroupStateTracker {
    states: DashMap<String, DownState>,
    pending: DashMap<String, CancellationToken>,
}

impl GroupStateTracker {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Record a down evaluation; returns the updated state and whether this
    /// was the transition into down
    pub fn record_down(&self, group_id: &str, now_ms: i64) -> (DownState, bool) {
        if let Some(mut state) = self.states.get_mut(group_id) {
            state.consecutive += 1;
            return (*state, false);
        }
        let state = DownState::entered_down(now_ms);
        self.states.insert(group_id.to_string(), state);
        (state, true)
    }

    /// Record a recovery, cancelling any deferred notification
    ///
    /// Returns the prior state when the group was tracked as down.
    pub fn record_recovery(&self, group_id: &str) -> Option<DownState> {
        self.cancel_pending(group_id);
        self.states.remove(group_id).map(|(_, state)| state)
    }

    /// Still-down re-alert gate for a group that stayed down
    pub fn should_send_still_down(&self, group_id: &str, resend_notification: u32) -> bool {
        self.states
            .get(group_id)
            .map(|state| state.consecutive > 1 && state.should_notify(resend_notification))
            .unwrap_or(false)
    }

    /// Confirm a delivered notification, advancing `last_notified`
    pub fn mark_notified(&self, group_id: &str) {
        if let Some(mut state) = self.states.get_mut(group_id) {
            state.last_notified = state.consecutive;
        }
    }

    /// Current state of a group
    pub fn state(&self, group_id: &str) -> Option<DownState> {
        self.states.get(group_id).map(|s| *s)
    }

    /// Downtime of a group: elapsed since the recorded start, or derived from
    /// the consecutive count and the group interval when no start is known
    pub fn downtime_ms(&self, group_id: &str, group_interval_secs: u64, now_ms: i64) -> i64 {
        match self.states.get(group_id) {
            Some(state) if state.down_start_ms > 0 => state.downtime_ms(now_ms),
            Some(state) => i64::from(state.consecutive) * group_interval_secs as i64 * 1000,
            None => 0,
        }
    }

    /// Register a deferred notification handle, aborting any previous one
    ///
    /// At most one deferred notification is outstanding per group.
    pub fn defer_notification(&self, group_id: &str, token: CancellationToken) {
        if let Some(previous) = self.pending.insert(group_id.to_string(), token) {
            previous.cancel();
        }
    }

    /// Abort and drop the pending notification for a group, if any
    pub fn cancel_pending(&self, group_id: &str) {
        if let Some((_, token)) = self.pending.remove(group_id) {
            token.cancel();
        }
    }

    /// Drop the pending handle without cancelling (the deferred task fired)
    pub fn finish_pending(&self, group_id: &str) {
        self.pending.remove(group_id);
    }

    /// Whether a deferred notification is outstanding for a group
    pub fn has_pending(&self, group_id: &str) -> bool {
        self.pending.contains_key(group_id)
    }

    /// Reset all runtime state (configuration reload)
    pub fn clear(&self) {
        for entry in self.pending.iter() {
            entry.value().cancel();
        }
        self.pending.clear();
        self.states.clear();
    }
}

impl Default for GroupStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_down_lifecycle() {
        let tracker = GroupStateTracker::new();

        let (state, first) = tracker.record_down("g", NOW);
        assert!(first);
        assert_eq!(state.consecutive, 1);
        assert_eq!(state.down_start_ms, NOW);

        let (state, first) = tracker.record_down("g", NOW + 60_000);
        assert!(!first);
        assert_eq!(state.consecutive, 2);
        assert_eq!(state.down_start_ms, NOW, "start time is preserved");

        let prior = tracker.record_recovery("g").unwrap();
        assert_eq!(prior.consecutive, 2);
        assert!(tracker.state("g").is_none());
    }

    #[test]
    fn test_still_down_gating() {
        let tracker = GroupStateTracker::new();
        tracker.record_down("g", NOW);
        tracker.mark_notified("g");

        assert!(!tracker.should_send_still_down("g", 2));

        tracker.record_down("g", NOW + 60_000);
        assert!(!tracker.should_send_still_down("g", 2), "only one check since alert");

        tracker.record_down("g", NOW + 120_000);
        assert!(tracker.should_send_still_down("g", 2));

        tracker.mark_notified("g");
        assert!(!tracker.should_send_still_down("g", 2));
        assert!(!tracker.should_send_still_down("g", 0), "resend 0 never re-alerts");
    }

    #[test]
    fn test_downtime_derivation() {
        let tracker = GroupStateTracker::new();
        tracker.record_down("g", NOW);
        tracker.record_down("g", NOW + 60_000);

        assert_eq!(tracker.downtime_ms("g", 60, NOW + 90_000), 90_000);
        assert_eq!(tracker.downtime_ms("missing", 60, NOW), 0);
    }

    #[test]
    fn test_pending_notification_is_single() {
        let tracker = GroupStateTracker::new();

        let first = CancellationToken::new();
        tracker.defer_notification("g", first.clone());
        assert!(tracker.has_pending("g"));

        let second = CancellationToken::new();
        tracker.defer_notification("g", second.clone());
        assert!(first.is_cancelled(), "replaced handle is aborted");
        assert!(!second.is_cancelled());

        tracker.cancel_pending("g");
        assert!(second.is_cancelled());
        assert!(!tracker.has_pending("g"));
    }

    #[test]
    fn test_recovery_cancels_pending() {
        let tracker = GroupStateTracker::new();
        tracker.record_down("g", NOW);

        let token = CancellationToken::new();
        tracker.defer_notification("g", token.clone());

        tracker.record_recovery("g");
        assert!(token.is_cancelled());
        assert!(!tracker.has_pending("g"));
    }

    #[test]
    fn test_clear_resets_everything() {
        let tracker = GroupStateTracker::new();
        tracker.record_down("g", NOW);
        let token = CancellationToken::new();
        tracker.defer_notification("g", token.clone());

        tracker.clear();
        assert!(token.is_cancelled());
        assert!(tracker.state("g").is_none());
    }
}
