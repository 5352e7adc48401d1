// SPDX-License-Identifier: Apache-2.0

//! Per-file lifecycle state.
//!
//! Every transition helper returns the next state instead of mutating in
//! place: callers persist the returned value first and only then adopt it,
//! so the registry never lags behind what the controller acts on.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::receivers::file::error::{Error, Result};
use crate::receivers::file::input::FileId;

/// Lifecycle phase of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Discovered,
    Reading,
    Inactive,
    Closed,
    Removed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discovered => "discovered",
            Phase::Reading => "reading",
            Phase::Inactive => "inactive",
            Phase::Closed => "closed",
            Phase::Removed => "removed",
        }
    }

    /// Allowed edges of the lifecycle graph.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Discovered, Reading)
                | (Discovered, Closed)
                | (Reading, Inactive)
                | (Inactive, Reading)
                | (Inactive, Closed)
                | (Closed, Reading)
                | (Closed, Removed)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the registry knows about one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub identity: FileId,
    /// Last known path; follows renames
    pub source_path: String,
    /// Bytes consumed so far
    pub offset: u64,
    pub phase: Phase,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_deadline: Option<DateTime<Utc>>,
    /// clean_inactive in force when the entry was written
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl FileState {
    /// A freshly discovered file, nothing consumed yet.
    pub fn discovered(
        identity: FileId,
        source_path: impl Into<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            identity,
            source_path: source_path.into(),
            offset: 0,
            phase: Phase::Discovered,
            last_activity_at: now,
            closed_at: None,
            ttl_deadline: None,
            ttl,
        }
    }

    fn to_phase(&self, next: Phase) -> Result<FileState> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::Transition {
                key: self.identity.to_string(),
                from: self.phase.as_str(),
                to: next.as_str(),
            });
        }
        let mut state = self.clone();
        state.phase = next;
        Ok(state)
    }

    /// Discovered, Inactive or Closed → Reading. Clears any close bookkeeping.
    pub fn start_reading(&self, now: DateTime<Utc>) -> Result<FileState> {
        let mut state = self.to_phase(Phase::Reading)?;
        state.last_activity_at = now;
        state.closed_at = None;
        state.ttl_deadline = None;
        Ok(state)
    }

    /// Reading → Inactive: the reader is about to release its handle.
    pub fn deactivate(&self) -> Result<FileState> {
        self.to_phase(Phase::Inactive)
    }

    /// Inactive or Discovered → Closed, starting the TTL clock.
    pub fn close(&self, now: DateTime<Utc>) -> Result<FileState> {
        let mut state = self.to_phase(Phase::Closed)?;
        state.closed_at = Some(now);
        state.ttl_deadline = Some(deadline(now, self.ttl));
        Ok(state)
    }

    /// Closed → Removed. Only the garbage collector takes this edge.
    pub fn remove(&self) -> Result<FileState> {
        self.to_phase(Phase::Removed)
    }

    /// Record read progress while Reading.
    pub fn advance(&self, offset: u64, now: DateTime<Utc>) -> FileState {
        let mut state = self.clone();
        state.offset = offset;
        state.last_activity_at = now;
        state
    }

    /// Make a Closed entry eligible at the next sweep. Returns None when the
    /// entry is not closed or already expires at its close time.
    pub fn expire_at_close(&self) -> Option<FileState> {
        match (self.phase, self.closed_at) {
            (Phase::Closed, Some(closed_at)) if self.ttl_deadline != Some(closed_at) => {
                let mut state = self.clone();
                state.ttl_deadline = Some(closed_at);
                Some(state)
            }
            _ => None,
        }
    }

    /// Whether the garbage collector may drop this entry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.phase == Phase::Closed && self.ttl_deadline.is_some_and(|d| d <= now)
    }

    /// Whether a Reading entry has gone `close_inactive` without progress.
    pub fn is_idle(&self, now: DateTime<Utc>, close_inactive: Duration) -> bool {
        self.phase == Phase::Reading && deadline(self.last_activity_at, close_inactive) <= now
    }
}

/// `start + duration`, saturating at the far end of the calendar.
pub fn deadline(start: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(now: DateTime<Utc>) -> FileState {
        FileState::discovered(FileId::new(1, 100), "/var/log/app.log", secs(3), now)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_full_lifecycle() {
        let t0 = Utc::now();
        let discovered = state(t0);
        assert_eq!(discovered.phase, Phase::Discovered);
        assert!(discovered.ttl_deadline.is_none());

        let reading = discovered.start_reading(t0).unwrap();
        let reading = reading.advance(42, t0 + TimeDelta::seconds(1));
        assert_eq!(reading.offset, 42);
        assert!(!reading.is_idle(t0 + TimeDelta::seconds(1), secs(1)));
        assert!(reading.is_idle(t0 + TimeDelta::seconds(2), secs(1)));

        let inactive = reading.deactivate().unwrap();
        assert!(inactive.ttl_deadline.is_none());

        let closed_at = t0 + TimeDelta::seconds(2);
        let closed = inactive.close(closed_at).unwrap();
        assert_eq!(closed.closed_at, Some(closed_at));
        assert_eq!(closed.ttl_deadline, Some(closed_at + TimeDelta::seconds(3)));
        assert_eq!(closed.offset, 42);

        assert!(!closed.is_expired(closed_at + TimeDelta::milliseconds(2999)));
        assert!(closed.is_expired(closed_at + TimeDelta::seconds(3)));

        let removed = closed.remove().unwrap();
        assert_eq!(removed.phase, Phase::Removed);
    }

    #[test]
    fn test_reopen_clears_ttl() {
        let t0 = Utc::now();
        let closed = state(t0)
            .start_reading(t0)
            .and_then(|s| s.deactivate())
            .and_then(|s| s.close(t0))
            .unwrap();

        let reopened = closed.start_reading(t0 + TimeDelta::seconds(1)).unwrap();
        assert_eq!(reopened.phase, Phase::Reading);
        assert!(reopened.closed_at.is_none());
        assert!(reopened.ttl_deadline.is_none());
        assert!(!reopened.is_expired(t0 + TimeDelta::days(1)));
    }

    #[test]
    fn test_ignore_older_goes_straight_to_closed() {
        let t0 = Utc::now();
        let closed = state(t0).close(t0).unwrap();
        assert_eq!(closed.phase, Phase::Closed);
        assert_eq!(closed.offset, 0);
    }

    #[test]
    fn test_rejected_transitions() {
        let t0 = Utc::now();
        let discovered = state(t0);
        let reading = discovered.start_reading(t0).unwrap();
        let inactive = reading.deactivate().unwrap();
        let closed = inactive.close(t0).unwrap();
        let removed = closed.remove().unwrap();

        // Removal is only reachable from Closed
        assert!(discovered.remove().is_err());
        assert!(reading.remove().is_err());
        assert!(inactive.remove().is_err());

        // Reading never skips Inactive on its way to Closed
        assert!(reading.close(t0).is_err());

        // Nothing leaves Removed
        assert!(removed.start_reading(t0).is_err());
        assert!(removed.close(t0).is_err());

        let err = reading.remove().unwrap_err().to_string();
        assert!(err.contains("reading -> removed"), "{}", err);
    }

    #[test]
    fn test_expire_at_close() {
        let t0 = Utc::now();
        let reading = state(t0).start_reading(t0).unwrap();
        assert!(reading.expire_at_close().is_none());

        let closed = reading.deactivate().unwrap().close(t0).unwrap();
        let expired = closed.expire_at_close().unwrap();
        assert_eq!(expired.ttl_deadline, Some(t0));
        assert!(expired.is_expired(t0));

        // Already expiring at close time, nothing to change
        assert!(expired.expire_at_close().is_none());
    }

    #[test]
    fn test_deadline_saturates() {
        let t0 = Utc::now();
        assert_eq!(deadline(t0, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_state_serialization_uses_lowercase_phase() {
        let t0 = Utc::now();
        let json = serde_json::to_string(&state(t0)).unwrap();
        assert!(json.contains(r#""phase":"discovered""#));
        assert!(!json.contains("ttl_deadline"));

        let restored: FileState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state(t0));
    }
}
