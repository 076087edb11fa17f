//! Per-session activity and rotation bookkeeping.
//!
//! Records are process-local and disposable. They feed observability and the
//! rotation debounce. Nothing removes them on its own: [`ActivityTracker::sweep`]
//! must run periodically (the engine schedules it) to bound memory.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::metrics;

/// Bookkeeping for one session id.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub last_activity: Instant,
    /// Successful cache refresh-writes for this session.
    pub active_extensions: u64,
    pub rotation_attempts: u32,
    pub last_rotation_attempt: Option<Instant>,
    /// Id this session was rotated to, if any.
    pub rotated_to: Option<String>,
    /// Owner of the session when it was rotated.
    pub rotated_for: Option<String>,
    /// A rotation passed the gate and has not finished yet.
    pub rotating: bool,
}

impl ActivityRecord {
    fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            active_extensions: 0,
            rotation_attempts: 0,
            last_rotation_attempt: None,
            rotated_to: None,
            rotated_for: None,
            rotating: false,
        }
    }

    fn attempted_within(&self, window: Duration, now: Instant) -> bool {
        self.last_rotation_attempt
            .is_some_and(|at| now.duration_since(at) <= window)
    }
}

/// Decision of [`ActivityTracker::begin_rotation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationGate {
    /// No attempt within the debounce window; the attempt is now recorded.
    Proceed,
    /// A recent attempt exists. Carries the id it rotated to, if it succeeded.
    Debounced { rotated_to: Option<String> },
}

/// A rotation that completed within the debounce window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRotation {
    pub rotated_to: String,
    /// Id of the user the session belonged to.
    pub user_id: String,
}

/// State of a rotation attempted within the debounce window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationStatus {
    InProgress,
    Completed(CompletedRotation),
}

/// Aggregate tracker statistics.
#[derive(Debug, Clone, Default)]
pub struct ActivityStats {
    pub tracked_sessions: usize,
    pub total_extensions: u64,
    pub total_rotation_attempts: u64,
}

/// Concurrent map of session id to [`ActivityRecord`].
#[derive(Debug, Default)]
pub struct ActivityTracker {
    records: DashMap<String, ActivityRecord>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates `last_activity`.
    pub fn touch(&self, session_id: &str) {
        let now = Instant::now();
        self.records
            .entry(session_id.to_string())
            .and_modify(|r| r.last_activity = now)
            .or_insert_with(|| ActivityRecord::new(now));
    }

    /// Records a successful cache refresh-write.
    pub fn record_extension(&self, session_id: &str) {
        let now = Instant::now();
        let mut record = self
            .records
            .entry(session_id.to_string())
            .or_insert_with(|| ActivityRecord::new(now));
        record.last_activity = now;
        record.active_extensions += 1;
    }

    /// Atomically checks the debounce window and, if clear, records a new
    /// rotation attempt.
    ///
    /// Concurrent callers for the same id observe exactly one `Proceed`.
    pub fn begin_rotation(&self, session_id: &str, debounce: Duration) -> RotationGate {
        let now = Instant::now();
        match self.records.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.last_activity = now;
                if record.attempted_within(debounce, now) {
                    return RotationGate::Debounced {
                        rotated_to: record.rotated_to.clone(),
                    };
                }
                record.rotation_attempts += 1;
                record.last_rotation_attempt = Some(now);
                record.rotating = true;
                RotationGate::Proceed
            }
            Entry::Vacant(vacant) => {
                let mut record = ActivityRecord::new(now);
                record.rotation_attempts = 1;
                record.last_rotation_attempt = Some(now);
                record.rotating = true;
                vacant.insert(record);
                RotationGate::Proceed
            }
        }
    }

    /// Rotation of `session_id` completed within `window`, if any.
    pub fn recent_rotation(&self, session_id: &str, window: Duration) -> Option<CompletedRotation> {
        match self.rotation_status(session_id, window)? {
            RotationStatus::Completed(done) => Some(done),
            RotationStatus::InProgress => None,
        }
    }

    /// Rotation of `session_id` in progress or completed within `window`.
    ///
    /// Read in one step, so a rotation finishing concurrently is seen either
    /// as in progress or as completed.
    pub fn rotation_status(&self, session_id: &str, window: Duration) -> Option<RotationStatus> {
        let now = Instant::now();
        let record = self
            .records
            .get(session_id)
            .filter(|r| r.attempted_within(window, now))?;
        if let (Some(rotated_to), Some(user_id)) = (&record.rotated_to, &record.rotated_for) {
            return Some(RotationStatus::Completed(CompletedRotation {
                rotated_to: rotated_to.clone(),
                user_id: user_id.clone(),
            }));
        }
        record.rotating.then_some(RotationStatus::InProgress)
    }

    /// Records that `user_id`'s session was rotated from `previous` to
    /// `current`.
    pub fn complete_rotation(&self, previous: &str, current: &str, user_id: &str) {
        let now = Instant::now();
        if let Some(mut record) = self.records.get_mut(previous) {
            record.rotated_to = Some(current.to_string());
            record.rotated_for = Some(user_id.to_string());
            record.rotating = false;
            record.last_activity = now;
        }
        self.touch(current);
    }

    /// Ends a rotation that did not produce a new id. The attempt still counts
    /// toward the debounce window.
    pub fn abandon_rotation(&self, session_id: &str) {
        if let Some(mut record) = self.records.get_mut(session_id) {
            record.rotating = false;
        }
    }

    pub fn get(&self, session_id: &str) -> Option<ActivityRecord> {
        self.records.get(session_id).map(|r| r.clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.records.remove(session_id);
    }

    /// Removes records idle for longer than `max_idle`. Returns the number
    /// removed.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, r| now.duration_since(r.last_activity) <= max_idle);
        let removed = before.saturating_sub(self.records.len());

        metrics::record_tracked_sessions(self.records.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept idle session bookkeeping");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&self) {
        self.records.clear();
    }

    pub fn stats(&self) -> ActivityStats {
        let mut stats = ActivityStats {
            tracked_sessions: self.records.len(),
            ..ActivityStats::default()
        };
        for record in self.records.iter() {
            stats.total_extensions += record.active_extensions;
            stats.total_rotation_attempts += u64::from(record.rotation_attempts);
        }
        stats
    }
}
