//! WorkSummary: the attempt record attached to one pipeline stage.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Most entries an error list holds, the marker included.
pub const MAX_ERRORS: usize = 30;

const TOO_MANY_ERRORS: &str = "Too many errors";

/// Outcome of one stage: when it ran, how often, and what went wrong.
///
/// Design:
/// - Owned by exactly one stage at a time; it travels inside the envelope.
/// - `retry` defaults to true and only flips when an error is fatal.
/// - Earlier errors are never dropped; only the tail is capped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSummary {
    pub attempted: bool,
    pub attempt_number: u16,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub retry: bool,
    pub error_is_fatal: bool,
}

impl Default for WorkSummary {
    fn default() -> Self {
        Self {
            attempted: false,
            attempt_number: 0,
            started_at: None,
            finished_at: None,
            errors: Vec::new(),
            retry: true,
            error_is_fatal: false,
        }
    }
}

impl WorkSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `started_at` unless an earlier attempt already did.
    pub fn start(&mut self) {
        self.start_at(Utc::now());
    }

    pub fn start_at(&mut self, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    pub fn finish(&mut self) {
        self.finish_at(Utc::now());
    }

    pub fn finish_at(&mut self, now: DateTime<Utc>) {
        self.finished_at = Some(now);
    }

    /// Marks a fresh attempt: attempted, counter bumped, started.
    ///
    /// A re-run clears `finished_at` so the summary does not report a
    /// stale completion while the new attempt is in progress.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.attempted = true;
        self.attempt_number = self.attempt_number.saturating_add(1);
        self.finished_at = None;
        self.start_at(now);
    }

    pub fn started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        if self.errors.len() >= MAX_ERRORS {
            return;
        }
        if self.errors.len() == MAX_ERRORS - 1 {
            self.errors.push(TOO_MANY_ERRORS.to_string());
            return;
        }
        self.errors.push(message.into());
    }

    /// Records an error that retrying cannot fix.
    pub fn fatal(&mut self, message: impl Into<String>) {
        self.add_error(message);
        self.error_is_fatal = true;
        self.retry = false;
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }

    pub fn all_errors_as_string(&self) -> String {
        self.errors.join("\n")
    }

    /// Resets errors and the fatal flag before re-running a failed attempt.
    pub fn clear_errors(&mut self) {
        self.errors.clear();
        self.error_is_fatal = false;
        self.retry = true;
    }

    pub fn succeeded(&self) -> bool {
        self.attempted && self.started() && self.finished() && !self.has_errors()
    }

    pub fn run_time(&self) -> Duration {
        self.run_time_at(Utc::now())
    }

    /// Zero before start; measured against `now` while still running.
    pub fn run_time_at(&self, now: DateTime<Utc>) -> Duration {
        match (self.started_at, self.finished_at) {
            (None, _) => Duration::zero(),
            (Some(start), Some(end)) => end - start,
            (Some(start), None) => now - start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn defaults_allow_retry() {
        let s = WorkSummary::new();
        assert!(s.retry);
        assert!(!s.attempted);
        assert_eq!(s.attempt_number, 0);
        assert!(!s.succeeded());
    }

    #[rstest]
    #[case(false, true, true, false)]
    #[case(true, false, true, false)]
    #[case(true, true, false, false)]
    #[case(true, true, true, true)]
    fn succeeded_requires_attempted_finished_and_clean(
        #[case] attempted: bool,
        #[case] finished: bool,
        #[case] clean: bool,
        #[case] expected: bool,
    ) {
        let mut s = WorkSummary::new();
        if attempted {
            s.begin_attempt(t(0));
        }
        if finished {
            s.finish_at(t(5));
        }
        if !clean {
            s.add_error("boom");
        }
        assert_eq!(s.succeeded(), expected);
    }

    #[test]
    fn start_keeps_first_timestamp() {
        let mut s = WorkSummary::new();
        s.start_at(t(0));
        s.start_at(t(10));
        assert_eq!(s.started_at, Some(t(0)));
    }

    #[test]
    fn begin_attempt_increments_counter() {
        let mut s = WorkSummary::new();
        s.begin_attempt(t(0));
        s.finish_at(t(1));
        s.begin_attempt(t(2));
        assert_eq!(s.attempt_number, 2);
        assert!(s.attempted);
        assert!(!s.finished());
        assert_eq!(s.started_at, Some(t(0)));
    }

    #[test]
    fn errors_are_capped_without_losing_prefix() {
        let mut s = WorkSummary::new();
        for i in 0..50 {
            s.add_error(format!("error {i}"));
        }
        assert_eq!(s.errors.len(), MAX_ERRORS);
        assert_eq!(s.first_error(), Some("error 0"));
        assert_eq!(s.errors[MAX_ERRORS - 2], "error 28");
        assert_eq!(s.errors[MAX_ERRORS - 1], "Too many errors");
    }

    #[test]
    fn clear_errors_resets_fatal_flag() {
        let mut s = WorkSummary::new();
        s.fatal("bad bag");
        assert!(s.error_is_fatal);
        assert!(!s.retry);
        s.clear_errors();
        assert!(!s.has_errors());
        assert!(!s.error_is_fatal);
        assert!(s.retry);
    }

    #[test]
    fn all_errors_joined_by_newline() {
        let mut s = WorkSummary::new();
        s.add_error("a");
        s.add_error("b");
        assert_eq!(s.all_errors_as_string(), "a\nb");
    }

    #[test]
    fn run_time_handles_unstarted_and_running() {
        let mut s = WorkSummary::new();
        assert_eq!(s.run_time_at(t(100)), Duration::zero());
        s.start_at(t(10));
        assert_eq!(s.run_time_at(t(40)), Duration::seconds(30));
        s.finish_at(t(20));
        assert_eq!(s.run_time_at(t(40)), Duration::seconds(10));
    }
}
