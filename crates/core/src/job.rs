//! The `Job` data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// `pending → running → {success, error}`. `success`/`error` are terminal;
/// nothing re-transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }
}

/// One entry in a job's opaque lifecycle history. The core never interprets
/// these beyond appending and persisting; callers attach whatever free-form
/// commentary they like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// The unit of work claimed, supervised, and retried by this agent.
///
/// `id` is `None` until the repository assigns one on [`insert`]; `uuid` is
/// the short human-readable identifier used in logs and process names.
///
/// [`insert`]: crate::repository::Repository::insert
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default, setter(strip_option))]
    pub id: Option<i64>,

    #[builder(default = Uuid::new_v4().to_string())]
    pub uuid: String,

    pub job_type: String,

    #[builder(default)]
    pub status: JobStatus,

    #[builder(default = Utc::now())]
    pub created: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub started: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub finished: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub hostname: Option<String>,

    /// Seconds, measured from `started`. `None` means no enforced timeout.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<i64>,

    /// Remaining retry attempts. A duplicate is only created while
    /// `ttl > 1`; a job with `ttl == 1` is not retried on failure, even
    /// though one attempt nominally remains.
    #[builder(default = 0)]
    pub ttl: i32,

    #[builder(default = 0)]
    pub completion: u8,

    #[builder(default)]
    pub status_text: String,

    #[builder(default)]
    pub details: String,

    #[builder(default)]
    pub history: Vec<JobEvent>,

    #[builder(default = Value::Null)]
    pub payload: Value,
}

impl Job {
    /// A freshly constructed, never-yet-claimed job, as inserted by a
    /// producer outside the agent.
    pub fn new_pending(job_type: impl Into<String>, ttl: i32, payload: Value) -> Self {
        Job::builder()
            .job_type(job_type.into())
            .ttl(ttl)
            .payload(payload)
            .build()
    }

    /// Build the retry duplicate for a terminally-`error` job with
    /// `ttl > 1`. The original is left untouched; this
    /// returns the new pending job, not yet inserted.
    ///
    /// # Panics
    /// In debug builds, panics if `self.status != JobStatus::Error` or
    /// `self.ttl <= 1`. Callers must check the retry condition first since
    /// the decision of *whether* to retry is a policy the supervisor owns.
    pub fn retry_duplicate(&self) -> Job {
        debug_assert_eq!(self.status, JobStatus::Error);
        debug_assert!(self.ttl > 1);

        Job::builder()
            .uuid(Uuid::new_v4().to_string())
            .job_type(self.job_type.clone())
            .ttl(self.ttl - 1)
            .payload(self.payload.clone())
            .details(format!(
                "Job retried! New job created from job {}",
                self.uuid
            ))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pending_has_no_hostname_or_started() {
        let job = Job::new_pending("encode", 3, Value::Null);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.hostname.is_none());
        assert!(job.started.is_none());
        assert!(job.id.is_none());
    }

    #[test]
    fn retry_duplicate_decrements_ttl_and_resets_lifecycle_fields() {
        let mut original = Job::new_pending("encode", 3, serde_json::json!({"a": 1}));
        original.status = JobStatus::Error;
        original.ttl = 2;
        original.hostname = Some("host-a".into());
        original.started = Some(Utc::now());
        original.finished = Some(Utc::now());

        let dup = original.retry_duplicate();

        assert_eq!(dup.ttl, 1);
        assert_eq!(dup.status, JobStatus::Pending);
        assert!(dup.hostname.is_none());
        assert!(dup.started.is_none());
        assert!(dup.finished.is_none());
        assert_ne!(dup.uuid, original.uuid);
        assert_eq!(dup.payload, original.payload);
        assert!(dup.details.contains(&original.uuid));
    }

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
