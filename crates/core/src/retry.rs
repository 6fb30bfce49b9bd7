//! Retry Duplicator: reissues failed jobs with a decremented TTL.

use crate::error::RepositoryError;
use crate::job::{Job, JobStatus};
use crate::repository::Repository;

/// If `job` is terminally `error` and has `ttl > 1`, insert a fresh pending
/// duplicate with a decremented TTL and return it. Otherwise a no-op
/// (TTL exhausted at `ttl <= 1`, or the job isn't `error` at all). Note the
/// off-by-one: a job with `ttl == 1` is NOT retried.
///
/// The original job is never modified by this function; it remains
/// terminally `error` in the repository.
pub async fn maybe_retry(
    repo: &dyn Repository,
    job: &Job,
) -> Result<Option<Job>, RepositoryError> {
    if job.status != JobStatus::Error || job.ttl <= 1 {
        return Ok(None);
    }

    let duplicate = job.retry_duplicate();
    let inserted = repo.insert(&duplicate).await?;
    Ok(Some(inserted))
}
