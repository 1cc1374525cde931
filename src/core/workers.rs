//! Bounded blocking worker pool shared by the hashing, copying, compaction and
//! transcoding stages.
//!
//! Jobs run on tokio's blocking threads, at most `limit` at a time. Results
//! come back in submission order. Once any job fails no further jobs are
//! submitted, but everything already running is awaited before the first
//! error is returned, so a stage never aggregates partial results.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{Error, Result};

pub async fn run_all<T, F>(stage: &'static str, limit: usize, jobs: Vec<F>) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let total = jobs.len();
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let failed = Arc::new(AtomicBool::new(false));
    let mut set = JoinSet::new();

    for (index, job) in jobs.into_iter().enumerate() {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Worker {
                stage,
                message: e.to_string(),
            })?;

        if failed.load(Ordering::Acquire) {
            debug!(stage, submitted = index, total, "Stopping submission after failure");
            break;
        }

        let failed = failed.clone();
        set.spawn_blocking(move || {
            let _permit = permit;
            let result = job();
            if result.is_err() {
                failed.store(true, Ordering::Release);
            }
            (index, result)
        });
    }

    let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
    let mut first_error: Option<Error> = None;

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, Ok(value))) => slots[index] = Some(value),
            Ok((_, Err(e))) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(Error::Worker {
                    stage,
                    message: e.to_string(),
                });
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    Ok(slots.into_iter().flatten().collect())
}

/// Run a single blocking closure off the async executor.
pub async fn run_blocking<T, F>(stage: &'static str, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| Error::Worker {
            stage,
            message: e.to_string(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn results_keep_submission_order() {
        let jobs: Vec<_> = (0..20u64)
            .map(|i| {
                move || {
                    std::thread::sleep(std::time::Duration::from_millis(20 - i));
                    Ok(i)
                }
            })
            .collect();

        let results = run_all("test", 4, jobs).await.unwrap();
        assert_eq!(results, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failure_is_reported_after_all_running_jobs() {
        let finished = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<Box<dyn FnOnce() -> Result<()> + Send>> = (0..4)
            .map(|i| {
                let finished = finished.clone();
                Box::new(move || {
                    if i == 0 {
                        return Err(Error::InvalidStack {
                            path: PathBuf::from("bad.tif"),
                            message: "boom".into(),
                        });
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }) as Box<dyn FnOnce() -> Result<()> + Send>
            })
            .collect();

        let err = run_all("test", 1, jobs).await.unwrap_err();
        assert!(err.to_string().contains("bad.tif"));
        // With one slot the failure lands before later jobs are submitted.
        assert!(finished.load(Ordering::SeqCst) < 3);
    }

    #[tokio::test]
    async fn empty_job_list() {
        let jobs: Vec<fn() -> Result<u8>> = Vec::new();
        let results = run_all("test", 8, jobs).await.unwrap();
        assert!(results.is_empty());
    }
}
