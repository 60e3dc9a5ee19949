//! Background work scheduling for the merge phase.

use nidx_common::{IndexError, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

/// A unit of work. Jobs may borrow from the caller since `run_all`
/// returns only after every job finished.
pub type Job<'a> = Box<dyn FnOnce() -> Result<()> + Send + 'a>;

/// Runs named batches of jobs, possibly in parallel.
pub trait WorkScheduler: Send + Sync {
    /// Runs every job and returns the first failure.
    ///
    /// All jobs run to completion even if one fails.
    fn run_all<'a>(&self, name: &str, jobs: Vec<Job<'a>>) -> Result<()>;

    /// Upper bound on jobs running at once.
    fn parallelism(&self) -> usize;
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
}

/// Runs jobs one after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineScheduler;

impl WorkScheduler for InlineScheduler {
    fn run_all<'a>(&self, name: &str, jobs: Vec<Job<'a>>) -> Result<()> {
        debug!(job = name, count = jobs.len(), "running jobs inline");
        first_error(jobs.into_iter().map(|job| job()).collect())
    }

    fn parallelism(&self) -> usize {
        1
    }
}

/// Runs jobs on a dedicated rayon pool.
pub struct RayonScheduler {
    pool: ThreadPool,
}

impl RayonScheduler {
    /// Creates a pool of `workers` threads.
    pub fn new(workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("nidx-population-{}", i))
            .build()
            .map_err(|e| IndexError::Internal(format!("failed to start population pool: {}", e)))?;
        Ok(Self { pool })
    }
}

impl WorkScheduler for RayonScheduler {
    fn run_all<'a>(&self, name: &str, jobs: Vec<Job<'a>>) -> Result<()> {
        debug!(
            job = name,
            count = jobs.len(),
            threads = self.pool.current_num_threads(),
            "scheduling jobs"
        );
        let results: Vec<Result<()>> = self
            .pool
            .install(|| jobs.into_par_iter().map(|job| job()).collect());
        first_error(results)
    }

    fn parallelism(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl std::fmt::Debug for RayonScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonScheduler")
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_jobs(counter: &AtomicUsize, n: usize, failing: usize) -> Vec<Job<'_>> {
        (0..n)
            .map(|i| {
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if i == failing {
                        Err(IndexError::Internal(format!("job {}", i)))
                    } else {
                        Ok(())
                    }
                }) as Job<'_>
            })
            .collect()
    }

    #[test]
    fn test_inline_runs_all_and_reports_failure() {
        let counter = AtomicUsize::new(0);
        let result = InlineScheduler.run_all("test", counting_jobs(&counter, 5, 1));
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_rayon_runs_borrowing_jobs() {
        let scheduler = RayonScheduler::new(3).unwrap();
        assert_eq!(scheduler.parallelism(), 3);
        let counter = AtomicUsize::new(0);
        scheduler
            .run_all("test", counting_jobs(&counter, 10, usize::MAX))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        let mut slots = vec![0u64; 4];
        let jobs: Vec<Job<'_>> = slots
            .iter_mut()
            .enumerate()
            .map(|(i, slot)| {
                Box::new(move || {
                    *slot = i as u64 * 10;
                    Ok(())
                }) as Job<'_>
            })
            .collect();
        scheduler.run_all("fill", jobs).unwrap();
        assert_eq!(slots, vec![0, 10, 20, 30]);
    }

    #[test]
    fn test_rayon_reports_failure() {
        let scheduler = RayonScheduler::new(2).unwrap();
        let counter = AtomicUsize::new(0);
        let result = scheduler.run_all("test", counting_jobs(&counter, 4, 2));
        assert!(matches!(result, Err(IndexError::Internal(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
