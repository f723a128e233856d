//! Parallel fan-out with a full join.

/// Runs `f(0..count)` as logically concurrent tasks and returns only after
/// every task has terminated. Task 0 runs on the calling thread, the rest on
/// scoped threads; a panicking task propagates after all siblings have
/// joined. Recoverable per-task errors travel through caller-owned slots,
/// not panics.
pub fn pmap<F>(count: usize, f: F)
where
    F: Fn(usize) + Sync,
{
    match count {
        0 => {}
        1 => f(0),
        _ => std::thread::scope(|s| {
            for i in 1..count {
                let f = &f;
                s.spawn(move || f(i));
            }
            f(0);
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn test_runs_every_index_once() {
        let hits = [const { AtomicUsize::new(0) }; 8];
        pmap(8, |i| {
            hits[i].fetch_add(1, Ordering::SeqCst);
        });
        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_tasks_run_concurrently() {
        // Every task blocks on the barrier; only genuine concurrency can
        // release them all.
        let barrier = Barrier::new(4);
        pmap(4, |_| {
            barrier.wait();
        });
    }

    #[test]
    fn test_returns_after_all_tasks_finish() {
        let done = AtomicUsize::new(0);
        pmap(6, |_| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            done.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(done.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_zero_and_one() {
        pmap(0, |_| panic!("no tasks expected"));
        let ran = AtomicUsize::new(0);
        pmap(1, |i| {
            assert_eq!(i, 0);
            ran.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
