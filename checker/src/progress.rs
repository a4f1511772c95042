// Progress reporting for checker passes

use crate::passes::{PassId, PassStatus};
use log::info;
use std::sync::Mutex;

/// Progress of the pass currently running
#[derive(Debug, Clone)]
pub struct PassProgress {
    pub pass: PassId,
    pub done: u64,
    pub total: u64,
}

impl PassProgress {
    pub fn percentage(&self) -> f32 {
        if self.total == 0 {
            100.0
        } else {
            (self.done as f32 / self.total as f32) * 100.0
        }
    }
}

/// Trait for progress reporting callbacks
pub trait ProgressReporter: Send {
    fn pass_started(&self, _pass: PassId) {}
    fn pass_progress(&self, _progress: &PassProgress) {}
    fn pass_finished(&self, _pass: PassId, _status: PassStatus) {}
}

/// No-op progress reporter (does nothing)
pub struct NoOpProgress;

impl ProgressReporter for NoOpProgress {}

/// Logs progress in steps of ten percent
#[derive(Default)]
pub struct LoggingProgress {
    last_decile: Mutex<Option<(PassId, u32)>>,
}

impl LoggingProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for LoggingProgress {
    fn pass_progress(&self, progress: &PassProgress) {
        let decile = (progress.percentage() / 10.0) as u32;
        let Ok(mut last) = self.last_decile.lock() else {
            return;
        };
        if *last == Some((progress.pass, decile)) {
            return;
        }
        *last = Some((progress.pass, decile));
        if decile > 0 {
            info!("{}: {}% complete", progress.pass.name(), decile * 10);
        }
    }
}

/// Function-based progress reporter
pub struct FnProgress<F>
where
    F: Fn(&PassProgress) + Send,
{
    callback: F,
}

impl<F> FnProgress<F>
where
    F: Fn(&PassProgress) + Send,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressReporter for FnProgress<F>
where
    F: Fn(&PassProgress) + Send,
{
    fn pass_progress(&self, progress: &PassProgress) {
        (self.callback)(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_percentage() {
        let p = PassProgress { pass: PassId::Pass1, done: 25, total: 100 };
        assert_eq!(p.percentage(), 25.0);
        let empty = PassProgress { pass: PassId::Pass5, done: 0, total: 0 };
        assert_eq!(empty.percentage(), 100.0);
    }

    #[test]
    fn test_fn_progress() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let reporter = FnProgress::new(move |p: &PassProgress| {
            counter.store(p.done, Ordering::SeqCst);
        });
        reporter.pass_progress(&PassProgress { pass: PassId::Pass2, done: 7, total: 9 });
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
