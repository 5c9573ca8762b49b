use crate::types::{S2Error, S2Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Host-side progress display and cancellation source, polled at step
/// boundaries only
pub trait ProgressReporter: Send + Sync {
    fn report_detail(&self, detail: &str);

    /// Overall completion, 0..=100
    fn report_progress(&self, percent: u8);

    fn is_cancelled(&self) -> bool;

    /// Abort with [`S2Error::Cancelled`] when the host asked to stop
    fn check_cancelled(&self) -> S2Result<()> {
        if self.is_cancelled() {
            log::warn!("Cancellation requested");
            Err(S2Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report a step and check for cancellation before running it
    fn step(&self, percent: u8, detail: &str) -> S2Result<()> {
        self.check_cancelled()?;
        self.report_detail(detail);
        self.report_progress(percent);
        Ok(())
    }
}

/// Reporter that ignores progress and never cancels
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report_detail(&self, _detail: &str) {}

    fn report_progress(&self, _percent: u8) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Forwards progress to the `log` facade and exposes a shareable cancel flag
#[derive(Debug, Clone, Default)]
pub struct LogProgress {
    cancelled: Arc<AtomicBool>,
    percent: Arc<AtomicU8>,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag that cancels every clone of this reporter when set
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Last reported percentage
    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::SeqCst)
    }
}

impl ProgressReporter for LogProgress {
    fn report_detail(&self, detail: &str) {
        log::info!("{}", detail);
    }

    fn report_progress(&self, percent: u8) {
        let percent = percent.min(100);
        self.percent.store(percent, Ordering::SeqCst);
        log::debug!("Progress: {}%", percent);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Shares one reporter between the items of a parallel batch. Item-level
/// percentages are dropped; overall progress advances as items finish.
pub struct BatchProgress<'a> {
    inner: &'a dyn ProgressReporter,
    total: usize,
    finished: Mutex<usize>,
}

impl<'a> BatchProgress<'a> {
    pub fn new(inner: &'a dyn ProgressReporter, total: usize) -> Self {
        Self {
            inner,
            total,
            finished: Mutex::new(0),
        }
    }

    /// Count one item as done and report the batch percentage
    pub fn finish_item(&self) {
        let mut finished = match self.finished.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *finished = (*finished + 1).min(self.total);
        // Reported under the lock so percentages never go backwards
        let percent = (*finished * 100 / self.total.max(1)) as u8;
        self.inner.report_progress(percent);
    }
}

impl ProgressReporter for BatchProgress<'_> {
    fn report_detail(&self, detail: &str) {
        self.inner.report_detail(detail);
    }

    fn report_progress(&self, _percent: u8) {}

    fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let progress = LogProgress::new();
        let worker_view = progress.clone();
        assert!(worker_view.step(10, "Loading bands").is_ok());
        assert_eq!(progress.percent(), 10);

        progress.cancel_handle().store(true, Ordering::SeqCst);
        assert!(matches!(worker_view.step(20, "Calibrating"), Err(S2Error::Cancelled)));
        // Progress is not advanced once cancelled
        assert_eq!(progress.percent(), 10);
    }

    #[derive(Default)]
    struct Recorder {
        percents: Mutex<Vec<u8>>,
    }

    impl ProgressReporter for Recorder {
        fn report_detail(&self, _detail: &str) {}

        fn report_progress(&self, percent: u8) {
            self.percents.lock().unwrap().push(percent);
        }

        fn is_cancelled(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_batch_progress_only_moves_forward() {
        let recorder = Recorder::default();
        let batch = BatchProgress::new(&recorder, 4);

        batch.step(90, "scene A: writing masked bands").unwrap();
        batch.finish_item();
        batch.step(10, "scene B: loading bands").unwrap();
        batch.finish_item();
        batch.finish_item();
        batch.finish_item();

        assert_eq!(*recorder.percents.lock().unwrap(), vec![25, 50, 75, 100]);
    }

    #[test]
    fn test_batch_progress_forwards_cancellation() {
        let progress = LogProgress::new();
        let batch = BatchProgress::new(&progress, 2);
        progress.cancel();
        assert!(matches!(batch.step(0, "scene A"), Err(S2Error::Cancelled)));
    }

    #[test]
    fn test_no_progress_never_cancels() {
        assert!(NoProgress.check_cancelled().is_ok());
    }
}
