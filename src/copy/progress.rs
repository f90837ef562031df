//! Copy progress reporting
//!
//! The copy engine reports through a [`ProgressSink`]. Sends never block and are
//! dropped once the sink is closed, so a slow or absent listener cannot stall or
//! fail a copy. [`ProgressTracker`] turns the update stream into throttled log
//! lines.

use crate::logging::Logger;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Snapshot of bytes transferred so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub total: u64,
    pub complete: u64,
}

/// Producer side of a progress channel. Closing is idempotent.
#[derive(Debug)]
pub struct ProgressSink {
    sender: Mutex<Option<mpsc::UnboundedSender<ProgressUpdate>>>,
    total: AtomicU64,
    complete: AtomicU64,
}

impl ProgressSink {
    /// A sink nobody listens to
    pub fn disabled() -> Self {
        Self {
            sender: Mutex::new(None),
            total: AtomicU64::new(0),
            complete: AtomicU64::new(0),
        }
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
        self.emit();
    }

    pub fn advance(&self, bytes: u64) {
        self.complete.fetch_add(bytes, Ordering::SeqCst);
        self.emit();
    }

    pub fn snapshot(&self) -> ProgressUpdate {
        ProgressUpdate {
            total: self.total.load(Ordering::SeqCst),
            complete: self.complete.load(Ordering::SeqCst),
        }
    }

    fn emit(&self) {
        let update = self.snapshot();
        let Ok(guard) = self.sender.lock() else {
            return;
        };
        if let Some(sender) = guard.as_ref() {
            // receiver gone is fine
            let _ = sender.send(update);
        }
    }

    /// Close the channel. Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        match self.sender.lock() {
            Ok(mut guard) => guard.take().is_some(),
            Err(poisoned) => poisoned.into_inner().take().is_some(),
        }
    }
}

/// Create a connected sink and receiver
pub fn progress_channel() -> (ProgressSink, mpsc::UnboundedReceiver<ProgressUpdate>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let sink = ProgressSink {
        sender: Mutex::new(Some(sender)),
        total: AtomicU64::new(0),
        complete: AtomicU64::new(0),
    };
    (sink, receiver)
}

/// Throttled progress display: every 5 seconds, every 10 MiB, or on completion
pub struct ProgressTracker {
    label: String,
    start_time: Instant,
    last_update: Instant,
    last_complete: u64,
    output: Logger,
}

impl ProgressTracker {
    const INTERVAL: Duration = Duration::from_secs(5);
    const STEP_BYTES: u64 = 10 * 1024 * 1024;

    pub fn new(label: String, output: Logger) -> Self {
        let now = Instant::now();
        Self {
            label,
            start_time: now,
            last_update: now,
            last_complete: 0,
            output,
        }
    }

    /// True when the update was displayed
    pub fn update(&mut self, update: ProgressUpdate) -> bool {
        let now = Instant::now();
        let finished = update.total > 0 && update.complete >= update.total;
        let due = now.duration_since(self.last_update) >= Self::INTERVAL
            || update.complete.saturating_sub(self.last_complete) >= Self::STEP_BYTES
            || finished;
        if !due || update.complete == self.last_complete && !finished {
            return false;
        }

        let percent = if update.total > 0 {
            (update.complete as f64 / update.total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        self.output.progress(&format!(
            "{}: {:.0}% ({}/{})",
            self.label,
            percent,
            self.output.format_size(update.complete),
            self.output.format_size(update.total)
        ));
        self.last_update = now;
        self.last_complete = update.complete;
        true
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Drain a receiver until its sink closes
    pub async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<ProgressUpdate>) {
        while let Some(update) = receiver.recv().await {
            self.update(update);
        }
        self.output.detail(&format!(
            "{}: progress stream closed after {}",
            self.label,
            self.output.format_duration(self.elapsed())
        ));
    }
}
