//! Progress reporting and structured diagnostics

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::RecoverableReason;
use crate::types::{SequenceInfo, TrackKind};

type ProgressCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Single-subscriber progress sink.
///
/// Reports are rounded to whole percent; a report that does not raise the
/// rounded value is dropped, so the subscriber sees a strictly increasing
/// sequence.
#[derive(Clone)]
pub struct ProgressSink {
    callback: Option<ProgressCallback>,
    last: Arc<Mutex<Option<u32>>>,
}

impl ProgressSink {
    /// Create a new sink from the given callback.
    pub fn new(callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// A sink that discards all reports.
    pub fn noop() -> Self {
        Self {
            callback: None,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Report a percentage in `0.0..=100.0`.
    pub fn report(&self, percent: f64) {
        let Some(callback) = &self.callback else {
            return;
        };
        let rounded = percent.round().clamp(0.0, 100.0) as u32;
        {
            let mut last = self.last.lock();
            if matches!(*last, Some(prev) if rounded <= prev) {
                return;
            }
            *last = Some(rounded);
        }
        callback(rounded);
    }

    /// Report `done` of `total` units scaled to 0..=99; 100 is reserved for completion.
    pub fn report_step(&self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        self.report(done as f64 * 99.0 / total as f64);
    }

    pub fn complete(&self) {
        self.report(100.0);
    }

    /// A fresh view of the same subscriber, with its own dedup state.
    pub fn fork(&self) -> Self {
        Self {
            callback: self.callback.clone(),
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Last rounded percentage emitted through this view
    pub fn last_reported(&self) -> Option<u32> {
        *self.last.lock()
    }
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("last", &self.last_reported())
            .finish_non_exhaustive()
    }
}

/// Structured events a caller may subscribe to in addition to `tracing` output
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    /// A fragment does not continue its predecessor on the same track tag
    Discontinuity {
        track: TrackKind,
        previous: SequenceInfo,
        current: SequenceInfo,
    },
    /// Composition offsets could not be dropped because some are non-zero
    FlattenSkipped { track_id: u32 },
    /// The init segment was rebuilt with 64-bit chunk offsets
    WideOffsetRetry { max_offset: u64 },
    /// The structural merge failed and the re-encode fallback took over
    FallbackEngaged { reason: RecoverableReason },
}

/// Optional subscriber for [`DiagnosticEvent`]s
#[derive(Clone)]
pub struct DiagnosticSink {
    callback: Arc<dyn Fn(&DiagnosticEvent) + Send + Sync>,
}

impl DiagnosticSink {
    pub fn new(callback: impl Fn(&DiagnosticEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    pub fn emit(&self, event: DiagnosticEvent) {
        (self.callback)(&event);
    }
}

impl std::fmt::Debug for DiagnosticSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticSink").finish_non_exhaustive()
    }
}

/// Emit to an optional sink
pub(crate) fn emit(sink: Option<&DiagnosticSink>, event: DiagnosticEvent) {
    if let Some(sink) = sink {
        sink.emit(event);
    }
}
