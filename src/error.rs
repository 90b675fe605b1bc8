//! Error taxonomy and the batching error reporter (spec.md §7).
//!
//! Propagation policy: I/O and deserialization failures are caught at C2/C3 and never
//! cross into C4 as a `Result` the caller must unwrap; C4 surfaces `Option`-like
//! results instead. C5 and C6 never let an error cross a thread boundary — every
//! failure they observe is recorded here and handled locally (retry, skip, log).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::chunk::ChunkPos;

/// Failures the mesh pipeline (C5) can raise while building CPU buffers or uploading
/// them to the GPU. Classified so the retry machinery knows what to do with each.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("transient mesh build failure: {0}")]
    Transient(String),
    #[error("fatal mesh build failure: {0}")]
    Fatal(String),
    #[error("GPU upload failed: {0}")]
    GpuUpload(String),
}

/// The broad class an error is reported under, used to pick the right atomic counter
/// and the flush-on-critical rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientIo,
    Corruption,
    GenerationFailure,
    MeshBuildFailure,
    MaxRetriesExhausted,
    GpuUploadFailure,
    StateMachineMisuse,
}

impl ErrorClass {
    /// Whether this class always forces an immediate flush instead of waiting for the
    /// batch threshold (spec.md §7: "or when a critical error is observed").
    fn is_critical(self) -> bool {
        matches!(self, ErrorClass::Corruption | ErrorClass::GenerationFailure)
    }
}

/// One diagnostic captured alongside an error report.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub class: ErrorClass,
    pub message: String,
    pub chunk: Option<ChunkPos>,
    pub at: Instant,
    /// Chunk state/dirty flags and render-frame context, attached by the mesh
    /// pipeline (C5) when it reports a build or GPU-upload failure (spec.md §7:
    /// diagnostics "include chunk state, dirty flags, frame budget, and queue
    /// depth"). `None` for reports from other modules, which have no frame to
    /// describe.
    pub context: Option<DiagnosticContext>,
}

/// Chunk and render-frame context attached to a mesh/GPU diagnostic.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticContext {
    pub chunk_state_bits: u8,
    pub blocks_dirty: bool,
    pub mesh_dirty: bool,
    pub frame: FrameContext,
}

/// Lock-free counters per error class plus a bounded ring of recent diagnostics,
/// flushed to `tracing::error!` every `flush_every` reports or immediately on a
/// critical class (spec.md §7).
pub struct ErrorReporter {
    transient_io: AtomicU64,
    corruption: AtomicU64,
    generation_failure: AtomicU64,
    mesh_build_failure: AtomicU64,
    max_retries_exhausted: AtomicU64,
    gpu_upload_failure: AtomicU64,
    state_machine_misuse: AtomicU64,
    ring: Mutex<Vec<Diagnostic>>,
    flush_every: usize,
    ring_capacity: usize,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(10, 64)
    }
}

impl ErrorReporter {
    pub fn new(flush_every: usize, ring_capacity: usize) -> Self {
        Self {
            transient_io: AtomicU64::new(0),
            corruption: AtomicU64::new(0),
            generation_failure: AtomicU64::new(0),
            mesh_build_failure: AtomicU64::new(0),
            max_retries_exhausted: AtomicU64::new(0),
            gpu_upload_failure: AtomicU64::new(0),
            state_machine_misuse: AtomicU64::new(0),
            ring: Mutex::new(Vec::new()),
            flush_every: flush_every.max(1),
            ring_capacity: ring_capacity.max(1),
        }
    }

    fn counter(&self, class: ErrorClass) -> &AtomicU64 {
        match class {
            ErrorClass::TransientIo => &self.transient_io,
            ErrorClass::Corruption => &self.corruption,
            ErrorClass::GenerationFailure => &self.generation_failure,
            ErrorClass::MeshBuildFailure => &self.mesh_build_failure,
            ErrorClass::MaxRetriesExhausted => &self.max_retries_exhausted,
            ErrorClass::GpuUploadFailure => &self.gpu_upload_failure,
            ErrorClass::StateMachineMisuse => &self.state_machine_misuse,
        }
    }

    pub fn count(&self, class: ErrorClass) -> u64 {
        self.counter(class).load(Ordering::Relaxed)
    }

    /// Record a diagnostic, buffering it until the batch threshold or a critical class
    /// forces an immediate flush.
    pub fn report(&self, class: ErrorClass, message: impl Into<String>, chunk: Option<ChunkPos>) {
        self.report_with_context(class, message, chunk, None)
    }

    /// Like [`Self::report`], but attaches chunk-state/dirty-flag/frame context — used
    /// by the mesh pipeline (C5) for build and GPU-upload failures (spec.md §7).
    pub fn report_with_context(
        &self,
        class: ErrorClass,
        message: impl Into<String>,
        chunk: Option<ChunkPos>,
        context: Option<DiagnosticContext>,
    ) {
        self.counter(class).fetch_add(1, Ordering::Relaxed);

        let diagnostic = Diagnostic {
            class,
            message: message.into(),
            chunk,
            at: Instant::now(),
            context,
        };

        let mut ring = self.ring.lock();
        if ring.len() >= self.ring_capacity {
            ring.remove(0);
        }
        ring.push(diagnostic);

        if class.is_critical() || ring.len() >= self.flush_every {
            let batch = std::mem::take(&mut *ring);
            drop(ring);
            self.flush(&batch);
        }
    }

    fn flush(&self, batch: &[Diagnostic]) {
        for diagnostic in batch {
            tracing::error!(
                class = ?diagnostic.class,
                chunk = ?diagnostic.chunk,
                age_ms = diagnostic.at.elapsed().as_millis() as u64,
                state_bits = ?diagnostic.context.map(|c| c.chunk_state_bits),
                blocks_dirty = ?diagnostic.context.map(|c| c.blocks_dirty),
                mesh_dirty = ?diagnostic.context.map(|c| c.mesh_dirty),
                frame = ?diagnostic.context.map(|c| c.frame.to_string()),
                "{}",
                diagnostic.message
            );
        }
    }

    /// Force a flush of whatever is currently buffered, regardless of threshold.
    pub fn flush_now(&self) {
        let mut ring = self.ring.lock();
        let batch = std::mem::take(&mut *ring);
        drop(ring);
        self.flush(&batch);
    }
}

/// Convenience wrapper pairing a reporter with the render-frame context the mesh
/// pipeline wants attached to GPU/mesh diagnostics (frame budget, queue depth).
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameContext {
    pub gpu_budget: u32,
    pub cpu_ready_queue_depth: usize,
}

impl std::fmt::Display for FrameContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "budget={} queue_depth={}",
            self.gpu_budget, self.cpu_ready_queue_depth
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_every_n_reports() {
        let reporter = ErrorReporter::new(3, 16);
        for i in 0..2 {
            reporter.report(ErrorClass::TransientIo, format!("hiccup {i}"), None);
        }
        assert_eq!(reporter.ring.lock().len(), 2);
        reporter.report(ErrorClass::TransientIo, "hiccup 2", None);
        assert_eq!(reporter.ring.lock().len(), 0);
        assert_eq!(reporter.count(ErrorClass::TransientIo), 3);
    }

    #[test]
    fn critical_class_flushes_immediately() {
        let reporter = ErrorReporter::new(10, 16);
        reporter.report(ErrorClass::Corruption, "bad header", Some((1, 2)));
        assert_eq!(reporter.ring.lock().len(), 0);
        assert_eq!(reporter.count(ErrorClass::Corruption), 1);
    }

    #[test]
    fn ring_is_bounded() {
        let reporter = ErrorReporter::new(1_000_000, 4);
        for i in 0..10 {
            reporter.report(ErrorClass::MeshBuildFailure, format!("fail {i}"), None);
        }
        assert!(reporter.ring.lock().len() <= 4);
    }
}
