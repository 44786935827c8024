use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Scene-level counters, updated by the processor and read by the
/// diagnostics logger.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_processed: AtomicU64,
    pub returns_seen: AtomicU64,
    pub foreground_points: AtomicU64,
    pub clusters_emitted: AtomicU64,
    /// Frames in which clustering found nothing despite foreground points.
    pub empty_box_frames: AtomicU64,
    pub tap_dropped: AtomicU64,
}

impl PipelineStats {
    pub fn record_frame(&self, returns: usize, foreground: usize, clusters: usize) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.returns_seen.fetch_add(returns as u64, Ordering::Relaxed);
        self.foreground_points
            .fetch_add(foreground as u64, Ordering::Relaxed);
        self.clusters_emitted
            .fetch_add(clusters as u64, Ordering::Relaxed);
        if foreground > 0 && clusters == 0 {
            self.empty_box_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tap_drop(&self) {
        self.tap_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of returns flagged foreground since startup.
    pub fn foreground_capture_ratio(&self) -> f64 {
        let returns = self.returns_seen.load(Ordering::Relaxed);
        if returns == 0 {
            return 0.0;
        }
        self.foreground_points.load(Ordering::Relaxed) as f64 / returns as f64
    }

    pub fn log_summary(&self) {
        info!(
            "pipeline: {} frames, {} returns, {} foreground ({:.4} capture), {} clusters, {} empty-box frames, {} tap drops",
            self.frames_processed.load(Ordering::Relaxed),
            self.returns_seen.load(Ordering::Relaxed),
            self.foreground_points.load(Ordering::Relaxed),
            self.foreground_capture_ratio(),
            self.clusters_emitted.load(Ordering::Relaxed),
            self.empty_box_frames.load(Ordering::Relaxed),
            self.tap_dropped.load(Ordering::Relaxed),
        );
    }
}
