use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use verge_config_data::TuningParams;
use verge_types::{PointPolar, SensorId, SweepFno, SweepFrame};

/// Azimuth coverage (in 1° bins) required for wrap-triggered completion.
const MIN_WRAP_COVERAGE_BINS: u32 = 340;
/// Azimuth coverage required for time-triggered completion.
const MIN_TIME_COVERAGE_BINS: u32 = 270;
const WRAP_HIGH_DEG: f32 = 350.0;
const WRAP_LOW_DEG: f32 = 10.0;

struct AccumulatingFrame {
    frame: SweepFno,
    started_at_ns: i64,
    last_at_ns: i64,
    points: Vec<PointPolar>,
    bins_seen: [bool; verge_types::AZIMUTH_BIN_COUNT],
    bins_count: u32,
}

impl AccumulatingFrame {
    fn new(frame: SweepFno, first: &PointPolar) -> Self {
        AccumulatingFrame {
            frame,
            started_at_ns: first.timestamp_ns,
            last_at_ns: first.timestamp_ns,
            points: Vec::with_capacity(30_000),
            bins_seen: [false; verge_types::AZIMUTH_BIN_COUNT],
            bins_count: 0,
        }
    }

    fn push(&mut self, pt: PointPolar) {
        let bin = pt.azimuth_bin();
        if !self.bins_seen[bin] {
            self.bins_seen[bin] = true;
            self.bins_count += 1;
        }
        if pt.timestamp_ns > self.last_at_ns {
            self.last_at_ns = pt.timestamp_ns;
        }
        self.points.push(pt);
    }

    fn into_frame(self, sensor: &SensorId) -> SweepFrame {
        SweepFrame {
            frame: self.frame,
            sensor: sensor.clone(),
            started_at_ns: self.started_at_ns,
            ended_at_ns: self.last_at_ns,
            points: self.points,
        }
    }
}

/// Assembles the ordered return stream into complete 360° sweeps.
///
/// Completion is hybrid: the azimuth wrap is the primary trigger, with a
/// time-based fallback sized from the motor speed so that dropped packets
/// around the wrap cannot stall the pipeline. At most one frame is in
/// progress at a time.
pub struct FrameBuilder {
    sensor: SensorId,
    next_frame: SweepFno,
    /// `None` until a non-zero RPM has been reported. RPM 0 disables the
    /// time-based completion arm but ingest continues.
    expected_frame_duration_ns: Option<i64>,
    current: Option<AccumulatingFrame>,
    prev_azimuth_deg: Option<f32>,
    frames_completed: u64,
    frames_discarded: u64,
}

impl FrameBuilder {
    pub fn new(sensor: SensorId) -> Self {
        FrameBuilder {
            sensor,
            next_frame: SweepFno(0),
            expected_frame_duration_ns: None,
            current: None,
            prev_azimuth_deg: None,
            frames_completed: 0,
            frames_discarded: 0,
        }
    }

    /// Recalculate the expected frame duration from a motor-speed reading.
    pub fn set_motor_rpm(&mut self, rpm: u16) {
        let next = if rpm == 0 {
            None
        } else {
            Some(60_000_000_000i64 / rpm as i64)
        };
        if next != self.expected_frame_duration_ns {
            debug!(
                "expected frame duration now {:?} ns (motor {} rpm)",
                next, rpm
            );
            self.expected_frame_duration_ns = next;
        }
    }

    pub fn expected_frame_duration_ns(&self) -> Option<i64> {
        self.expected_frame_duration_ns
    }

    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    pub fn frames_discarded(&self) -> u64 {
        self.frames_discarded
    }

    /// Feed one return. Returns a completed frame when `pt` triggered a
    /// frame boundary; `pt` itself always starts (or continues) the next
    /// frame.
    pub fn push_point(&mut self, pt: PointPolar, params: &TuningParams) -> Option<SweepFrame> {
        let completed = self.check_completion(&pt, params);

        self.prev_azimuth_deg = Some(pt.azimuth_deg);
        match self.current.as_mut() {
            Some(cur) => cur.push(pt),
            None => {
                let frame = self.next_frame;
                self.next_frame = frame.next();
                let mut cur = AccumulatingFrame::new(frame, &pt);
                cur.push(pt);
                self.current = Some(cur);
            }
        }

        completed.map(|cur| {
            self.frames_completed += 1;
            cur.into_frame(&self.sensor)
        })
    }

    fn check_completion(
        &mut self,
        pt: &PointPolar,
        params: &TuningParams,
    ) -> Option<AccumulatingFrame> {
        let cur = self.current.as_ref()?;
        let elapsed = pt.timestamp_ns.saturating_sub(cur.started_at_ns);

        // Time-based fallback: the sweep period elapsed (plus 10% slack)
        // and we already cover most of the circle.
        if params.enable_time_based {
            if let Some(expected) = self.expected_frame_duration_ns {
                if elapsed >= expected + expected / 10 && cur.bins_count >= MIN_TIME_COVERAGE_BINS {
                    return self.current.take();
                }
            }
        }

        // Azimuth wrap.
        let wrapped = self
            .prev_azimuth_deg
            .map(|prev| prev > WRAP_HIGH_DEG && pt.azimuth_deg < WRAP_LOW_DEG)
            .unwrap_or(false);
        if wrapped {
            let half_period_elapsed = params.enable_time_based
                && self
                    .expected_frame_duration_ns
                    .map(|expected| elapsed >= expected / 2)
                    .unwrap_or(false);
            let full_coverage = cur.bins_count >= MIN_WRAP_COVERAGE_BINS
                && cur.points.len() >= params.min_frame_points;
            if half_period_elapsed || full_coverage {
                return self.current.take();
            }
        }

        None
    }

    /// Finalise a stalled in-progress frame.
    ///
    /// Called by the cleanup timer. A stalled frame that meets the
    /// coverage and point-count minimums is emitted; otherwise it is
    /// discarded and counted.
    pub fn finalize_stale(&mut self, now_ns: i64, params: &TuningParams) -> Option<SweepFrame> {
        let stale = {
            let cur = self.current.as_ref()?;
            let timeout_ns = (params.buffer_timeout * 1e9) as i64;
            now_ns.saturating_sub(cur.last_at_ns) >= timeout_ns
        };
        if !stale {
            return None;
        }
        let cur = self.current.take()?;
        self.prev_azimuth_deg = None;
        if cur.bins_count >= MIN_WRAP_COVERAGE_BINS && cur.points.len() >= params.min_frame_points {
            self.frames_completed += 1;
            Some(cur.into_frame(&self.sensor))
        } else {
            self.frames_discarded += 1;
            debug!(
                "discarding stale frame {} ({} points, {} bins)",
                cur.frame,
                cur.points.len(),
                cur.bins_count
            );
            None
        }
    }
}

struct SlotInner {
    slot: parking_lot::Mutex<Option<SweepFrame>>,
    notify: tokio::sync::Notify,
    dropped: AtomicU64,
}

/// Latest-wins hand-off of completed frames to the processor task.
///
/// Capacity is one: if the processor is still busy with the previous frame
/// when a new one completes, the pending frame is overwritten and the drop
/// counted. Raw frames are never queued indefinitely.
#[derive(Clone)]
pub struct FrameSlot {
    inner: Arc<SlotInner>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        FrameSlot {
            inner: Arc::new(SlotInner {
                slot: parking_lot::Mutex::new(None),
                notify: tokio::sync::Notify::new(),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn publish(&self, frame: SweepFrame) {
        let overwritten = {
            let mut guard = self.inner.slot.lock();
            guard.replace(frame).is_some()
        };
        if overwritten {
            let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("processor busy, pending frame overwritten ({total} dropped so far)");
        }
        self.inner.notify.notify_one();
    }

    pub fn try_take(&self) -> Option<SweepFrame> {
        self.inner.slot.lock().take()
    }

    /// Wait until a frame is available and take it.
    pub async fn take(&self) -> SweepFrame {
        loop {
            if let Some(frame) = self.try_take() {
                return frame;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verge_config_data::TuningParams;

    fn pt(ring: u8, azimuth_deg: f32, timestamp_ns: i64) -> PointPolar {
        PointPolar {
            ring,
            azimuth_deg,
            distance_m: 20.0,
            intensity: 50,
            timestamp_ns,
            block_azimuth: (azimuth_deg * 100.0) as u16,
        }
    }

    fn params() -> TuningParams {
        let mut p = TuningParams::recommended();
        p.min_frame_points = 100;
        p
    }

    /// Synthesize `rotations` full sweeps at `points_per_rot` points each,
    /// optionally dropping azimuth ranges, and feed them through.
    fn run_sweeps(
        builder: &mut FrameBuilder,
        params: &TuningParams,
        rotations: usize,
        points_per_rot: usize,
        keep: impl Fn(usize, f32) -> bool,
    ) -> Vec<SweepFrame> {
        let period_ns = 100_000_000i64; // 10 Hz
        let mut out = Vec::new();
        for rot in 0..rotations {
            for i in 0..points_per_rot {
                let az = 360.0 * i as f32 / points_per_rot as f32;
                if !keep(rot, az) {
                    continue;
                }
                let t = rot as i64 * period_ns
                    + (period_ns * i as i64) / points_per_rot as i64;
                if let Some(frame) = builder.push_point(pt(0, az, t), params) {
                    out.push(frame);
                }
            }
        }
        out
    }

    #[test]
    fn wrap_completion_preserves_all_points() {
        let params = params();
        let mut builder = FrameBuilder::new(SensorId::new("s1"));
        builder.set_motor_rpm(600);

        let n = 3600;
        let frames = run_sweeps(&mut builder, &params, 3, n, |_, _| true);
        // Two wraps seen; third rotation still accumulating.
        assert_eq!(frames.len(), 2);
        for frame in &frames {
            assert_eq!(frame.points.len(), n);
        }
        // Frame point counts sum to the input minus the in-progress frame.
        let accumulated: usize = frames.iter().map(|f| f.points.len()).sum();
        assert_eq!(accumulated, 2 * n);
        // Contiguous timing: next frame starts after previous ends.
        assert!(frames[1].started_at_ns >= frames[0].ended_at_ns);
        assert_eq!(builder.frames_completed(), 2);
    }

    #[test]
    fn frame_ids_are_monotonic() {
        let params = params();
        let mut builder = FrameBuilder::new(SensorId::new("s1"));
        let frames = run_sweeps(&mut builder, &params, 4, 1000, |_, _| true);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.frame, SweepFno(i as u64));
        }
    }

    #[test]
    fn time_based_fallback_survives_wrap_loss() {
        // Drop everything between 340 and 360 degrees: the wrap is never
        // observed, so only the time-based arm can complete frames.
        let params = params();
        let mut builder = FrameBuilder::new(SensorId::new("s1"));
        builder.set_motor_rpm(600); // 100 ms per rotation

        let frames = run_sweeps(&mut builder, &params, 4, 3600, |_, az| az < 340.0);
        assert!(!frames.is_empty());
        let expected = builder.expected_frame_duration_ns().unwrap();
        for frame in &frames {
            // No frame took longer than 1.2x the expected duration.
            assert!(frame.duration_ns() <= expected + expected / 5);
        }
    }

    #[test]
    fn rpm_zero_disables_time_based_completion() {
        let mut params = params();
        params.min_frame_points = 10_000_000; // make the wrap arm unreachable
        let mut builder = FrameBuilder::new(SensorId::new("s1"));
        builder.set_motor_rpm(0);

        let frames = run_sweeps(&mut builder, &params, 5, 3600, |_, _| true);
        // Neither arm can fire: ingest continues with no completions.
        assert!(frames.is_empty());
        assert_eq!(builder.frames_completed(), 0);
    }

    #[test]
    fn stale_frame_discarded_when_below_minimums() {
        let params = params();
        let mut builder = FrameBuilder::new(SensorId::new("s1"));
        builder.set_motor_rpm(600);

        // A sliver of a rotation, then the stream stalls.
        for i in 0..50 {
            let az = i as f32 * 0.1;
            assert!(builder
                .push_point(pt(0, az, i as i64 * 27_000), &params)
                .is_none());
        }
        let much_later = 10_000_000_000;
        assert!(builder.finalize_stale(much_later, &params).is_none());
        assert_eq!(builder.frames_discarded(), 1);
    }

    #[tokio::test]
    async fn frame_slot_overwrites_pending() {
        let slot = FrameSlot::new();
        let mk = |fno: u64| SweepFrame {
            frame: SweepFno(fno),
            sensor: SensorId::new("s1"),
            started_at_ns: 0,
            ended_at_ns: 1,
            points: vec![],
        };
        slot.publish(mk(1));
        slot.publish(mk(2));
        assert_eq!(slot.dropped_count(), 1);
        let got = slot.take().await;
        assert_eq!(got.frame, SweepFno(2));
        assert!(slot.try_take().is_none());
    }
}
