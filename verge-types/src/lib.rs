use serde::{Deserialize, Serialize};

pub mod calibration;
pub mod segment;
pub mod wire;

pub use calibration::RingCalibration;

/// Number of vertical laser channels on the supported sensor model.
///
/// The elevation angle of each ring is fixed per model; see
/// [`calibration::RingCalibration`].
pub const RING_COUNT: usize = 16;

/// Width of one background-grid azimuth bin, in degrees.
pub const AZIMUTH_BIN_DEG: f32 = 1.0;

/// Number of azimuth bins in the background grid.
pub const AZIMUTH_BIN_COUNT: usize = 360;

/// Identifies one physical sensor at a site.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize, Deserialize)]
pub struct SensorId(String);

impl SensorId {
    pub fn new<S: Into<String>>(s: S) -> Self {
        SensorId(s.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Monotonic number of a completed sweep within one process lifetime.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Default, Serialize, Deserialize,
)]
pub struct SweepFno(pub u64);

impl SweepFno {
    #[inline]
    pub fn next(&self) -> SweepFno {
        SweepFno(self.0 + 1)
    }
}

impl std::fmt::Display for SweepFno {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Globally unique track identity.
///
/// Random 128-bit ids survive process restarts and test resets without
/// collision, unlike sequence counters.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct TrackId(uuid::Uuid);

impl TrackId {
    pub fn new_random() -> Self {
        TrackId(uuid::Uuid::new_v4())
    }
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TrackId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TrackId(uuid::Uuid::parse_str(s)?))
    }
}

/// One laser return in sensor-local polar coordinates.
///
/// Created by the packet parser, consumed by the frame builder. Never
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPolar {
    /// Vertical channel index, `0..RING_COUNT`.
    pub ring: u8,
    /// Azimuth in degrees, wraps at 360.
    pub azimuth_deg: f32,
    /// Measured range in meters. 0.0 means no return.
    pub distance_m: f32,
    pub intensity: u8,
    /// Per-return timestamp, nanoseconds, monotonic within a frame.
    pub timestamp_ns: i64,
    /// Raw block azimuth in hundredths of a degree. Ordering key.
    pub block_azimuth: u16,
}

impl PointPolar {
    #[inline]
    pub fn azimuth_bin(&self) -> usize {
        let mut az = self.azimuth_deg % 360.0;
        if az < 0.0 {
            az += 360.0;
        }
        (az / AZIMUTH_BIN_DEG) as usize % AZIMUTH_BIN_COUNT
    }
}

/// A complete 360° rotation worth of returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepFrame {
    pub frame: SweepFno,
    pub sensor: SensorId,
    pub started_at_ns: i64,
    pub ended_at_ns: i64,
    pub points: Vec<PointPolar>,
}

impl SweepFrame {
    pub fn duration_ns(&self) -> i64 {
        self.ended_at_ns - self.started_at_ns
    }
}

/// A foreground return transformed into site coordinates.
///
/// Convention: X forward, Y right, Z up, meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: u8,
    pub timestamp_ns: i64,
    pub sensor_id: SensorId,
}

/// Oriented bounding box in the ground plane plus a vertical extent.
///
/// `heading_rad` is the direction of the principal axis from PCA of the 2D
/// projection, measured counterclockwise from +X.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Obb {
    pub cx: f64,
    pub cy: f64,
    pub length_m: f64,
    pub width_m: f64,
    pub height_m: f64,
    pub heading_rad: f64,
}

/// One DBSCAN output cluster with its computed metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldCluster {
    /// Per-frame cluster index.
    pub cluster_id: u32,
    /// Medoid centroid: the actual member point nearest the arithmetic
    /// mean, so non-convex clusters report an on-surface centroid.
    pub centroid: WorldPoint,
    pub aabb_min: [f64; 3],
    pub aabb_max: [f64; 3],
    pub obb: Obb,
    pub point_count: usize,
    pub intensity_mean: f64,
    /// 95th-percentile height above ground of the member points.
    pub height_p95: f64,
}

/// Track lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Deleted,
}

impl TrackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackState::Tentative => "tentative",
            TrackState::Confirmed => "confirmed",
            TrackState::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for TrackState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object class assigned by the rule-based classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectClass {
    Pedestrian,
    Car,
    Bird,
    Other,
}

impl ObjectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectClass::Pedestrian => "pedestrian",
            ObjectClass::Car => "car",
            ObjectClass::Bird => "bird",
            ObjectClass::Other => "other",
        }
    }
}

impl std::fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class: ObjectClass,
    /// In [0, 1].
    pub confidence: f64,
    /// Identifies the classifier that produced this result.
    pub model: String,
}

/// Per-track quality metrics accumulated by the tracker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackQuality {
    /// Angular agreement between the Kalman velocity and the displacement
    /// direction of the recent trail, radians.
    pub velocity_alignment_rad: f64,
    /// Running RMS of frame-to-frame heading delta, radians.
    pub heading_jitter_rad: f64,
    /// Running RMS of frame-to-frame speed delta, m/s.
    pub speed_jitter_mps: f64,
    pub occlusion_count: u32,
    /// Longest run of consecutive coasted frames.
    pub max_occlusion_frames: u32,
    pub merge_candidate: bool,
    pub split_candidate: bool,
}

// Rows as persisted. ------------------------------------------------

/// One row per completed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorFrameRow {
    pub sensor_id: SensorId,
    pub frame: SweepFno,
    pub started_at_ns: i64,
    pub ended_at_ns: i64,
    pub point_count: usize,
    pub foreground_count: usize,
    pub background_count: usize,
}

/// One row per emitted cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForegroundClusterRow {
    pub sensor_id: SensorId,
    pub frame: SweepFno,
    pub timestamp_ns: i64,
    pub cluster: WorldCluster,
}

/// Track summary row, upserted on confirmation and deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRow {
    pub id: TrackId,
    pub sensor_id: SensorId,
    pub state: TrackState,
    pub observation_count: u64,
    pub avg_length_m: f64,
    pub avg_width_m: f64,
    pub avg_height_m: f64,
    pub max_height_p95_m: f64,
    pub avg_speed_mps: f64,
    pub peak_speed_mps: f64,
    pub quality: TrackQuality,
    pub classification: Option<Classification>,
    pub first_seen_ns: i64,
    pub last_seen_ns: i64,
}

/// Per-frame snapshot persisted for confirmed tracks.
///
/// Keyed by (track id, timestamp); cascaded with the parent track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackObservationRow {
    pub track_id: TrackId,
    pub timestamp_ns: i64,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub speed_mps: f64,
    pub heading_rad: f64,
    pub obb_length_m: f64,
    pub obb_width_m: f64,
    pub obb_height_m: f64,
}

/// One gzipped background-grid snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSnapshotRow {
    pub sensor_id: SensorId,
    pub taken_at_ns: i64,
    /// "interval" for ticker flushes, "final_flush" at shutdown.
    pub reason: String,
    pub blob: Vec<u8>,
}
