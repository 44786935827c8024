//! Replay recorded tap segments through the full perception pipeline,
//! producing the same database rows the live service would have written.

use std::path::Path;

use tracing::{info, warn};

use sweep2::{FrameBuilder, PacketParser, SensorPose, SweepProcessor};
use verge_config_data::{TuningRegistry, VergeConfig};
use verge_store::spawn_store_writer;
use verge_types::segment::SegmentReader;
use verge_types::{RingCalibration, SensorId};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    Segment {
        #[from]
        source: verge_types::segment::SegmentError,
    },
    #[error("{source}")]
    Calibration {
        #[from]
        source: verge_types::calibration::CalibrationError,
    },
    #[error("{source}")]
    Sweep2 {
        #[from]
        source: sweep2::Error,
    },
    #[error("{source}")]
    Store {
        #[from]
        source: verge_store::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Default, Clone)]
pub struct ReplayStats {
    pub datagrams: u64,
    pub parse_errors: u64,
    pub frames: u64,
    pub clusters: u64,
    pub confirmed_tracks: usize,
}

/// Run the recorded datagrams through parser, frame builder and processor,
/// persisting into the configured database.
///
/// Replay is frame-serial and uses the recorded timestamps, so the output
/// is deterministic for a given segment and configuration.
pub fn replay_segment<P: AsRef<Path>>(cfg: &VergeConfig, segment_path: P) -> Result<ReplayStats> {
    let sensor = SensorId::new(cfg.sensor_id.clone());
    let registry = TuningRegistry::new(cfg.tuning.clone());
    let calibration = match &cfg.calibration_path {
        Some(path) => RingCalibration::from_json_file(path)?,
        None => RingCalibration::sr16(),
    };
    let pose = match &cfg.sensor_pose {
        Some(entries) => SensorPose::from_row_major(entries)?,
        None => SensorPose::identity(),
    };

    let mut reader = SegmentReader::new(std::fs::File::open(segment_path.as_ref())?)?;
    info!("replaying {}", segment_path.as_ref().display());

    let (store, store_join) = spawn_store_writer(&cfg.database_path, 4096)?;
    let processor = SweepProcessor::new(
        sensor.clone(),
        registry.clone(),
        calibration.clone(),
        pose,
        store.clone(),
    );
    let parser = PacketParser::new(calibration);
    let mut builder = FrameBuilder::new(sensor);

    let mut stats = ReplayStats::default();
    let mut last_data_ns = 0i64;
    while let Some(datagram) = reader.next_datagram()? {
        stats.datagrams += 1;
        let params = registry.current();
        match parser.parse_datagram(&datagram) {
            Ok(parsed) => {
                builder.set_motor_rpm(parsed.motor_rpm);
                for pt in parsed.points {
                    last_data_ns = last_data_ns.max(pt.timestamp_ns);
                    if let Some(frame) = builder.push_point(pt, &params) {
                        let summary = processor.process_frame(frame);
                        stats.frames += 1;
                        stats.clusters += summary.clusters as u64;
                        stats.confirmed_tracks = summary.confirmed_tracks;
                    }
                }
            }
            Err(e) => {
                warn!("datagram {} unparseable: {e}", stats.datagrams);
            }
        }
    }
    stats.parse_errors = parser.parse_error_count();

    // Flush the trailing partial frame the same way the live cleanup
    // timer would.
    let params = registry.current();
    let far_future = last_data_ns + (params.buffer_timeout * 1e9) as i64 + 1;
    if let Some(frame) = builder.finalize_stale(far_future, &params) {
        let summary = processor.process_frame(frame);
        stats.frames += 1;
        stats.clusters += summary.clusters as u64;
        stats.confirmed_tracks = summary.confirmed_tracks;
    }

    if let Err(e) = processor.flush_snapshot("final_flush", last_data_ns) {
        warn!("final snapshot failed: {e}");
    }
    store.quit();
    match store_join.join() {
        Ok(result) => result?,
        Err(_) => warn!("store writer panicked"),
    }

    info!(
        "replay done: {} datagrams, {} frames, {} clusters",
        stats.datagrams, stats.frames, stats.clusters
    );
    Ok(stats)
}
