//! Realtime LiDAR perception engine.
//!
//! One [`processor::SweepProcessor`] per sensor runs the frame-serial path:
//! background classification, world transform, clustering, tracking,
//! classification, persistence. Upstream of it, [`parser::PacketParser`]
//! and [`frame_builder::FrameBuilder`] turn datagrams into complete sweeps
//! on the receive task.

pub mod assignment;
pub mod background_model;
pub mod classifier;
pub mod clusterer;
pub mod frame_builder;
pub mod parser;
pub mod processor;
pub mod stats;
pub mod tracker;
pub mod transform;

pub use background_model::{BackgroundGrid, BackgroundSnapshotData};
pub use frame_builder::{FrameBuilder, FrameSlot};
pub use parser::{PacketParser, ParsedPacket};
pub use processor::{ForegroundFrame, FrameSummary, SweepProcessor};
pub use tracker::{Track, Tracker};
pub use transform::SensorPose;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Wire {
        #[from]
        source: verge_types::wire::WireError,
    },
    #[error("{source}")]
    Calibration {
        #[from]
        source: verge_types::calibration::CalibrationError,
    },
    #[error("invalid sensor pose: {what}")]
    InvalidPose { what: String },
    #[error("snapshot serialization error: {source}")]
    SnapshotJson {
        #[from]
        source: serde_json::Error,
    },
    #[error("snapshot IO error: {source}")]
    SnapshotIo {
        #[from]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
