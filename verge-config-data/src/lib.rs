use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

mod tuning;
pub use tuning::TuningParams;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("JSON deserialization error: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {what}")]
    Invalid { what: String },
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn invalid<T>(what: impl Into<String>) -> Result<T> {
    Err(Error::Invalid { what: what.into() })
}

/// Split `path` (which must be a file) into directory and filename component.
fn split_path<P: AsRef<Path>>(path: P) -> (PathBuf, PathBuf) {
    let path = path.as_ref();
    let mut components = path.components();
    let filename = components
        .next_back()
        .map(|c| PathBuf::from(c.as_os_str()))
        .unwrap_or_default();
    let dirname = components.as_path().into();
    (dirname, filename)
}

/// If `path` is relative, make it relative to `dirname`.
///
/// `path` must be utf-8 encoded and can start with a tilde, which is expanded
/// to the home directory.
fn fixup_relative_path(path: &mut PathBuf, dirname: &Path) -> Result<()> {
    let pathstr = path.to_str().ok_or_else(|| Error::Invalid {
        what: format!("non-utf8 path {}", path.display()),
    })?;
    let expanded = shellexpand::full(pathstr)?;
    *path = PathBuf::from(expanded.to_string());

    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

/// Top-level configuration for one verge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VergeConfig {
    /// Site-unique name of the LiDAR sensor this process serves.
    pub sensor_id: String,
    /// UDP address the sensor streams datagrams to.
    pub lidar_udp_addr: String,
    /// SQLite database file. Can contain shell variables such as `~`,
    /// `$A`, or `${B}`.
    pub database_path: PathBuf,
    /// Per-ring elevation calibration JSON. When absent the factory table
    /// for the sensor model is used.
    pub calibration_path: Option<PathBuf>,
    /// When set, every received datagram is also appended to this segment
    /// file by the recording tap.
    pub tap_output_path: Option<PathBuf>,
    /// When set, foreground-only returns are re-emitted to this UDP address
    /// in the vendor wire format.
    pub foreground_udp_addr: Option<String>,
    /// Row-major 4x4 affine sensor-to-world pose. Identity when absent.
    pub sensor_pose: Option<Vec<f64>>,
    /// Every numeric tunable of the pipeline.
    pub tuning: TuningParams,
}

impl VergeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sensor_id.is_empty() {
            return invalid("sensor_id must not be empty");
        }
        if let Some(pose) = &self.sensor_pose {
            if pose.len() != 16 {
                return invalid(format!(
                    "sensor_pose must have 16 row-major entries, got {}",
                    pose.len()
                ));
            }
            if pose.iter().any(|v| !v.is_finite()) {
                return invalid("sensor_pose entries must be finite");
            }
        }
        self.tuning.validate()
    }
}

/// Parse the configuration file at `fname`, validate it, and fix up any
/// relative paths it contains to be relative to the file's own directory.
pub fn parse_config_file<P: AsRef<Path>>(fname: P) -> Result<VergeConfig> {
    let fname = fname.as_ref();
    let buf = std::fs::read_to_string(fname)?;
    let mut cfg: VergeConfig = serde_json::from_str(&buf)?;

    let (dirname, _) = split_path(fname);
    fixup_relative_path(&mut cfg.database_path, &dirname)?;
    if let Some(p) = cfg.calibration_path.as_mut() {
        fixup_relative_path(p, &dirname)?;
    }
    if let Some(p) = cfg.tap_output_path.as_mut() {
        fixup_relative_path(p, &dirname)?;
    }

    cfg.validate()?;
    Ok(cfg)
}

/// Single source of truth for all numeric parameters.
///
/// Loaded once at startup and read by every stage; hot reloads swap the
/// whole parameter set atomically so components pick up changes at frame
/// boundaries.
#[derive(Debug, Clone)]
pub struct TuningRegistry {
    inner: Arc<RwLock<Arc<TuningParams>>>,
}

impl TuningRegistry {
    pub fn new(params: TuningParams) -> Self {
        TuningRegistry {
            inner: Arc::new(RwLock::new(Arc::new(params))),
        }
    }

    /// The current parameter set. Cheap; intended to be called once per
    /// frame so an in-flight frame sees one consistent set.
    pub fn current(&self) -> Arc<TuningParams> {
        self.inner.read().clone()
    }

    /// Atomically replace the parameter set.
    pub fn replace(&self, params: TuningParams) {
        *self.inner.write() = Arc::new(params);
    }

    /// Re-read the config file and swap in its tuning section.
    pub fn reload_from_file<P: AsRef<Path>>(&self, fname: P) -> Result<()> {
        let cfg = parse_config_file(&fname)?;
        self.replace(cfg.tuning);
        info!(
            "tuning registry reloaded from {}",
            fname.as_ref().display()
        );
        Ok(())
    }
}

/// Seconds-valued config field as a [`Duration`].
pub fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value)
}
