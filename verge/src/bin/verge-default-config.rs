use clap::Parser;
use color_eyre::eyre::Result;
use tracing::debug;

use verge::verge_start;
use verge_config_data::{TuningParams, VergeConfig};

/// show a complete, valid configuration in JSON format
#[derive(Debug, Parser)]
#[command(author, version)]
struct VergeDefaultConfigCliArgs {}

fn main() -> Result<()> {
    verge_start("default-config")?;

    let args = VergeDefaultConfigCliArgs::parse();
    debug!("{:?}", args);

    let cfg = VergeConfig {
        sensor_id: "sensor-1".to_string(),
        lidar_udp_addr: "0.0.0.0:2368".to_string(),
        database_path: "verge.sqlite".into(),
        calibration_path: None,
        tap_output_path: None,
        foreground_udp_addr: None,
        sensor_pose: None,
        tuning: TuningParams::recommended(),
    };
    println!("{}", serde_json::to_string_pretty(&cfg)?);

    Ok(())
}
