use clap::Parser;
use color_eyre::eyre::Result;

use verge::verge_start;
use verge_config_data::parse_config_file;

mod pipeline;
mod tap;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct VergeRunCliArgs {
    /// Configuration file (JSON)
    config_file: std::path::PathBuf,
}

fn main() -> Result<()> {
    verge_start("verge-run")?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = VergeRunCliArgs::parse();
    let cfg = parse_config_file(&args.config_file)?;
    tracing::info!(
        "verge-run starting for sensor {} on {}",
        cfg.sensor_id,
        cfg.lidar_udp_addr
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(pipeline::run(cfg, args.config_file))
}
