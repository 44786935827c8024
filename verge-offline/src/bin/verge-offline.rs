use clap::Parser;
use color_eyre::eyre::Result;

use verge::verge_start;

/// re-run the perception pipeline over a recorded tap segment
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct VergeOfflineCliArgs {
    /// Configuration file (JSON)
    config_file: std::path::PathBuf,
    /// Recorded tap segment to replay
    segment_file: std::path::PathBuf,
}

fn main() -> Result<()> {
    verge_start("verge-offline")?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = VergeOfflineCliArgs::parse();
    let cfg = verge_config_data::parse_config_file(&args.config_file)?;
    let stats = verge_offline::replay_segment(&cfg, &args.segment_file)?;
    println!(
        "{} datagrams ({} unparseable), {} frames, {} clusters, {} confirmed tracks",
        stats.datagrams,
        stats.parse_errors,
        stats.frames,
        stats.clusters,
        stats.confirmed_tracks
    );
    Ok(())
}
