use color_eyre::eyre::Result;

/// Process-wide startup shared by every verge binary.
pub fn verge_start(_name: &str) -> Result<()> {
    color_eyre::install()?;

    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var(
            "RUST_LOG",
            "verge=info,verge_run=info,sweep2=info,verge_store=info,verge_config_data=info,warn",
        );
    }
    Ok(())
}
