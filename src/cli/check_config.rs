//! `pacer check-config`.

use std::path::Path;

use crawl_pacer::config::ControllerConfig;

/// Load, validate and print the effective configuration as TOML.
pub async fn cmd_check_config(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let config = ControllerConfig::load_from_path(path).await?;
    tracing::info!(path = %path.display(), "Configuration is valid");

    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
