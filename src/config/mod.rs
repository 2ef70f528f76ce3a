mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./seedcast.toml",
        "~/.config/seedcast/config.toml",
        "/etc/seedcast/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Reject unusable settings; log the questionable ones.
fn validate_config(config: &Config) -> Result<()> {
    config
        .pipeline
        .validate_strict()
        .context("Invalid [pipeline] section")?;

    for warning in config.pipeline.validate() {
        tracing::warn!("Config: {}", warning);
    }

    if config.source.chunk_kib == 0 {
        anyhow::bail!("source.chunk_kib cannot be 0");
    }
    if config.source.chunk_kib > MAX_CHUNK_KIB {
        anyhow::bail!(
            "source.chunk_kib is {}; the maximum is {}",
            config.source.chunk_kib,
            MAX_CHUNK_KIB
        );
    }
    if config.source.rate_kib == Some(0) {
        anyhow::bail!("source.rate_kib cannot be 0; leave it unset for no limit");
    }

    Ok(())
}
