use std::path::Path;

use anyhow::{Context, Result, bail};
use camcast_protocol::CamcastConfig;

/// Load configuration from a TOML file, falling back to defaults when the
/// file is absent. `port_override` (from `--port`) wins over the file.
pub fn load_config(path: &Path, port_override: Option<u16>) -> Result<CamcastConfig> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let parsed: CamcastConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config TOML: {}", path.display()))?;
        tracing::info!("Loaded config from {}", path.display());
        parsed
    } else {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        CamcastConfig::default()
    };

    if let Some(port) = port_override {
        config.server.port = port;
    }
    Ok(config)
}

/// Log every validation issue. Fails when at least one is an `ERROR:`.
pub fn check(config: &CamcastConfig) -> Result<()> {
    let Err(issues) = config.validate() else {
        return Ok(());
    };

    let mut errors = 0;
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            errors += 1;
            tracing::error!("{issue}");
        } else {
            tracing::warn!("{issue}");
        }
    }
    if errors > 0 {
        bail!("Configuration has {errors} error(s). Fix the ERROR(s) above and restart.");
    }
    Ok(())
}
