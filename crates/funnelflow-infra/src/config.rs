//! Engine configuration loader and data-directory resolution.
//!
//! Reads `config.toml` from the data directory (`~/.funnelflow/` unless
//! `FUNNELFLOW_DATA_DIR` is set) into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use funnelflow_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "FUNNELFLOW_DATA_DIR";

/// Resolve the data directory: `$FUNNELFLOW_DATA_DIR`, else `~/.funnelflow`,
/// else `./.funnelflow` when no home directory is known.
pub fn resolve_data_dir() -> PathBuf {
    data_dir_from(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
}

fn data_dir_from(env_override: Option<PathBuf>) -> PathBuf {
    match env_override {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".funnelflow"),
    }
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: defaults.
/// - Unreadable or malformed file: WARN and defaults.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}
