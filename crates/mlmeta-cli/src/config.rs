use anyhow::{Context, Result};
use mlmeta_storage::StoreConfig;
use std::fs;
use std::path::Path;

pub const DEFAULT_DB_PATH: &str = "mlmeta.db";

pub fn parse_store_config(raw: &str) -> Result<StoreConfig> {
    let config: StoreConfig = toml::from_str(raw).context("invalid store config")?;
    config.validate()?;
    Ok(config)
}

/// Loads the config file if one is given; `db` (flag or `MLMETA_DB`) overrides its path.
pub fn load_store_config(config_path: Option<&Path>, db: Option<&Path>) -> Result<StoreConfig> {
    let mut config = match config_path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            parse_store_config(&raw).with_context(|| format!("failed to load {}", path.display()))?
        }
        None => StoreConfig::new(DEFAULT_DB_PATH),
    };

    if let Some(db) = db {
        config.path = db.to_path_buf();
    }
    Ok(config)
}
