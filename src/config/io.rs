use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use serde_json;

use crate::config::types::CentralConfig;
use crate::error::ConfigError;

/// Reads a config file. A missing or empty file yields the defaults.
pub async fn read(path: &Path) -> Result<CentralConfig, ConfigError> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CentralConfig::default());
        }
        Err(err) => return Err(err.into()),
    };

    let mut content = vec![];
    file.read_to_end(&mut content).await?;

    if content.is_empty() {
        return Ok(CentralConfig::default());
    }

    let config: CentralConfig = serde_json::from_slice(&content)?;
    Ok(config)
}

pub async fn save(path: &Path, config: &CentralConfig) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config)?;
    let mut file = File::create(path).await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
