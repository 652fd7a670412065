pub mod types;

use anyhow::{Context, Result};

pub use types::Config;

pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = serde_yml::from_str(content).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}
