//! `freetier device-id` command handler.

use anyhow::{Context, Result};

use freetier::config::Config;

use super::common::identity_resolver;

pub(crate) fn cmd_device_id(config: &Config) -> Result<()> {
    let device = identity_resolver(config)
        .device_id()
        .with_context(|| format!("Failed to read device id from {}", config.device_dir().display()))?;
    println!("{}", device);
    Ok(())
}
