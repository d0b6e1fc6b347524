//! `check-config` subcommand handler.

use std::path::PathBuf;

use anyhow::{anyhow, bail};

use kernelhive_config::{ConfigLoader, ConfigValidator};

/// Load and validate a configuration file, printing every finding.
pub(crate) fn check_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = path
        .or_else(ConfigLoader::default_path)
        .ok_or_else(|| anyhow!("no configuration path given and no config directory found"))?;

    let config = ConfigLoader::load(&path)?;
    let result = ConfigValidator::validate(&config);

    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    for error in &result.errors {
        println!("error: {}", error);
    }

    if !result.is_valid() {
        bail!("{} is invalid ({} errors)", path.display(), result.errors.len());
    }
    println!("{} is valid", path.display());
    Ok(())
}
