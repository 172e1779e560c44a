//! CLI command implementations.
//!
//! This module contains the implementation of each CLI command.

pub mod discover;
pub mod locate;
pub mod offset;
pub mod plan;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use locator_core::{CaptureFile, DiscoveryPlan, LocatorConfig, PointerWidth, builtin_plan, load_plan};
use tracing::info;

/// Load the locator configuration, or defaults when no file is given
pub fn load_config(path: Option<&Path>) -> Result<LocatorConfig> {
    let Some(path) = path else {
        return Ok(LocatorConfig::default());
    };

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: LocatorConfig =
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?;
    info!("Loaded config from {:?}", path);
    Ok(config)
}

/// The plan file if given, otherwise the built-in plan for `width`
pub fn resolve_plan(path: Option<&Path>, width: PointerWidth) -> Result<DiscoveryPlan> {
    match path {
        Some(path) => {
            load_plan(path).with_context(|| format!("Failed to load plan {}", path.display()))
        }
        None => Ok(builtin_plan(width)),
    }
}

pub fn load_capture(path: &Path) -> Result<CaptureFile> {
    CaptureFile::load(path).with_context(|| format!("Failed to load capture {}", path.display()))
}
