//! Export description loading

use std::path::Path;

use anyhow::{Context, Result};
use protocol::types::ExportDesc;

/// Load and validate an export description TOML file.
pub fn load_export_desc(path: &Path) -> Result<ExportDesc> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read export description: {}", path.display()))?;
    let desc: ExportDesc = toml::from_str(&content)
        .with_context(|| format!("failed to parse export description: {}", path.display()))?;
    desc.validate()
        .with_context(|| format!("invalid export description: {}", path.display()))?;
    Ok(desc)
}
