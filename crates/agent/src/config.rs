//! Import description lookup
//!
//! Import descriptions are TOML files found by name: `.not-my-board/`
//! directories from the working directory up to the home directory are
//! searched first, then the user's config directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use protocol::types::ImportSpec;

/// Resolve `name` to a reservation name and its parsed description.
///
/// A name containing a slash is treated as a file path directly.
pub fn find_import_description(name: &str) -> Result<(String, ImportSpec)> {
    let path = if name.contains('/') {
        PathBuf::from(name)
    } else {
        search_import_description(name)?
    };

    let reservation_name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());

    let spec = load_import_description(&path)?;
    Ok((reservation_name, spec))
}

pub fn load_import_description(path: &Path) -> Result<ImportSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read import description: {}", path.display()))?;
    parse_import_description(&content)
        .with_context(|| format!("invalid import description: {}", path.display()))
}

pub fn parse_import_description(content: &str) -> Result<ImportSpec> {
    let spec: ImportSpec =
        toml::from_str(content).context("failed to parse import description")?;
    spec.validate().context("invalid import description")?;
    Ok(spec)
}

fn search_import_description(name: &str) -> Result<PathBuf> {
    let file_name = format!("{name}.toml");

    if let Ok(cwd) = std::env::current_dir() {
        let home = dirs::home_dir();
        let mut dir: Option<&Path> = Some(cwd.as_path());
        while let Some(current) = dir {
            let candidate = current.join(".not-my-board").join(&file_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
            if home.as_deref() == Some(current) {
                break;
            }
            dir = current.parent();
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("not-my-board").join(&file_name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    bail!("no import description file exists for name {name:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_import_description() {
        let spec = parse_import_description(
            r#"
            auto_return_time = "1h"

            [parts.board]
            compatible = ["frob-v2"]

            [parts.board.tcp.console]
            local_port = 4321
            "#,
        )
        .unwrap();
        assert_eq!(spec.parts["board"].tcp["console"].local_port, 4321);
    }

    #[test]
    fn test_parse_rejects_bad_port_num() {
        let result = parse_import_description(
            r#"
            [parts.board]
            compatible = []

            [parts.board.usb.flash]
            port_num = 12
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_find_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab-board.toml");
        std::fs::write(
            &path,
            "[parts.a]\ncompatible = [\"x\"]\n",
        )
        .unwrap();

        let (name, spec) = find_import_description(path.to_str().unwrap()).unwrap();
        assert_eq!(name, "lab-board");
        assert!(spec.parts.contains_key("a"));
    }

    #[test]
    fn test_find_unknown_name_fails() {
        assert!(find_import_description("definitely-not-configured").is_err());
    }
}
