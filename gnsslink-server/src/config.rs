//! Configuration files.
//!
//! The schema catalog lives in the per-user config directory unless
//! `--schema` names a file.

use directories::ProjectDirs;
use gnsslink_core::error::SchemaError;
use gnsslink_core::schema::SchemaCatalog;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SCHEMA_FILE: &str = "schema.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid schema catalog {path}: {source}")]
    Schema { path: PathBuf, source: SchemaError },
}

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "gnsslink", "gnsslink")
}

/// `<config_dir>/schema.json`
pub fn default_schema_path() -> Option<PathBuf> {
    get_project_dirs().map(|dirs| dirs.config_dir().join(SCHEMA_FILE))
}

/// Load the schema catalog.
///
/// A missing file yields an empty catalog: binary frames are then framed
/// but not decoded, and text sources are routed with positional field names.
pub fn load_schema(path: Option<&Path>) -> Result<SchemaCatalog, ConfigError> {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_schema_path) else {
        warn!("No config directory; using an empty schema catalog");
        return Ok(SchemaCatalog::empty());
    };

    if !path.exists() {
        warn!(
            "Schema catalog {} not found; using an empty catalog",
            path.display()
        );
        return Ok(SchemaCatalog::empty());
    }

    let json = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let catalog =
        SchemaCatalog::from_json(&json).map_err(|source| ConfigError::Schema { path: path.clone(), source })?;
    info!(
        "Loaded schema catalog {} ({} messages, {} capability mappings)",
        path.display(),
        catalog.message_count(),
        catalog.mapping_count()
    );
    Ok(catalog)
}
