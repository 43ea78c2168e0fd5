//! Compose file parsing and conversion.
//!
//! This module loads compose files (Compose specification, v2/v3 era keys plus
//! `x-incus-*` extensions) and converts them into the [`Stack`] model.

pub mod converter;
pub mod extensions;
pub mod interpolate;
pub mod parser;
pub mod types;

#[cfg(test)]
mod parser_tests;

pub use converter::{ComposeConverter, LoadOptions};
pub use extensions::Extension;
pub use interpolate::{parse_env_content, Variables};
pub use parser::ComposeParser;
pub use types::*;

use crate::error::{Result, StackError};
use crate::paths;
use crate::types::Stack;
use std::path::Path;
use tracing::instrument;

/// Environment variable naming the stack when `--project-name` is absent.
pub const PROJECT_NAME_ENV: &str = "COMPOSE_PROJECT_NAME";

/// Load the stack declared in `working_dir`.
///
/// Uses `options.file` when given, otherwise the first compose file found in
/// the directory. Variables come from the process environment and `.env`.
#[instrument(skip(options), fields(dir = %working_dir.display()))]
pub fn load(working_dir: &Path, options: &LoadOptions) -> Result<Stack> {
    let working_dir = working_dir.canonicalize().map_err(|e| StackError::io(working_dir, e))?;
    let manifest = match &options.file {
        Some(file) => working_dir.join(file),
        None => paths::find_compose_file(&working_dir)
            .ok_or_else(|| StackError::ManifestNotFound { dir: working_dir.clone() })?,
    };
    let manifest_dir = manifest.parent().unwrap_or(&working_dir);

    let vars = Variables::load(manifest_dir).map_err(|e| StackError::io(manifest_dir.join(".env"), e))?;
    let compose = ComposeParser::parse_file(&manifest, &vars)?;

    let mut options = options.clone();
    if options.project_name.is_none() {
        options.project_name = vars.get(PROJECT_NAME_ENV).map(str::to_string);
    }
    ComposeConverter::convert(compose, &manifest, &options)
}
