//! Compose file parser.
//!
//! Parses compose files, interpolates variables and validates them.

use super::interpolate::Variables;
use super::types::*;
use crate::error::{Result, StackError};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, instrument};

/// Parser for compose files.
pub struct ComposeParser;

impl ComposeParser {
    /// Parse a compose file from a string, without variable interpolation.
    pub fn parse(content: &str) -> Result<ComposeFile> {
        Self::parse_with(content, Path::new("compose.yaml"), None)
    }

    /// Parse a compose file from a string.
    ///
    /// `path` is only used in error messages. When `vars` is given, every
    /// string value is interpolated before the file is interpreted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidManifest` if:
    /// - The YAML is invalid
    /// - A required variable is missing
    /// - The compose version is unsupported
    /// - Services are missing or invalid
    #[instrument(skip(content, vars), fields(path = %path.display()))]
    pub fn parse_with(content: &str, path: &Path, vars: Option<&Variables>) -> Result<ComposeFile> {
        info!("Parsing compose file");

        let invalid = |reason: String| StackError::InvalidManifest { path: path.to_path_buf(), reason };

        let mut raw: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|e| invalid(e.to_string()))?;
        if let Some(vars) = vars {
            vars.interpolate_value(&mut raw).map_err(invalid)?;
        }
        let compose: ComposeFile = serde_yaml::from_value(raw).map_err(|e| invalid(e.to_string()))?;

        Self::validate_version(&compose.version).map_err(invalid)?;
        Self::validate_services(&compose.services).map_err(invalid)?;

        Ok(compose)
    }

    /// Parse a compose file from disk, interpolating with `vars`.
    #[instrument(skip(vars))]
    pub fn parse_file(path: &Path, vars: &Variables) -> Result<ComposeFile> {
        info!("Reading compose file from {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| StackError::io(path, e))?;

        Self::parse_with(&content, path, Some(vars))
    }

    /// Validate that the compose version is supported.
    ///
    /// The field is obsolete; empty, 2.x and 3.x are accepted.
    fn validate_version(version: &str) -> std::result::Result<(), String> {
        if version.is_empty() || version.starts_with('2') || version.starts_with('3') {
            Ok(())
        } else {
            Err(format!("unsupported compose version '{}'", version))
        }
    }

    /// Validate that services are properly defined.
    fn validate_services(services: &BTreeMap<String, ComposeService>) -> std::result::Result<(), String> {
        if services.is_empty() {
            return Err("No services defined".to_string());
        }

        for (name, service) in services {
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(format!("invalid service name '{}'", name));
            }
            if service.image.is_empty() {
                return Err(format!("Service '{}' missing image", name));
            }
        }

        Ok(())
    }
}
