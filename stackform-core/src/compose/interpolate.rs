//! Variable interpolation and `.env` handling.
//!
//! Supports `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
//! `${VAR:?message}`, `${VAR?message}` and `$$` for a literal dollar sign.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// `$$`, `${NAME}`, `${NAME<op><arg>}` or `$NAME`.
static PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\$(?:(?P<escaped>\$)|\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)(?:(?P<op>:?[-?])(?P<arg>[^}]*))?\}|(?P<named>[A-Za-z_][A-Za-z0-9_]*))",
    )
    .expect("Invalid interpolation regex")
});

/// Variables available to interpolation: the process environment layered over
/// a `.env` file.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    /// Process environment plus `{dir}/.env`. Process values win.
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let mut values = BTreeMap::new();
        let dotenv = dir.join(".env");
        if dotenv.is_file() {
            debug!(path = %dotenv.display(), "Reading .env");
            values.extend(parse_env_content(&std::fs::read_to_string(&dotenv)?));
        }
        values.extend(std::env::vars());
        Ok(Self { values })
    }

    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Interpolate one string.
    ///
    /// Fails with the message of a `:?`/`?` reference whose variable is missing.
    pub fn interpolate(&self, input: &str) -> Result<String, String> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in PATTERN.captures_iter(input) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&input[last..whole.start()]);
            out.push_str(&self.substitute(&caps)?);
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    fn substitute(&self, caps: &Captures<'_>) -> Result<String, String> {
        if caps.name("escaped").is_some() {
            return Ok("$".to_string());
        }
        if let Some(name) = caps.name("named") {
            return Ok(self.lookup_or_empty(name.as_str()));
        }

        let name = caps.name("braced").map(|m| m.as_str()).unwrap_or_default();
        let value = self.get(name);
        let arg = caps.name("arg").map(|m| m.as_str()).unwrap_or_default();
        match caps.name("op").map(|m| m.as_str()) {
            None => Ok(self.lookup_or_empty(name)),
            Some(":-") => Ok(value.filter(|v| !v.is_empty()).unwrap_or(arg).to_string()),
            Some("-") => Ok(value.unwrap_or(arg).to_string()),
            Some(":?") => value
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| required_message(name, arg)),
            Some(_) => value.map(str::to_string).ok_or_else(|| required_message(name, arg)),
        }
    }

    fn lookup_or_empty(&self, name: &str) -> String {
        match self.get(name) {
            Some(v) => v.to_string(),
            None => {
                warn!(variable = name, "Variable is not set, substituting an empty string");
                String::new()
            }
        }
    }

    /// Interpolate every string scalar of a YAML tree in place. Mapping keys
    /// are left untouched.
    pub fn interpolate_value(&self, value: &mut Value) -> Result<(), String> {
        match value {
            Value::String(s) => {
                *s = self.interpolate(s)?;
            }
            Value::Sequence(seq) => {
                for item in seq {
                    self.interpolate_value(item)?;
                }
            }
            Value::Mapping(map) => {
                for (_, item) in map.iter_mut() {
                    self.interpolate_value(item)?;
                }
            }
            Value::Tagged(tagged) => self.interpolate_value(&mut tagged.value)?,
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
        Ok(())
    }
}

fn required_message(name: &str, message: &str) -> String {
    if message.is_empty() {
        format!("required variable {} is missing a value", name)
    } else {
        format!("required variable {} is missing a value: {}", name, message)
    }
}

/// Parse `KEY=value` lines as found in `.env` and `env_file` files.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is dropped and
/// one level of matching quotes around the value is removed.
pub fn parse_env_content(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = ['"', '\'']
                .iter()
                .find_map(|q| value.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}
