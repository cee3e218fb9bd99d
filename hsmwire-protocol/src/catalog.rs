//! Command catalog and the compiled command table.
//!
//! The catalog is declarative (YAML or JSON):
//!
//! ```yaml
//! commands:
//!   generate_key:
//!     request_code: A0
//!     request_layout: "mode:8/string, key_type:24/string, key_scheme:8/string"
//!     response_code: A1
//!     response_layout: "key:264/string, check_value:48/string"
//!     warnings: ["02"]
//! errors:
//!   "15": { name: INVALID_INPUT, message: "Error in input data" }
//!   "generate_key.10": { name: KEY_PARITY, message: "Key parity error" }
//! ```
//!
//! Response and error layouts describe the body that follows the two
//! character status code.

use crate::error::{ErrorCatalog, ErrorDescriptor, LayoutError, ProtocolError};
use crate::layout::{Layout, LayoutSource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Status code meaning plain success.
pub const SUCCESS_CODE: &str = "00";

/// Direction of a message relative to the HSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One catalog entry, as declared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandEntry {
    pub request_code: Option<String>,
    pub request_layout: Option<LayoutSource>,
    pub warnings: Vec<String>,
    pub response_code: Option<String>,
    pub response_layout: Option<LayoutSource>,
    pub error_layout: Option<LayoutSource>,
}

/// The declarative catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub commands: BTreeMap<String, CommandEntry>,
    pub errors: HashMap<String, ErrorDescriptor>,
}

impl Catalog {
    pub fn from_yaml_str(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Loads a catalog file; `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }
}

/// A compiled command in one direction.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub direction: Direction,
    pub code: String,
    pub layout: Layout,
    /// Status codes treated as success besides `"00"` (responses only).
    pub warnings: BTreeSet<String>,
    pub error_layout: Option<Layout>,
}

impl CommandSpec {
    /// `name:direction` key used for lookups.
    pub fn key(&self) -> String {
        command_key(&self.name, self.direction)
    }

    /// Whether a status code classifies the response as successful.
    pub fn is_success(&self, status: &str) -> bool {
        status == SUCCESS_CODE || self.warnings.contains(status)
    }
}

/// Builds the `name:direction` lookup key.
pub fn command_key(name: &str, direction: Direction) -> String {
    format!("{}:{}", name, direction)
}

/// Compiled commands indexed by name/direction and by code.
#[derive(Debug, Default)]
pub struct CommandTable {
    commands: HashMap<String, Arc<CommandSpec>>,
    by_code: HashMap<String, String>,
    errors: ErrorCatalog,
}

impl CommandTable {
    /// Compiles every layout in the catalog.
    ///
    /// Fails on the first layout that does not compile; no table is produced.
    pub fn build(catalog: &Catalog) -> Result<Self, ProtocolError> {
        let mut table = Self {
            errors: ErrorCatalog::new(catalog.errors.clone()),
            ..Self::default()
        };

        for (name, entry) in &catalog.commands {
            if let Some(source) = &entry.request_layout {
                let code = required_code(name, Direction::Request, entry.request_code.as_deref())?;
                let spec = CommandSpec {
                    name: name.clone(),
                    direction: Direction::Request,
                    code,
                    layout: compile(name, Direction::Request, source)?,
                    warnings: BTreeSet::new(),
                    error_layout: None,
                };
                table.register(spec)?;
            }

            if let Some(source) = &entry.response_layout {
                let code =
                    required_code(name, Direction::Response, entry.response_code.as_deref())?;
                let error_layout = entry
                    .error_layout
                    .as_ref()
                    .map(|s| compile(name, Direction::Response, s))
                    .transpose()?;
                for warning in &entry.warnings {
                    validate_code(name, warning)?;
                }
                let spec = CommandSpec {
                    name: name.clone(),
                    direction: Direction::Response,
                    code,
                    layout: compile(name, Direction::Response, source)?,
                    warnings: entry.warnings.iter().cloned().collect(),
                    error_layout,
                };
                table.register(spec)?;
            }
        }

        tracing::debug!(
            "Command table built: {} commands, {} error entries",
            table.commands.len(),
            table.errors.len()
        );
        Ok(table)
    }

    /// Loads and compiles a catalog file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        Self::build(&Catalog::from_file(path)?)
    }

    fn register(&mut self, spec: CommandSpec) -> Result<(), ProtocolError> {
        let key = spec.key();
        if let Some(existing) = self.by_code.get(&spec.code) {
            return Err(ProtocolError::Configuration {
                command: key,
                reason: format!("code {} already used by {}", spec.code, existing),
            });
        }
        self.by_code.insert(spec.code.clone(), key.clone());
        self.commands.insert(key, Arc::new(spec));
        Ok(())
    }

    pub fn lookup_by_name(&self, method: &str, direction: Direction) -> Option<Arc<CommandSpec>> {
        self.commands.get(&command_key(method, direction)).cloned()
    }

    pub fn lookup_by_code(&self, code: &str) -> Option<Arc<CommandSpec>> {
        self.by_code
            .get(code)
            .and_then(|key| self.commands.get(key))
            .cloned()
    }

    pub fn errors(&self) -> &ErrorCatalog {
        &self.errors
    }

    /// Number of compiled command directions.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Names of all commands with at least one direction.
    pub fn command_names(&self) -> BTreeSet<&str> {
        self.commands.values().map(|s| s.name.as_str()).collect()
    }
}

fn compile(name: &str, direction: Direction, source: &LayoutSource) -> Result<Layout, ProtocolError> {
    Layout::compile(source).map_err(|e| configuration(name, direction, e))
}

fn configuration(name: &str, direction: Direction, err: LayoutError) -> ProtocolError {
    ProtocolError::Configuration {
        command: command_key(name, direction),
        reason: err.to_string(),
    }
}

fn required_code(
    name: &str,
    direction: Direction,
    code: Option<&str>,
) -> Result<String, ProtocolError> {
    let code = code.ok_or_else(|| ProtocolError::Configuration {
        command: command_key(name, direction),
        reason: format!("{} layout declared without a {} code", direction, direction),
    })?;
    validate_code(name, code)?;
    Ok(code.to_string())
}

fn validate_code(name: &str, code: &str) -> Result<(), ProtocolError> {
    if code.len() == 2 && code.is_ascii() {
        Ok(())
    } else {
        Err(ProtocolError::Configuration {
            command: name.to_string(),
            reason: format!("code {:?} is not two ASCII characters", code),
        })
    }
}
