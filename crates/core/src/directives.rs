//! Structured directives embedded in a hook's stdout.
//!
//! Each stdout line is parsed independently as one JSON object. Lines that
//! are not JSON objects are ordinary output and are ignored. Recognised
//! objects carry a `type` field selecting one of the [`Directive`] shapes and
//! an optional `schema` field giving the protocol version (default `1`).
//!
//! | `type`          | Fields                                   | Effect                                   |
//! |-----------------|------------------------------------------|------------------------------------------|
//! | `ArchiveResult` | `status`, `output_str`                   | overrides the computed status/summary    |
//! | `Binary`        | `name`, `abspath`                        | sets config `<NAME>_BINARY = abspath`    |
//! | `Machine`       | `_method: "update"`, `key: "config/K"`, `value` | sets config `K = value`           |
//!
//! Any other `type` is ignored, as is any record declaring a `schema`
//! newer than [`DIRECTIVE_SCHEMA_VERSION`].

use serde::Deserialize;
use serde_json::Value;

use crate::records::ArchiveStatus;

/// Highest directive protocol version this engine understands.
pub const DIRECTIVE_SCHEMA_VERSION: u64 = 1;

/// Prefix stripped from `Machine` update keys.
pub const MACHINE_CONFIG_PREFIX: &str = "config/";

/// Method name of a `Machine` configuration update.
pub const MACHINE_UPDATE_METHOD: &str = "update";

/// One structured record emitted by a hook on stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum Directive {
    ArchiveResult {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        output_str: Option<String>,
    },
    Binary {
        #[serde(default)]
        name: String,
        #[serde(default)]
        abspath: String,
    },
    Machine {
        #[serde(rename = "_method", default)]
        method: String,
        #[serde(default)]
        key: String,
        #[serde(default)]
        value: Value,
    },
    #[serde(other)]
    Unknown,
}

impl Directive {
    /// The shared-configuration entry this directive contributes, if any.
    ///
    /// Entries with an empty key, or a null or empty-string value, are not
    /// contributions.
    pub fn config_update(&self) -> Option<(String, Value)> {
        match self {
            Self::Binary { name, abspath } if !name.is_empty() && !abspath.is_empty() => Some((
                format!("{}_BINARY", name.to_uppercase()),
                Value::String(abspath.clone()),
            )),
            Self::Machine { method, key, value } if method == MACHINE_UPDATE_METHOD => {
                let key = key.strip_prefix(MACHINE_CONFIG_PREFIX).unwrap_or(key);
                let empty = matches!(value, Value::Null) || value.as_str() == Some("");
                if key.is_empty() || empty {
                    None
                } else {
                    Some((key.to_string(), value.clone()))
                }
            }
            _ => None,
        }
    }
}

/// Parse a single stdout line. Returns `None` for ordinary output.
pub fn parse_line(line: &str) -> Option<Directive> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }

    let value: Value = serde_json::from_str(line).ok()?;
    let schema = value.get("schema").and_then(Value::as_u64).unwrap_or(1);
    if schema > DIRECTIVE_SCHEMA_VERSION {
        tracing::warn!(
            schema,
            supported = DIRECTIVE_SCHEMA_VERSION,
            "Ignoring directive with unsupported schema version"
        );
        return None;
    }

    match serde_json::from_value::<Directive>(value) {
        Ok(directive) => Some(directive),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring malformed directive line");
            None
        }
    }
}

/// Parse every directive out of a hook's captured stdout, in order.
pub fn parse_stdout(stdout: &str) -> impl Iterator<Item = Directive> + '_ {
    stdout.lines().filter_map(parse_line)
}

/// The status and summary a hook declared about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeclaredResult {
    /// Declared terminal status, if a valid one was given.
    pub status: Option<ArchiveStatus>,
    pub output_str: Option<String>,
}

/// Fold all `ArchiveResult` directives in `stdout`; later lines win.
///
/// Returns `None` when the hook emitted no `ArchiveResult` directive at all.
pub fn declared_result(stdout: &str) -> Option<DeclaredResult> {
    let mut declared: Option<DeclaredResult> = None;
    for directive in parse_stdout(stdout) {
        if let Directive::ArchiveResult { status, output_str } = directive {
            let entry = declared.get_or_insert_with(DeclaredResult::default);
            match status.as_deref().map(|s| (s, ArchiveStatus::parse(s))) {
                Some((_, Some(parsed))) if parsed.is_terminal() => entry.status = Some(parsed),
                Some((raw, _)) => {
                    tracing::debug!(status = raw, "Ignoring non-terminal or unknown declared status");
                }
                None => {}
            }
            if let Some(output_str) = output_str {
                entry.output_str = Some(output_str);
            }
        }
    }
    declared
}

/// Collect every configuration contribution in `stdout`, in order.
pub fn config_updates(stdout: &str) -> Vec<(String, Value)> {
    parse_stdout(stdout)
        .filter_map(|d| d.config_update())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
