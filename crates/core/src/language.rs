//! Hook source languages and the interpreters that run them.
//!
//! The set of supported languages is closed: a hook whose tag does not map
//! to a [`Language`] is rejected with [`CoreError::UnsupportedLanguage`]
//! before any process is spawned.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Interpreter used for Python hooks.
pub const PYTHON_INTERPRETER: &str = "python3";

/// Interpreter used for JavaScript hooks.
pub const NODE_INTERPRETER: &str = "node";

/// Interpreter used for shell hooks.
pub const SHELL_INTERPRETER: &str = "bash";

/// A hook source language, identified by its file-extension tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    JavaScript,
    Shell,
}

impl Language {
    /// Return the wire-format tag for this variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::JavaScript => "js",
            Self::Shell => "sh",
        }
    }

    /// Parse a language tag as it appears on a hook descriptor.
    pub fn from_tag(tag: &str) -> Result<Self, CoreError> {
        match tag {
            "py" => Ok(Self::Python),
            "js" => Ok(Self::JavaScript),
            "sh" => Ok(Self::Shell),
            other => Err(CoreError::UnsupportedLanguage(other.to_string())),
        }
    }

    /// The interpreter command prefix for this language.
    pub fn interpreter(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &[PYTHON_INTERPRETER],
            Self::JavaScript => &[NODE_INTERPRETER],
            Self::Shell => &[SHELL_INTERPRETER],
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
