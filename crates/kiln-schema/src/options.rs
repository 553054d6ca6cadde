use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed build option value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl OptionValue {
    /// Interpret command-line text: booleans (any case), then integers, then strings.
    pub fn parse_cli(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            OptionValue::Bool(true)
        } else if trimmed.eq_ignore_ascii_case("false") {
            OptionValue::Bool(false)
        } else if let Ok(n) = trimmed.parse::<i64>() {
            OptionValue::Int(n)
        } else {
            OptionValue::Str(trimmed.to_owned())
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(n) => write!(f, "{n}"),
            OptionValue::Str(s) => f.write_str(s),
        }
    }
}

/// Declared schema for one recipe option: its default and the closed set of
/// values it may take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptionSpec {
    pub default: OptionValue,
    pub allowed: Vec<OptionValue>,
}

impl OptionSpec {
    /// Map a selected value onto the canonical allowed value it denotes.
    ///
    /// Exact typed matches win; otherwise the textual forms are compared so a
    /// profile writing `"True"` can select a boolean option.
    pub fn accept(&self, value: &OptionValue) -> Option<OptionValue> {
        if self.allowed.contains(value) {
            return Some(value.clone());
        }
        let text = value.to_string();
        self.allowed
            .iter()
            .find(|allowed| match allowed {
                OptionValue::Bool(_) => allowed.to_string().eq_ignore_ascii_case(&text),
                _ => allowed.to_string() == text,
            })
            .cloned()
    }
}
