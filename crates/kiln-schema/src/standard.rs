use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid language standard '{0}', expected e.g. 14, 17, gnu20")]
pub struct StandardError(pub String);

/// A C++ language standard selection such as `14`, `gnu17` or `20`.
///
/// Levels are ordered chronologically (`98 < 03 < 11 < ... < 23`). The GNU
/// dialect flag never affects whether a minimum is met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LanguageStandard {
    year: u16,
    gnu: bool,
}

impl LanguageStandard {
    pub fn new(year: u16, gnu: bool) -> Self {
        Self { year, gnu }
    }

    pub fn parse(input: &str) -> Result<Self, StandardError> {
        let raw = input.trim();
        let lower = raw.to_ascii_lowercase();
        let (gnu, digits) = match lower.strip_prefix("gnu") {
            Some(rest) => (true, rest),
            None => (false, lower.strip_prefix("c++").unwrap_or(lower.as_str())),
        };

        if digits.len() != 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StandardError(raw.to_owned()));
        }
        let short: u16 = digits.parse().map_err(|_| StandardError(raw.to_owned()))?;
        let year = if short >= 90 { 1900 + short } else { 2000 + short };
        Ok(Self { year, gnu })
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn is_gnu(&self) -> bool {
        self.gnu
    }

    /// True when this selection is at least `minimum`, ignoring dialect.
    pub fn meets(&self, minimum: &LanguageStandard) -> bool {
        self.year >= minimum.year
    }
}

impl fmt::Display for LanguageStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.gnu {
            f.write_str("gnu")?;
        }
        write!(f, "{:02}", self.year % 100)
    }
}

impl FromStr for LanguageStandard {
    type Err = StandardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for LanguageStandard {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LanguageStandard {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u16),
            Str(String),
        }
        let text = match Raw::deserialize(deserializer)? {
            Raw::Int(n) => format!("{n:02}"),
            Raw::Str(s) => s,
        };
        LanguageStandard::parse(&text).map_err(serde::de::Error::custom)
    }
}
