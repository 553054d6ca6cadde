//! Package versions and version constraints.
//!
//! Versions are dotted component lists (`1.10.0`, `16`, `2.0.rc1`). A
//! constraint is an interval over versions, which keeps intersection and the
//! emptiness test exact.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("version must not be empty")]
    Empty,
    #[error("invalid version '{0}'")]
    InvalidVersion(String),
    #[error("invalid version constraint '{input}': {reason}")]
    InvalidConstraint { input: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Component {
    Number(u64),
    Text(String),
}

impl Component {
    fn cmp_component(&self, other: &Component) -> Ordering {
        match (self, other) {
            (Component::Number(a), Component::Number(b)) => a.cmp(b),
            (Component::Text(a), Component::Text(b)) => a.cmp(b),
            (Component::Text(_), Component::Number(_)) => Ordering::Less,
            (Component::Number(_), Component::Text(_)) => Ordering::Greater,
        }
    }
}

const ZERO: Component = Component::Number(0);

/// A parsed package or compiler version.
///
/// Missing trailing components compare as zero, so `7` and `7.0` are equal.
/// The original spelling is kept for display.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    components: Vec<Component>,
}

impl Version {
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(VersionError::Empty);
        }

        let mut components = Vec::new();
        for piece in raw.split('.') {
            if piece.is_empty()
                || !piece
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'+'))
            {
                return Err(VersionError::InvalidVersion(raw.to_owned()));
            }
            if piece.bytes().all(|b| b.is_ascii_digit()) {
                let n = piece
                    .parse::<u64>()
                    .map_err(|_| VersionError::InvalidVersion(raw.to_owned()))?;
                components.push(Component::Number(n));
            } else {
                components.push(Component::Text(piece.to_owned()));
            }
        }

        Ok(Self {
            raw: raw.to_owned(),
            components,
        })
    }

    fn from_numbers(numbers: &[u64]) -> Self {
        let raw = numbers
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Self {
            raw,
            components: numbers.iter().copied().map(Component::Number).collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Leading numeric components, stopping at the first text component.
    fn numeric_prefix(&self) -> Vec<u64> {
        self.components
            .iter()
            .map_while(|c| match c {
                Component::Number(n) => Some(*n),
                Component::Text(_) => None,
            })
            .collect()
    }

    fn significant(&self) -> &[Component] {
        let mut end = self.components.len();
        while end > 0 && self.components[end - 1] == ZERO {
            end -= 1;
        }
        &self.components[..end]
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).unwrap_or(&ZERO);
            let b = other.components.get(i).unwrap_or(&ZERO);
            match a.cmp_component(b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = ScalarText::deserialize(deserializer)?.into_string();
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Recipes often write compiler versions as bare integers (`gcc = 7`).
#[derive(Deserialize)]
#[serde(untagged)]
enum ScalarText {
    Int(u64),
    Float(f64),
    Str(String),
}

impl ScalarText {
    fn into_string(self) -> String {
        match self {
            ScalarText::Int(n) => n.to_string(),
            ScalarText::Float(f) => f.to_string(),
            ScalarText::Str(s) => s,
        }
    }
}

/// An interval of acceptable versions.
///
/// Parsed from comparator lists such as `>=1.2,<2.0`, `>1 <=3`, `=1.5`,
/// `~1.2`, `^1.2`, a bare version (exact match), `*`, or the bracketed form
/// `[>=1.2 <2.0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    lower: Bound<Version>,
    upper: Bound<Version>,
}

impl VersionConstraint {
    pub fn any() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn exact(version: Version) -> Self {
        Self {
            lower: Bound::Included(version.clone()),
            upper: Bound::Included(version),
        }
    }

    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let mut text = input.trim();
        if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            text = inner.trim();
        }

        let mut constraint = Self::any();
        if text.is_empty() || text == "*" {
            return Ok(constraint);
        }

        let invalid = |reason: &str| VersionError::InvalidConstraint {
            input: input.trim().to_owned(),
            reason: reason.to_owned(),
        };

        let mut pending_op: Option<&str> = None;
        for token in text
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            let (op, rest) = split_operator(token);
            let (op, version_text) = match (pending_op.take(), op, rest.is_empty()) {
                (Some(_), Some(_), _) => return Err(invalid("two operators in a row")),
                (Some(prev), None, _) => (prev, rest),
                (None, Some(op), true) => {
                    pending_op = Some(op);
                    continue;
                }
                (None, op, _) => (op.unwrap_or("="), rest),
            };
            let version = Version::parse(version_text)
                .map_err(|_| invalid(&format!("bad version '{version_text}'")))?;
            let term = Self::from_comparator(op, version).map_err(|reason| invalid(&reason))?;
            constraint = constraint.intersect(&term);
        }

        if pending_op.is_some() {
            return Err(invalid("operator without a version"));
        }
        Ok(constraint)
    }

    fn from_comparator(op: &str, version: Version) -> Result<Self, String> {
        let (lower, upper) = match op {
            ">=" => (Bound::Included(version), Bound::Unbounded),
            ">" => (Bound::Excluded(version), Bound::Unbounded),
            "<=" => (Bound::Unbounded, Bound::Included(version)),
            "<" => (Bound::Unbounded, Bound::Excluded(version)),
            "=" | "==" => return Ok(Self::exact(version)),
            "~" => {
                let next = bump_tilde(&version)?;
                (Bound::Included(version), Bound::Excluded(next))
            }
            "^" => {
                let next = bump_caret(&version)?;
                (Bound::Included(version), Bound::Excluded(next))
            }
            other => return Err(format!("unknown operator '{other}'")),
        };
        Ok(Self { lower, upper })
    }

    pub fn satisfies(&self, version: &Version) -> bool {
        let above = match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(l) => version >= l,
            Bound::Excluded(l) => version > l,
        };
        let below = match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(u) => version <= u,
            Bound::Excluded(u) => version < u,
        };
        above && below
    }

    /// The set of versions accepted by both constraints.
    pub fn intersect(&self, other: &Self) -> Self {
        Self {
            lower: tighter_lower(&self.lower, &other.lower),
            upper: tighter_upper(&self.upper, &other.upper),
        }
    }

    /// True when no version can satisfy the constraint.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l) | Bound::Excluded(l), Bound::Included(u) | Bound::Excluded(u)) => {
                l >= u
            }
            _ => false,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(
            (&self.lower, &self.upper),
            (Bound::Unbounded, Bound::Unbounded)
        )
    }

    /// Highest version in `candidates` that satisfies this constraint.
    pub fn best_match<'a, I>(&self, candidates: I) -> Option<&'a Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        candidates.into_iter().filter(|v| self.satisfies(v)).max()
    }
}

fn split_operator(token: &str) -> (Option<&str>, &str) {
    for op in [">=", "<=", "==", ">", "<", "=", "~", "^"] {
        if let Some(rest) = token.strip_prefix(op) {
            return (Some(op), rest);
        }
    }
    (None, token)
}

fn bump_tilde(version: &Version) -> Result<Version, String> {
    let numbers = version.numeric_prefix();
    match numbers.as_slice() {
        [] => Err(format!("'~{version}' needs a numeric version")),
        [major] => Ok(Version::from_numbers(&[bump(*major, version)?])),
        [major, minor, ..] => Ok(Version::from_numbers(&[*major, bump(*minor, version)?])),
    }
}

fn bump_caret(version: &Version) -> Result<Version, String> {
    let numbers = version.numeric_prefix();
    if numbers.is_empty() {
        return Err(format!("'^{version}' needs a numeric version"));
    }
    let pivot = numbers
        .iter()
        .position(|n| *n != 0)
        .unwrap_or(numbers.len() - 1);
    let mut next = numbers[..=pivot].to_vec();
    next[pivot] = bump(next[pivot], version)?;
    Ok(Version::from_numbers(&next))
}

fn bump(component: u64, version: &Version) -> Result<u64, String> {
    component
        .checked_add(1)
        .ok_or_else(|| format!("version component of '{version}' is too large to bump"))
}

fn tighter_lower(a: &Bound<Version>, b: &Bound<Version>) -> Bound<Version> {
    match (a, b) {
        (Bound::Unbounded, other) | (other, Bound::Unbounded) => other.clone(),
        (Bound::Included(x), Bound::Included(y)) => Bound::Included(x.max(y).clone()),
        (Bound::Excluded(x), Bound::Excluded(y)) => Bound::Excluded(x.max(y).clone()),
        (Bound::Included(inc), Bound::Excluded(exc))
        | (Bound::Excluded(exc), Bound::Included(inc)) => {
            if inc > exc {
                Bound::Included(inc.clone())
            } else {
                Bound::Excluded(exc.clone())
            }
        }
    }
}

fn tighter_upper(a: &Bound<Version>, b: &Bound<Version>) -> Bound<Version> {
    match (a, b) {
        (Bound::Unbounded, other) | (other, Bound::Unbounded) => other.clone(),
        (Bound::Included(x), Bound::Included(y)) => Bound::Included(x.min(y).clone()),
        (Bound::Excluded(x), Bound::Excluded(y)) => Bound::Excluded(x.min(y).clone()),
        (Bound::Included(inc), Bound::Excluded(exc))
        | (Bound::Excluded(exc), Bound::Included(inc)) => {
            if inc < exc {
                Bound::Included(inc.clone())
            } else {
                Bound::Excluded(exc.clone())
            }
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (Bound::Included(l), Bound::Included(u)) = (&self.lower, &self.upper) {
            if l == u {
                return write!(f, "={l}");
            }
        }

        let mut parts = Vec::with_capacity(2);
        match &self.lower {
            Bound::Included(l) => parts.push(format!(">={l}")),
            Bound::Excluded(l) => parts.push(format!(">{l}")),
            Bound::Unbounded => {}
        }
        match &self.upper {
            Bound::Included(u) => parts.push(format!("<={u}")),
            Bound::Excluded(u) => parts.push(format!("<{u}")),
            Bound::Unbounded => {}
        }

        if parts.is_empty() {
            f.write_str("*")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        VersionConstraint::parse(&raw).map_err(serde::de::Error::custom)
    }
}
