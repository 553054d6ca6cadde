//! String newtypes for hashes and identifiers that flow between crates.
//!
//! Each newtype serializes as a plain string.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

hash_newtype!(
    /// Full 64-character hex build fingerprint. Keys the artifact cache.
    Fingerprint
);

hash_newtype!(
    /// 12-character prefix of a [`Fingerprint`], used for display.
    ShortId
);

hash_newtype!(
    /// Blake3 hash of an object in the content-addressable store.
    ObjectHash
);

impl Fingerprint {
    pub fn short(&self) -> ShortId {
        ShortId::new(&self.0[..12.min(self.0.len())])
    }
}
