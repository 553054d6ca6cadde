use crate::environment::Environment;
use crate::options::OptionValue;
use crate::recipe::Recipe;
use crate::types::{Fingerprint, ShortId};
use crate::version::Version;
use serde::Serialize;
use std::collections::BTreeMap;

/// Cache identity for one build of one recipe.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BuildIdentity {
    pub fingerprint: Fingerprint,
    pub short_id: ShortId,
}

/// Compute the build fingerprint.
///
/// Inputs: the recipe identity and content, the resolved versions of its
/// runtime dependencies, the environment settings and the effective option
/// values. Header-only recipes produce the same output for every compiler,
/// architecture and build type, so those inputs (and options) are left out.
pub fn compute_fingerprint(
    recipe: &Recipe,
    dependencies: &BTreeMap<String, Version>,
    env: &Environment,
    options: &BTreeMap<String, OptionValue>,
) -> Result<BuildIdentity, serde_json::Error> {
    let mut hasher = blake3::Hasher::new();

    field(&mut hasher, &format!("recipe:{}@{}", recipe.name(), recipe.version()));
    let content_digest = blake3::hash(recipe.canonical_json()?.as_bytes())
        .to_hex()
        .to_string();
    field(&mut hasher, &format!("content:{content_digest}"));

    // BTreeMap iteration is sorted by name.
    for (name, version) in dependencies {
        field(&mut hasher, &format!("dep:{name}@{version}"));
    }

    field(&mut hasher, &format!("os:{}", env.platform));
    if recipe.header_only() {
        field(&mut hasher, "mode:header-only");
    } else {
        field(&mut hasher, &format!("arch:{}", env.arch));
        field(&mut hasher, &format!("build_type:{}", env.build_type));
        field(
            &mut hasher,
            &format!("compiler:{}@{}", env.compiler.name, env.compiler.version),
        );
        if let Some(cppstd) = env.compiler.cppstd {
            field(&mut hasher, &format!("cppstd:{cppstd}"));
        }
        if let Some(libcxx) = &env.compiler.libcxx {
            field(&mut hasher, &format!("libcxx:{libcxx}"));
        }
        for (name, value) in options {
            field(&mut hasher, &format!("opt:{name}={value}"));
        }
    }

    let hex = hasher.finalize().to_hex().to_string();
    let short = hex[..12].to_owned();

    Ok(BuildIdentity {
        fingerprint: Fingerprint::new(hex),
        short_id: ShortId::new(short),
    })
}

/// Hash one length-prefixed field.
fn field(hasher: &mut blake3::Hasher, text: &str) {
    hasher.update(&(text.len() as u64).to_le_bytes());
    hasher.update(text.as_bytes());
}
