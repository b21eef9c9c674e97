//! Names of the temporary indexes created while rebuilding.
//!
//! Shadow-swap artifacts carry a prefix (`tmp_reindex_`, `old_reindex_`). Native
//! concurrent rebuilds leave postgres-chosen names: the target name truncated so that
//! `_ccnew`/`_ccold` plus an optional counter still fits the identifier limit.

/// Postgres identifiers are limited to NAMEDATALEN - 1 bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

pub const SHADOW_PREFIX: &str = "tmp_reindex_";
pub const REPLACED_PREFIX: &str = "old_reindex_";
pub const NATIVE_SUFFIXES: [&str; 2] = ["_ccnew", "_ccold"];

pub fn truncate_identifier(name: &str, max_bytes: usize) -> &str {
    if name.len() <= max_bytes {
        return name;
    }
    let mut end = max_bytes;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

pub fn shadow_name(name: &str) -> String {
    prefixed(SHADOW_PREFIX, name)
}

pub fn replaced_name(name: &str) -> String {
    prefixed(REPLACED_PREFIX, name)
}

fn prefixed(prefix: &str, name: &str) -> String {
    format!(
        "{prefix}{}",
        truncate_identifier(name, MAX_IDENTIFIER_BYTES - prefix.len())
    )
}

/// The first name postgres picks for a native rebuild artifact of `name`.
pub fn native_artifact_name(name: &str, suffix: &str) -> String {
    format!(
        "{}{suffix}",
        truncate_identifier(name, MAX_IDENTIFIER_BYTES - suffix.len())
    )
}

pub fn is_shadow_artifact(name: &str) -> bool {
    name.starts_with(SHADOW_PREFIX) || name.starts_with(REPLACED_PREFIX)
}

/// Splits `name` into `(base, tail)` when it ends with a native rebuild suffix followed
/// by an optional counter.
fn split_native_suffix(name: &str) -> Option<(&str, &str)> {
    let digits = name
        .bytes()
        .rev()
        .take_while(u8::is_ascii_digit)
        .count();
    let without_counter = &name[..name.len() - digits];
    NATIVE_SUFFIXES.iter().find_map(|suffix| {
        without_counter
            .strip_suffix(suffix)
            .map(|base| (base, &name[base.len()..]))
    })
}

pub fn is_native_artifact(name: &str) -> bool {
    split_native_suffix(name).is_some_and(|(base, _)| !base.is_empty())
}

/// Whether `candidate` is a native rebuild artifact that postgres derived from `target`.
pub fn is_native_artifact_of(target: &str, candidate: &str) -> bool {
    let Some((base, tail)) = split_native_suffix(candidate) else {
        return false;
    };
    let budget = MAX_IDENTIFIER_BYTES.saturating_sub(tail.len());
    !base.is_empty() && base == truncate_identifier(target, budget)
}

pub fn is_engine_artifact(name: &str) -> bool {
    is_shadow_artifact(name) || is_native_artifact(name)
}
