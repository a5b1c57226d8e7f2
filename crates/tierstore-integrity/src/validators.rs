//! Type-specific validators
//!
//! Each validator inspects real tier contents and classifies the
//! finding. Validators never mutate the tier; healing is the repair
//! path's job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tierstore_common::checksum::{compute_crc32c, sha256_hex};
use tierstore_common::{Error, Result, TierId};
use tierstore_registry::TierRegistry;
use xxhash_rust::xxh64::xxh64;

use crate::check::{CheckStatus, IntegrityCheck};

pub(crate) fn run(registry: &TierRegistry, check: &IntegrityCheck) -> Result<(CheckStatus, String)> {
    use crate::check::CheckKind;
    match check.kind {
        CheckKind::Checksum => checksum(registry, check),
        CheckKind::Hash => hash(registry, check),
        CheckKind::Size => size(registry, check),
        CheckKind::Format => format_check(registry, check),
        CheckKind::Schema => schema(registry, check),
        CheckKind::Consistency => consistency(registry, &check.tier),
        CheckKind::Reference => reference(registry, check),
        CheckKind::Duplicate => duplicate(registry, &check.tier),
    }
}

/// Read the check's target, classifying absence as Missing
fn read_target(
    registry: &TierRegistry,
    check: &IntegrityCheck,
) -> Result<std::result::Result<Vec<u8>, (CheckStatus, String)>> {
    let path = target_path(check)?;
    let abs = registry.abs_path(&check.tier, path)?;
    match std::fs::read(&abs) {
        Ok(data) => Ok(Ok(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Err((
            CheckStatus::Missing,
            format!("{} does not exist in tier {}", path.display(), check.tier),
        ))),
        Err(e) => Err(e.into()),
    }
}

fn target_path(check: &IntegrityCheck) -> Result<&Path> {
    check
        .path
        .as_deref()
        .ok_or_else(|| Error::configuration(format!("{} check requires a target path", check.kind)))
}

fn checksum(registry: &TierRegistry, check: &IntegrityCheck) -> Result<(CheckStatus, String)> {
    let expected = check
        .option_str("expected_sha256")
        .ok_or_else(|| Error::configuration("checksum check is missing expected_sha256"))?
        .to_ascii_lowercase();
    let data = match read_target(registry, check)? {
        Ok(data) => data,
        Err(missing) => return Ok(missing),
    };
    let actual = sha256_hex(&data);
    if actual == expected {
        Ok((CheckStatus::Valid, String::new()))
    } else {
        Ok((
            CheckStatus::ChecksumMismatch,
            format!("expected sha256 {expected}, found {actual}"),
        ))
    }
}

fn hash(registry: &TierRegistry, check: &IntegrityCheck) -> Result<(CheckStatus, String)> {
    let algorithm = check
        .option_str("algorithm")
        .ok_or_else(|| Error::configuration("hash check is missing algorithm"))?;
    let expected = check
        .option_str("expected")
        .ok_or_else(|| Error::configuration("hash check is missing expected"))?;
    let data = match read_target(registry, check)? {
        Ok(data) => data,
        Err(missing) => return Ok(missing),
    };
    let actual = match algorithm {
        "crc32c" => compute_crc32c(&data).to_string(),
        "xxhash64" => xxh64(&data, 0).to_string(),
        "sha256" => sha256_hex(&data),
        other => {
            return Err(Error::configuration(format!(
                "unsupported hash algorithm: {other}"
            )))
        }
    };
    if actual.eq_ignore_ascii_case(expected) {
        Ok((CheckStatus::Valid, String::new()))
    } else {
        Ok((
            CheckStatus::ChecksumMismatch,
            format!("expected {algorithm} {expected}, found {actual}"),
        ))
    }
}

fn size(registry: &TierRegistry, check: &IntegrityCheck) -> Result<(CheckStatus, String)> {
    let data = match read_target(registry, check)? {
        Ok(data) => data,
        Err(missing) => return Ok(missing),
    };
    let len = data.len() as u64;
    if let Some(min) = check.option_u64("min_bytes") {
        if len < min {
            return Ok((
                CheckStatus::Invalid,
                format!("size {len} is below the {min} byte minimum"),
            ));
        }
    }
    if let Some(max) = check.option_u64("max_bytes") {
        if len > max {
            return Ok((
                CheckStatus::Invalid,
                format!("size {len} exceeds the {max} byte maximum"),
            ));
        }
    }
    Ok((CheckStatus::Valid, String::new()))
}

/// Content must parse per its extension; unknown extensions pass
fn format_check(registry: &TierRegistry, check: &IntegrityCheck) -> Result<(CheckStatus, String)> {
    let path = target_path(check)?.to_path_buf();
    let data = match read_target(registry, check)? {
        Ok(data) => data,
        Err(missing) => return Ok(missing),
    };
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "json" => match serde_json::from_slice::<serde_json::Value>(&data) {
            Ok(_) => Ok((CheckStatus::Valid, String::new())),
            Err(e) => Ok((CheckStatus::Invalid, format!("not valid json: {e}"))),
        },
        "zst" => match zstd::decode_all(data.as_slice()) {
            Ok(_) => Ok((CheckStatus::Valid, String::new())),
            Err(e) => Ok((CheckStatus::Corrupted, format!("undecodable zstd: {e}"))),
        },
        _ => Ok((CheckStatus::Valid, String::new())),
    }
}

fn schema(registry: &TierRegistry, check: &IntegrityCheck) -> Result<(CheckStatus, String)> {
    let required = check.option_strings("required_fields");
    let data = match read_target(registry, check)? {
        Ok(data) => data,
        Err(missing) => return Ok(missing),
    };
    let doc: serde_json::Value = match serde_json::from_slice(&data) {
        Ok(doc) => doc,
        Err(e) => return Ok((CheckStatus::Corrupted, format!("not valid json: {e}"))),
    };
    let Some(object) = doc.as_object() else {
        return Ok((CheckStatus::Invalid, "document root is not an object".into()));
    };
    let absent: Vec<&String> = required.iter().filter(|f| !object.contains_key(*f)).collect();
    if absent.is_empty() {
        Ok((CheckStatus::Valid, String::new()))
    } else {
        Ok((
            CheckStatus::Invalid,
            format!(
                "missing required fields: {}",
                absent
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ))
    }
}

/// Recorded usage must match what is actually on disk
fn consistency(registry: &TierRegistry, tier: &TierId) -> Result<(CheckStatus, String)> {
    let recorded = registry.used(tier)?;
    let actual: u64 = registry.list_objects(tier)?.iter().map(|m| m.size).sum();
    if recorded == actual {
        Ok((CheckStatus::Valid, String::new()))
    } else {
        Ok((
            CheckStatus::Inconsistent,
            format!("recorded usage {recorded} bytes, disk holds {actual} bytes"),
        ))
    }
}

fn reference(registry: &TierRegistry, check: &IntegrityCheck) -> Result<(CheckStatus, String)> {
    let mut absent = Vec::new();
    for reference in check.option_strings("references") {
        let abs = registry.abs_path(&check.tier, Path::new(&reference))?;
        if !abs.is_file() {
            absent.push(reference);
        }
    }
    if absent.is_empty() {
        Ok((CheckStatus::Valid, String::new()))
    } else {
        Ok((
            CheckStatus::Missing,
            format!("unresolved references: {}", absent.join(", ")),
        ))
    }
}

/// Flag identical content stored more than once in a tier
fn duplicate(registry: &TierRegistry, tier: &TierId) -> Result<(CheckStatus, String)> {
    let mut by_digest: HashMap<(u64, u64), Vec<PathBuf>> = HashMap::new();
    for meta in registry.list_objects(tier)? {
        let abs = registry.abs_path(tier, &meta.path)?;
        let data = match std::fs::read(&abs) {
            Ok(data) => data,
            // Raced with a migration; skip rather than misreport.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        by_digest
            .entry((meta.size, xxh64(&data, 0)))
            .or_default()
            .push(meta.path);
    }
    let groups: Vec<Vec<PathBuf>> = by_digest
        .into_values()
        .filter(|paths| paths.len() > 1)
        .collect();
    if groups.is_empty() {
        Ok((CheckStatus::Valid, String::new()))
    } else {
        let copies: usize = groups.iter().map(|g| g.len() - 1).sum();
        Ok((
            CheckStatus::Invalid,
            format!(
                "{copies} redundant copies across {} duplicate groups",
                groups.len()
            ),
        ))
    }
}
