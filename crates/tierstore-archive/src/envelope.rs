//! Archive envelopes
//!
//! An archive file is a self-verifying envelope: header metadata plus
//! one record per archived object, each carrying its own checksums and
//! base64-encoded content. JSON envelopes are a single serde document;
//! CSV envelopes put the metadata on a leading `#` line followed by a
//! header row and quoted records.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tierstore_common::checksum::{compute_crc32c, sha256_hex};
use tierstore_common::{Error, PolicyId, Result, TaskId};

use crate::policy::ArchiveFormat;

const CSV_HEADER: &str = "path,size,crc32c,sha256,data";

/// One archived object with embedded content and checksums
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// Original path relative to the source tier root
    pub path: PathBuf,
    /// Original size in bytes
    pub size: u64,
    pub crc32c: u32,
    /// SHA-256 of the original content, lowercase hex
    pub sha256: String,
    /// Original content, base64
    pub data: String,
}

impl ArchiveRecord {
    #[must_use]
    pub fn new(path: PathBuf, data: &[u8]) -> Self {
        Self {
            path,
            size: data.len() as u64,
            crc32c: compute_crc32c(data),
            sha256: sha256_hex(data),
            data: BASE64.encode(data),
        }
    }

    /// Decode the content, verifying both embedded checksums
    pub fn decode_verified(&self) -> Result<Vec<u8>> {
        let data = BASE64
            .decode(&self.data)
            .map_err(|e| Error::integrity(format!("undecodable archive record: {e}")))?;
        if data.len() as u64 != self.size || compute_crc32c(&data) != self.crc32c {
            return Err(Error::integrity(format!(
                "archive record {} does not match its embedded checksum",
                self.path.display()
            )));
        }
        let actual = sha256_hex(&data);
        if actual != self.sha256 {
            return Err(Error::ChecksumMismatch {
                expected: self.sha256.clone(),
                actual,
            });
        }
        Ok(data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EnvelopeMeta {
    archive_id: TaskId,
    policy_id: PolicyId,
    created_at: DateTime<Utc>,
}

/// One archive file before serialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEnvelope {
    pub archive_id: TaskId,
    pub policy_id: PolicyId,
    pub created_at: DateTime<Utc>,
    pub records: Vec<ArchiveRecord>,
}

impl ArchiveEnvelope {
    #[must_use]
    pub fn new(archive_id: TaskId, policy_id: PolicyId) -> Self {
        Self {
            archive_id,
            policy_id,
            created_at: Utc::now(),
            records: Vec::new(),
        }
    }

    /// Sum of the original sizes of all records
    #[must_use]
    pub fn original_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }

    /// Serialize per the format, applying envelope-level zstd for
    /// compressed formats.
    pub fn encode(&self, format: ArchiveFormat, level: i32) -> Result<Vec<u8>> {
        let plain = match format {
            ArchiveFormat::Json | ArchiveFormat::JsonZstd => serde_json::to_vec_pretty(self)?,
            ArchiveFormat::Csv | ArchiveFormat::CsvZstd => self.to_csv()?.into_bytes(),
        };
        if format.is_compressed() {
            zstd::encode_all(plain.as_slice(), level)
                .map_err(|e| Error::internal(format!("zstd encode: {e}")))
        } else {
            Ok(plain)
        }
    }

    /// Parse an archive file's bytes per the format
    pub fn decode(raw: &[u8], format: ArchiveFormat) -> Result<Self> {
        let plain = if format.is_compressed() {
            zstd::decode_all(raw)
                .map_err(|e| Error::integrity(format!("archive file undecodable: {e}")))?
        } else {
            raw.to_vec()
        };
        match format {
            ArchiveFormat::Json | ArchiveFormat::JsonZstd => Ok(serde_json::from_slice(&plain)?),
            ArchiveFormat::Csv | ArchiveFormat::CsvZstd => {
                let text = String::from_utf8(plain)
                    .map_err(|e| Error::integrity(format!("archive file is not utf-8: {e}")))?;
                Self::from_csv(&text)
            }
        }
    }

    /// Verify every record's embedded checksums without extracting
    pub fn verify_all(&self) -> Result<()> {
        for record in &self.records {
            record.decode_verified()?;
        }
        Ok(())
    }

    fn to_csv(&self) -> Result<String> {
        let meta = EnvelopeMeta {
            archive_id: self.archive_id,
            policy_id: self.policy_id,
            created_at: self.created_at,
        };
        let mut out = format!("#{}\n{CSV_HEADER}\n", serde_json::to_string(&meta)?);
        for record in &self.records {
            out.push_str(&csv_quote(&record.path.to_string_lossy()));
            out.push(',');
            out.push_str(&record.size.to_string());
            out.push(',');
            out.push_str(&record.crc32c.to_string());
            out.push(',');
            out.push_str(&record.sha256);
            out.push(',');
            out.push_str(&record.data);
            out.push('\n');
        }
        Ok(out)
    }

    fn from_csv(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let meta_line = lines
            .next()
            .and_then(|l| l.strip_prefix('#'))
            .ok_or_else(|| Error::integrity("csv archive is missing its metadata line"))?;
        let meta: EnvelopeMeta = serde_json::from_str(meta_line)?;
        match lines.next() {
            Some(header) if header == CSV_HEADER => {}
            _ => return Err(Error::integrity("csv archive has an unexpected header row")),
        }

        let mut records = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let fields = csv_split(line)?;
            if fields.len() != 5 {
                return Err(Error::integrity(format!(
                    "csv archive row has {} fields, expected 5",
                    fields.len()
                )));
            }
            records.push(ArchiveRecord {
                path: PathBuf::from(&fields[0]),
                size: fields[1]
                    .parse()
                    .map_err(|_| Error::integrity("csv archive row has a non-numeric size"))?,
                crc32c: fields[2]
                    .parse()
                    .map_err(|_| Error::integrity("csv archive row has a non-numeric crc32c"))?,
                sha256: fields[3].clone(),
                data: fields[4].clone(),
            });
        }
        Ok(Self {
            archive_id: meta.archive_id,
            policy_id: meta.policy_id,
            created_at: meta.created_at,
            records,
        })
    }
}

/// Quote a CSV field if it contains a delimiter, quote, or newline
fn csv_quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split one CSV line honoring quoted fields with doubled quotes
fn csv_split(line: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.is_empty() => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(Error::integrity("csv archive row has an unterminated quote"));
    }
    fields.push(current);
    Ok(fields)
}
