use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

/// One digest over `header` followed by the bytes of every file in `paths`.
pub fn sha256_inputs<'a, I>(header: &[u8], paths: I) -> Result<String>
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut hasher = Sha256::new();
    hasher.update(header);
    let mut buf = [0_u8; 8192];

    for path in paths {
        let mut file = File::open(path)
            .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;
        loop {
            let count = file
                .read(&mut buf)
                .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
            if count == 0 {
                break;
            }
            hasher.update(&buf[..count]);
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Writes through a sibling temp file so readers never see half a document.
pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;

    let tmp_path = path.with_extension("json.tmp");
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("failed to create json file: {}", tmp_path.display()))?;
    file.write_all(&data)
        .with_context(|| format!("failed to write json file: {}", tmp_path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("failed to finalize json file: {}", tmp_path.display()))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to move json file into place: {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_covers_header_and_every_input() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.json");
        fs::write(&model, b"{\"sources\": []}").unwrap();

        let header_only = sha256_inputs(b"{}", Vec::<&Path>::new()).unwrap();
        let both = sha256_inputs(b"{}", [model.as_path()]).unwrap();
        assert_ne!(header_only, both);
        assert_eq!(both.len(), 64);
        assert_ne!(sha256_inputs(b"{ }", [model.as_path()]).unwrap(), both);

        fs::write(&model, b"{\"sources\": [1]}").unwrap();
        assert_ne!(sha256_inputs(b"{}", [model.as_path()]).unwrap(), both);
    }

    #[test]
    fn json_is_written_in_place_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("maps.json");

        write_json_pretty(&path, &serde_json::json!({"job_id": 3})).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with("}\n"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn compact_timestamps_sort_lexically() {
        let ts = DateTime::parse_from_rfc3339("2026-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(utc_compact_string(ts), "20260304T050607Z");
    }
}
