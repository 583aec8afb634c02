//! Content hashes: file checksums for evidence and the plan fingerprint.

use crate::contract::Contract;
use crate::error::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Number of hex characters in a plan fingerprint.
pub const FINGERPRINT_LEN: usize = 16;

/// SHA-256 of a file's bytes as lowercase hex.
///
/// The file is streamed; any read error aborts the hash instead of returning
/// a digest of a prefix.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of an in-memory byte string as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Short, key-order independent identity of a contract's content.
pub fn plan_fingerprint(contract: &Contract) -> Result<String> {
    let value = serde_json::to_value(contract)?;
    let canonical = canonical_json(&value);
    let mut digest = sha256_hex(canonical.as_bytes());
    digest.truncate(FINGERPRINT_LEN);
    Ok(digest)
}

/// Compact JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn checksum_is_stable_and_tracks_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "hello").unwrap();
        let first = file_checksum(&path).unwrap();
        assert_eq!(first, file_checksum(&path).unwrap());
        assert_eq!(
            first,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        std::fs::write(&path, "hello!").unwrap();
        assert_ne!(first, file_checksum(&path).unwrap());

        std::fs::write(&path, "hello").unwrap();
        assert_eq!(first, file_checksum(&path).unwrap());
    }

    #[test]
    fn checksum_of_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = file_checksum(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Io(_)));
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = Contract::from_yaml_str(
            r#"
task_id: T1
title: Demo
commands:
  - id: "01"
    exec:
      cmd: write_file
      args: {file_path: out.txt, content: hello}
"#,
        )
        .unwrap();
        let b = Contract::from_yaml_str(
            r#"
commands:
  - exec:
      args: {content: hello, file_path: out.txt}
      cmd: write_file
    id: "01"
title: Demo
task_id: T1
"#,
        )
        .unwrap();
        let fa = plan_fingerprint(&a).unwrap();
        assert_eq!(fa, plan_fingerprint(&b).unwrap());
        assert_eq!(fa.len(), FINGERPRINT_LEN);
        assert!(fa.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let base = "task_id: T1\ncommands:\n  - id: a\n    exec: {cmd: git, args: [status]}\n";
        let changed = "task_id: T1\ncommands:\n  - id: a\n    exec: {cmd: git, args: [log]}\n";
        let fa = plan_fingerprint(&Contract::from_yaml_str(base).unwrap()).unwrap();
        let fb = plan_fingerprint(&Contract::from_yaml_str(changed).unwrap()).unwrap();
        assert_ne!(fa, fb);
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = serde_json::json!({"b": {"z": 1, "a": [true, null]}, "a": "x"});
        assert_eq!(canonical_json(&value), r#"{"a":"x","b":{"a":[true,null],"z":1}}"#);
    }
}
