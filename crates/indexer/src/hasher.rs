use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Bytes of the SHA-256 digest kept in a fingerprint (128 bits).
const FINGERPRINT_BYTES: usize = 16;

/// Salted content digest, rendered as lowercase hex.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical encoding of everything besides the file bytes that the derived artifact
/// depends on. Object keys are sorted, so two salts built from equal inputs are equal
/// regardless of field order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FingerprintSalt(String);

impl FingerprintSalt {
    /// `phase` keeps the two pipelines apart even when their other inputs coincide.
    pub fn new(phase: &str, inputs: &impl Serialize) -> Result<Self> {
        let value = serde_json::json!({
            "phase": phase,
            "inputs": serde_json::to_value(inputs)?,
        });
        let mut out = String::new();
        write_canonical(&value, &mut out);
        Ok(Self(out))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Same `bytes` and same `salt` always give the same fingerprint; a change to either gives a
/// different one.
#[must_use]
pub fn fingerprint(bytes: &[u8], salt: &FingerprintSalt) -> ContentFingerprint {
    let mut hasher = Sha256::new();
    let salt = salt.as_str().as_bytes();
    hasher.update((salt.len() as u64).to_le_bytes());
    hasher.update(salt);
    hasher.update(bytes);
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(FINGERPRINT_BYTES * 2);
    for byte in &digest[..FINGERPRINT_BYTES] {
        hex.push_str(&format!("{byte:02x}"));
    }
    ContentFingerprint(hex)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
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
