//! The self-describing JSON record holding one encrypted file
//!
//! ```text
//! {
//!   "filename": "report.pdf", "ext": ".pdf", "type": "password" | "rsa",
//!   "data": hex(ciphertext || tag), "iv": hex(16 bytes),
//!   password: "salt_user", "iv_user",
//!             "salt_admin", "iv_admin", "encrypted_user_password" (escrow)
//!   rsa:      "key_user", "key_master" (escrow)
//! }
//! ```
//!
//! Every binary value is lowercase hex. Escrow fields are present only when a
//! recovery recipient was configured at encryption time.

use crate::container;
use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use crate::secretcrypt::{IV_LEN, PassphraseEscrow, SALT_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name used when an envelope carries no usable file name.
const FALLBACK_NAME: &str = "decrypted";

/// How the content key of an envelope is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Password,
    Rsa,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Password => "password",
            EnvelopeKind::Rsa => "rsa",
        }
    }

    fn from_type(value: &str) -> Option<Self> {
        match value {
            "password" => Some(EnvelopeKind::Password),
            "rsa" => Some(EnvelopeKind::Rsa),
            _ => None,
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method-specific envelope fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sealing {
    Password {
        salt_user: Vec<u8>,
        /// Generated and stored for format compatibility; not used to decrypt.
        iv_user: Vec<u8>,
        escrow: Option<PassphraseEscrow>,
    },
    Rsa {
        key_user: Vec<u8>,
        key_master: Option<Vec<u8>>,
    },
}

/// A parsed envelope. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub filename: String,
    pub ext: String,
    pub iv: Vec<u8>,
    pub data: Vec<u8>,
    pub sealing: Sealing,
}

#[derive(Serialize, Deserialize, Default)]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ext: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    salt_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    salt_admin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iv_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iv_admin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encrypted_user_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_master: Option<String>,
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self.sealing {
            Sealing::Password { .. } => EnvelopeKind::Password,
            Sealing::Rsa { .. } => EnvelopeKind::Rsa,
        }
    }

    /// Serialize as pretty-printed JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut wire = WireEnvelope {
            filename: Some(self.filename.clone()),
            ext: Some(self.ext.clone()),
            kind: Some(self.kind().as_str().to_string()),
            data: Some(hex::encode(&self.data)),
            iv: Some(hex::encode(&self.iv)),
            ..WireEnvelope::default()
        };
        match &self.sealing {
            Sealing::Password {
                salt_user,
                iv_user,
                escrow,
            } => {
                wire.salt_user = Some(hex::encode(salt_user));
                wire.iv_user = Some(hex::encode(iv_user));
                if let Some(escrow) = escrow {
                    wire.salt_admin = Some(hex::encode(escrow.salt));
                    wire.iv_admin = Some(hex::encode(escrow.iv));
                    wire.encrypted_user_password = Some(hex::encode(&escrow.ciphertext));
                }
            }
            Sealing::Rsa {
                key_user,
                key_master,
            } => {
                wire.key_user = Some(hex::encode(key_user));
                wire.key_master = key_master.as_ref().map(hex::encode);
            }
        }

        serde_json::to_vec_pretty(&wire).map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "failed to serialize envelope",
                e,
            )
        })
    }

    /// Parse envelope JSON.
    ///
    /// `data`, `iv` and `type` are required and must be hex (`type` aside).
    /// An unknown `type` is `UnsupportedMethod`; anything else wrong is
    /// `MalformedEnvelope`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_slice(bytes).map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::MalformedEnvelope,
                "input is not an envelope",
                e,
            )
        })?;

        let data = required_hex(&wire.data, "data")?;
        let iv = required_hex(&wire.iv, "iv")?;
        let kind_str = wire
            .kind
            .as_deref()
            .ok_or_else(|| malformed("envelope is missing the type field"))?;
        let kind = EnvelopeKind::from_type(kind_str).ok_or_else(|| {
            EndcryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::UnsupportedMethod,
                format!("unsupported envelope type '{}'", kind_str),
            )
        })?;

        let sealing = match kind {
            EnvelopeKind::Password => Sealing::Password {
                salt_user: required_hex(&wire.salt_user, "salt_user")?,
                iv_user: optional_hex(&wire.iv_user, "iv_user")?.unwrap_or_default(),
                escrow: parse_escrow(&wire)?,
            },
            EnvelopeKind::Rsa => Sealing::Rsa {
                key_user: required_hex(&wire.key_user, "key_user")?,
                key_master: optional_hex(&wire.key_master, "key_master")?,
            },
        };

        let filename = wire
            .filename
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_NAME.to_string());
        let ext = match wire.ext {
            Some(ext) => ext,
            None => extension_of(&filename),
        };

        Ok(Envelope {
            filename,
            ext,
            iv,
            data,
            sealing,
        })
    }

    /// The file name plaintext should be restored under.
    ///
    /// `filename` already carries the extension, so it is only appended when
    /// missing. The result is reduced to a single path component.
    pub fn output_file_name(&self) -> String {
        if self.filename.ends_with(&self.ext) {
            sanitize_file_name(&self.filename)
        } else {
            sanitize_file_name(&format!("{}{}", self.filename, self.ext))
        }
    }
}

/// Read the `type` of envelope bytes without attempting decryption.
///
/// Envelopes hidden in a container are looked up behind the delimiter.
/// Returns `None` for anything that is not a recognizable envelope.
pub fn detect_method(bytes: &[u8]) -> Option<EnvelopeKind> {
    let bytes = container::envelope_bytes(bytes);
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    EnvelopeKind::from_type(value.get("type")?.as_str()?)
}

/// The dot-prefixed extension of a file name, or empty.
pub fn extension_of(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

/// Reduce an untrusted name to one safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        FALLBACK_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

fn parse_escrow(wire: &WireEnvelope) -> Result<Option<PassphraseEscrow>> {
    let salt = optional_hex(&wire.salt_admin, "salt_admin")?;
    let iv = optional_hex(&wire.iv_admin, "iv_admin")?;
    let ciphertext = optional_hex(&wire.encrypted_user_password, "encrypted_user_password")?;

    match (salt, iv, ciphertext) {
        (None, None, None) => Ok(None),
        (Some(salt), Some(iv), Some(ciphertext)) => {
            let salt: [u8; SALT_LEN] = salt
                .try_into()
                .map_err(|_| malformed(format!("salt_admin must be {} bytes", SALT_LEN)))?;
            let iv: [u8; IV_LEN] = iv
                .try_into()
                .map_err(|_| malformed(format!("iv_admin must be {} bytes", IV_LEN)))?;
            Ok(Some(PassphraseEscrow {
                salt,
                iv,
                ciphertext,
            }))
        }
        _ => Err(malformed("envelope has incomplete passphrase escrow fields")),
    }
}

fn required_hex(value: &Option<String>, field: &str) -> Result<Vec<u8>> {
    optional_hex(value, field)?
        .ok_or_else(|| malformed(format!("envelope is missing the {} field", field)))
}

fn optional_hex(value: &Option<String>, field: &str) -> Result<Option<Vec<u8>>> {
    value
        .as_deref()
        .map(|s| {
            hex::decode(s).map_err(|e| {
                EndcryptError::with_kind_and_source(
                    ErrorCategory::User,
                    ErrorKind::MalformedEnvelope,
                    format!("envelope field {} is not valid hex", field),
                    e,
                )
            })
        })
        .transpose()
}

fn malformed(msg: impl Into<String>) -> EndcryptError {
    EndcryptError::with_kind(ErrorCategory::User, ErrorKind::MalformedEnvelope, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password_envelope() -> Envelope {
        Envelope {
            filename: "notes.txt".to_string(),
            ext: ".txt".to_string(),
            iv: vec![1; 16],
            data: vec![2; 20],
            sealing: Sealing::Password {
                salt_user: vec![3; 16],
                iv_user: vec![4; 16],
                escrow: None,
            },
        }
    }

    #[test]
    fn test_password_without_escrow_omits_fields() {
        let json = password_envelope().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();

        assert_eq!(value["type"], "password");
        assert_eq!(value["filename"], "notes.txt");
        assert_eq!(value["ext"], ".txt");
        assert_eq!(value["iv"], "01".repeat(16));
        assert!(value.get("salt_admin").is_none());
        assert!(value.get("encrypted_user_password").is_none());
        assert!(value.get("key_user").is_none());

        assert_eq!(Envelope::parse(&json).unwrap(), password_envelope());
    }

    #[test]
    fn test_rsa_fields() {
        let envelope = Envelope {
            sealing: Sealing::Rsa {
                key_user: vec![5; 256],
                key_master: Some(vec![6; 256]),
            },
            ..password_envelope()
        };
        let json = envelope.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["type"], "rsa");
        assert_eq!(value["key_master"], "06".repeat(256));
        assert!(value.get("salt_user").is_none());

        assert_eq!(Envelope::parse(&json).unwrap(), envelope);
    }

    #[test]
    fn test_missing_and_bad_common_fields() {
        for json in [
            r#"{"type":"password","iv":"00","salt_user":"00"}"#,
            r#"{"type":"password","data":"00","salt_user":"00"}"#,
            r#"{"data":"00","iv":"00"}"#,
            r#"{"type":"password","data":"zz","iv":"00","salt_user":"00"}"#,
            r#"{"type":"password","data":"00","iv":"00"}"#,
            r#"{"type":"rsa","data":"00","iv":"00"}"#,
            "not json at all",
        ] {
            let err = Envelope::parse(json.as_bytes()).expect_err(json);
            assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope), "{}", json);
        }
    }

    #[test]
    fn test_unknown_type() {
        let err = Envelope::parse(br#"{"type":"ecdh","data":"00","iv":"00"}"#)
            .expect_err("expected unsupported method");
        assert_eq!(err.kind, Some(ErrorKind::UnsupportedMethod));
    }

    #[test]
    fn test_partial_escrow_rejected() {
        let json = br#"{"type":"password","data":"00","iv":"00","salt_user":"00","salt_admin":"00"}"#;
        let err = Envelope::parse(json).expect_err("expected malformed escrow");
        assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope));
    }

    #[test]
    fn test_detect_method() {
        let json = password_envelope().to_json().unwrap();
        assert_eq!(detect_method(&json), Some(EnvelopeKind::Password));

        let mut hidden = b"%PDF-1.7 carrier".to_vec();
        hidden.extend_from_slice(container::DELIMITER);
        hidden.extend_from_slice(br#"{"type":"rsa"}"#);
        assert_eq!(detect_method(&hidden), Some(EnvelopeKind::Rsa));

        assert_eq!(detect_method(br#"{"type":"other"}"#), None);
        assert_eq!(detect_method(b"\x89PNG"), None);
    }

    #[test]
    fn test_output_file_name() {
        let mut envelope = password_envelope();
        assert_eq!(envelope.output_file_name(), "notes.txt");

        envelope.filename = "notes".to_string();
        assert_eq!(envelope.output_file_name(), "notes.txt");

        envelope.filename = "../../etc/passwd".to_string();
        envelope.ext = String::new();
        assert_eq!(envelope.output_file_name(), "passwd");

        envelope.filename = "..".to_string();
        assert_eq!(envelope.output_file_name(), "decrypted");
    }

    #[test]
    fn test_missing_names_use_fallbacks() {
        let envelope =
            Envelope::parse(br#"{"type":"password","data":"00","iv":"00","salt_user":"00"}"#)
                .unwrap();
        assert_eq!(envelope.filename, "decrypted");
        assert_eq!(envelope.ext, "");

        let envelope = Envelope::parse(
            br#"{"filename":"a.tar.gz","type":"password","data":"00","iv":"00","salt_user":"00"}"#,
        )
        .unwrap();
        assert_eq!(envelope.ext, ".gz");
        assert_eq!(envelope.output_file_name(), "a.tar.gz");
    }
}
