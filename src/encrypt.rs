//! Building envelopes from plaintext
//!
//! Password envelopes are sealed under `HKDF-SHA256(passphrase, salt_user)`.
//! Public-key envelopes are sealed under a fresh random key that is then
//! RSA-OAEP wrapped for the recipient.
//!
//! Both methods can escrow access for a recovery holder. A configured
//! recovery public key receives its own wrap of the content key
//! (`key_master`), and a configured administrative passphrase receives a
//! CBC-encrypted copy of the user's passphrase. With an empty [`Recovery`]
//! the escrow fields are not written.

use crate::envelope::{self, Envelope, Sealing};
use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use crate::keystore::KeyStore;
use crate::secretcrypt::{self, IV_LEN, SALT_LEN, SymmetricKey};
use rsa::RsaPublicKey;
use std::fmt;
use std::path::Path;
use zeroize::Zeroizing;

/// How the content key is protected.
pub enum Method {
    /// Seal under a key derived from this passphrase.
    Password(Zeroizing<Vec<u8>>),
    /// Seal for the public key stored under this alias.
    PublicKey(String),
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Password(_) => f.write_str("Password([REDACTED])"),
            Method::PublicKey(alias) => f.debug_tuple("PublicKey").field(alias).finish(),
        }
    }
}

/// Optional escrow recipients added to every envelope.
#[derive(Default)]
pub struct Recovery {
    public_key: Option<RsaPublicKey>,
    admin_passphrase: Option<Zeroizing<Vec<u8>>>,
}

impl Recovery {
    /// No escrow at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Wrap content keys of public-key envelopes for this key as well.
    pub fn with_public_key(mut self, key: RsaPublicKey) -> Self {
        self.public_key = Some(key);
        self
    }

    /// Escrow the passphrase of password envelopes under this passphrase.
    pub fn with_admin_passphrase(mut self, passphrase: Zeroizing<Vec<u8>>) -> Self {
        self.admin_passphrase = Some(passphrase);
        self
    }

    pub fn public_key(&self) -> Option<&RsaPublicKey> {
        self.public_key.as_ref()
    }

    pub fn has_admin_passphrase(&self) -> bool {
        self.admin_passphrase.is_some()
    }
}

impl fmt::Debug for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recovery")
            .field("public_key", &self.public_key.is_some())
            .field("admin_passphrase", &self.admin_passphrase.is_some())
            .finish()
    }
}

/// Encrypts files for passphrases or stored recipients.
///
/// Recipients are resolved through the key store given with
/// [`Encryptor::with_keys`]; without one only passphrases work.
pub struct Encryptor<'a> {
    keys: Option<&'a KeyStore>,
    recovery: Recovery,
}

impl<'a> Encryptor<'a> {
    pub fn new(recovery: Recovery) -> Self {
        Self {
            keys: None,
            recovery,
        }
    }

    pub fn with_keys(mut self, keys: &'a KeyStore) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Build an envelope for `plaintext` that was read from `filename`.
    ///
    /// Either every configured wrap succeeds or no envelope is produced.
    pub fn encrypt(&self, plaintext: &[u8], filename: &str, method: &Method) -> Result<Envelope> {
        match method {
            Method::Password(passphrase) => {
                seal_with_passphrase(plaintext, filename, passphrase, &self.recovery)
            }
            Method::PublicKey(alias) => {
                let keys = self.keys.ok_or_else(|| {
                    EndcryptError::with_kind(
                        ErrorCategory::User,
                        ErrorKind::KeyNotFound,
                        format!("no key store available to resolve '{}'", alias),
                    )
                })?;
                let recipient = keys
                    .public_key(alias)
                    .map_err(|e| e.with_context(format!("cannot resolve recipient '{}'", alias)))?;
                seal_with_public_key(plaintext, filename, &recipient, &self.recovery)
            }
        }
    }
}

/// Seal under a passphrase-derived key.
pub fn seal_with_passphrase(
    plaintext: &[u8],
    filename: &str,
    passphrase: &[u8],
    recovery: &Recovery,
) -> Result<Envelope> {
    if passphrase.is_empty() {
        return Err(EndcryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::MissingSecret,
            "passphrase must not be empty",
        ));
    }

    let salt_user = secretcrypt::random_bytes::<SALT_LEN>();
    let key = secretcrypt::derive_passphrase_key(passphrase, &salt_user)?;
    let iv = secretcrypt::random_bytes::<IV_LEN>();
    let data = secretcrypt::seal(&key, &iv, plaintext, &[])?;

    let escrow = recovery
        .admin_passphrase
        .as_ref()
        .map(|admin| secretcrypt::escrow_passphrase(passphrase, admin))
        .transpose()?;

    tracing::debug!(
        bytes = plaintext.len(),
        escrowed = escrow.is_some(),
        "sealed password envelope"
    );
    Ok(build(
        filename,
        &iv,
        data,
        Sealing::Password {
            salt_user: salt_user.to_vec(),
            iv_user: secretcrypt::random_bytes::<IV_LEN>().to_vec(),
            escrow,
        },
    ))
}

/// Seal under a fresh random key wrapped for `recipient`.
pub fn seal_with_public_key(
    plaintext: &[u8],
    filename: &str,
    recipient: &RsaPublicKey,
    recovery: &Recovery,
) -> Result<Envelope> {
    let key = SymmetricKey::generate();
    let iv = secretcrypt::random_bytes::<IV_LEN>();
    let data = secretcrypt::seal(&key, &iv, plaintext, &[])?;

    let key_user = secretcrypt::wrap_key(recipient, &key)?;
    let key_master = recovery
        .public_key
        .as_ref()
        .map(|master| {
            secretcrypt::wrap_key(master, &key)
                .map_err(|e| e.with_context("cannot wrap content key for the recovery key"))
        })
        .transpose()?;

    tracing::debug!(
        bytes = plaintext.len(),
        escrowed = key_master.is_some(),
        "sealed rsa envelope"
    );
    Ok(build(
        filename,
        &iv,
        data,
        Sealing::Rsa {
            key_user,
            key_master,
        },
    ))
}

fn build(filename: &str, iv: &[u8], data: Vec<u8>, sealing: Sealing) -> Envelope {
    let base = Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(filename)
        .to_string();
    Envelope {
        ext: envelope::extension_of(&base),
        filename: base,
        iv: iv.to_vec(),
        data,
        sealing,
    }
}
