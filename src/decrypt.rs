//! Recovering plaintext from envelopes
//!
//! Input may be a bare envelope or a container; the envelope is taken from
//! behind the delimiter when one is present. Wrong secrets and corrupted
//! ciphertext fail the same way.

use crate::container;
use crate::envelope::{Envelope, EnvelopeKind, Sealing};
use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use crate::keystore::KeyStore;
use crate::secretcrypt::{self, PassphraseEscrow, SymmetricKey};
use rsa::RsaPrivateKey;
use std::fmt;
use zeroize::Zeroizing;

/// The secret a recipient holds.
pub enum Secret {
    Passphrase(Zeroizing<Vec<u8>>),
    PrivateKey(RsaPrivateKey),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Passphrase(_) => f.write_str("Passphrase([REDACTED])"),
            Secret::PrivateKey(_) => f.write_str("PrivateKey([REDACTED])"),
        }
    }
}

/// The secret an escrow holder uses instead of the recipient's.
pub enum RecoverySecret {
    /// Private half of the recovery key; opens `rsa` envelopes.
    MasterKey(RsaPrivateKey),
    /// Administrative passphrase; opens `password` envelopes.
    AdminPassphrase(Zeroizing<Vec<u8>>),
}

/// Recovered plaintext and the file name it was encrypted from.
pub struct Decrypted {
    pub kind: EnvelopeKind,
    pub file_name: String,
    pub plaintext: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for Decrypted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decrypted")
            .field("kind", &self.kind)
            .field("file_name", &self.file_name)
            .field("plaintext_len", &self.plaintext.len())
            .finish()
    }
}

/// Parse an envelope (possibly hidden in a container) and open it.
///
/// Fails with `MissingSecret` when `secret` is absent or is the wrong kind
/// of secret for the envelope.
pub fn open(bytes: &[u8], secret: Option<&Secret>) -> Result<Decrypted> {
    let envelope = parse(bytes)?;
    let key = match (&envelope.sealing, secret) {
        (Sealing::Password { salt_user, .. }, Some(Secret::Passphrase(passphrase))) => {
            secretcrypt::derive_passphrase_key(passphrase, salt_user)?
        }
        (Sealing::Rsa { key_user, .. }, Some(Secret::PrivateKey(private))) => {
            secretcrypt::unwrap_key(private, key_user)?
        }
        (_, _) => return Err(missing_secret(envelope.kind())),
    };
    finish(&envelope, &key)
}

/// Open an envelope with the escrow holder's secret.
pub fn recover(bytes: &[u8], secret: &RecoverySecret) -> Result<Decrypted> {
    let envelope = parse(bytes)?;
    let key = match (&envelope.sealing, secret) {
        (Sealing::Rsa { key_master, .. }, RecoverySecret::MasterKey(master)) => {
            let wrapped = key_master.as_ref().ok_or_else(not_escrowed)?;
            secretcrypt::unwrap_key(master, wrapped)?
        }
        (Sealing::Password { salt_user, escrow, .. }, RecoverySecret::AdminPassphrase(admin)) => {
            let escrow = escrow.as_ref().ok_or_else(not_escrowed)?;
            let passphrase = secretcrypt::recover_escrowed_passphrase(escrow, admin)?;
            secretcrypt::derive_passphrase_key(&passphrase, salt_user)?
        }
        (_, _) => return Err(missing_secret(envelope.kind())),
    };
    tracing::info!(kind = %envelope.kind(), "opened envelope with recovery secret");
    finish(&envelope, &key)
}

/// Reveal the passphrase escrowed in a password envelope.
pub fn recover_passphrase(bytes: &[u8], admin_passphrase: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let envelope = parse(bytes)?;
    let escrow: &PassphraseEscrow = match &envelope.sealing {
        Sealing::Password { escrow, .. } => escrow.as_ref().ok_or_else(not_escrowed)?,
        Sealing::Rsa { .. } => {
            return Err(EndcryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::UnsupportedMethod,
                "only password envelopes escrow a passphrase",
            ));
        }
    };
    secretcrypt::recover_escrowed_passphrase(escrow, admin_passphrase)
}

/// Opens envelopes with private keys held in a [`KeyStore`].
pub struct Decryptor<'a> {
    keys: &'a KeyStore,
}

impl<'a> Decryptor<'a> {
    pub fn new(keys: &'a KeyStore) -> Self {
        Self { keys }
    }

    /// Open an `rsa` envelope with the private key stored under `alias`.
    pub fn open_with_alias(&self, bytes: &[u8], alias: &str) -> Result<Decrypted> {
        let private = self.keys.private_key(alias)?;
        open(bytes, Some(&Secret::PrivateKey(private)))
    }

    /// Try every stored private key until one opens the envelope.
    ///
    /// Fails with `MissingSecret` if the store holds no private keys and
    /// with the opaque `UnwrapFailed` if none of them fits.
    pub fn open_with_any_key(&self, bytes: &[u8]) -> Result<Decrypted> {
        let mut tried = 0usize;
        for pair in self.keys.list()? {
            if !pair.has_private {
                continue;
            }
            tried += 1;
            match self.open_with_alias(bytes, &pair.alias) {
                Ok(decrypted) => {
                    tracing::debug!(alias = %pair.alias, "envelope opened by stored key");
                    return Ok(decrypted);
                }
                Err(e) if e.kind == Some(ErrorKind::UnwrapFailed) => continue,
                Err(e) => return Err(e),
            }
        }

        if tried == 0 {
            return Err(missing_secret(EnvelopeKind::Rsa));
        }
        Err(EndcryptError::decryption_failed(ErrorKind::UnwrapFailed))
    }
}

fn parse(bytes: &[u8]) -> Result<Envelope> {
    if container::contains_delimiter(bytes) {
        tracing::debug!("unwrapping envelope from container");
    }
    Envelope::parse(container::envelope_bytes(bytes))
}

fn finish(envelope: &Envelope, key: &SymmetricKey) -> Result<Decrypted> {
    let plaintext = Zeroizing::new(secretcrypt::open(key, &envelope.iv, &envelope.data, &[])?);
    tracing::debug!(kind = %envelope.kind(), bytes = plaintext.len(), "opened envelope");
    Ok(Decrypted {
        kind: envelope.kind(),
        file_name: envelope.output_file_name(),
        plaintext,
    })
}

fn missing_secret(kind: EnvelopeKind) -> EndcryptError {
    let needed = match kind {
        EnvelopeKind::Password => "a passphrase",
        EnvelopeKind::Rsa => "a private key",
    };
    EndcryptError::with_kind(
        ErrorCategory::User,
        ErrorKind::MissingSecret,
        format!("this {} envelope requires {}", kind, needed),
    )
}

fn not_escrowed() -> EndcryptError {
    EndcryptError::with_kind(
        ErrorCategory::User,
        ErrorKind::MissingSecret,
        "envelope was not escrowed for a recovery holder",
    )
}
