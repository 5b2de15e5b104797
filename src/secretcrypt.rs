//! Cryptographic primitives behind the envelope and the file vault
//!
//! - AES-256-GCM seals file contents and vault entries. Nonces are generated
//!   as 16 random bytes for envelope compatibility; only the first 12 are fed
//!   to GCM.
//! - HKDF-SHA256 turns a passphrase plus salt into a content key.
//! - AES-256-CBC/PKCS#7 escrows the raw passphrase under the administrative
//!   recovery passphrase.
//! - RSA-OAEP-SHA256 wraps content keys for public-key recipients.
//! - scrypt derives the file vault key from the vault passphrase.

use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use scrypt::{Params, scrypt};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Length of a content key in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Length of generated IVs in bytes.
pub const IV_LEN: usize = 16;

/// Length of salts in bytes.
pub const SALT_LEN: usize = 16;

/// Number of IV bytes actually used as the GCM nonce.
pub const GCM_NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag appended to ciphertext.
pub const TAG_LEN: usize = 16;

/// scrypt r parameter (block size)
const SCRYPT_R: u32 = 8;

/// scrypt p parameter (parallelization)
const SCRYPT_P: u32 = 1;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// A 256-bit symmetric key, used for a single operation.
///
/// Zeroized on drop.
pub struct SymmetricKey {
    bytes: [u8; KEY_LEN],
}

impl SymmetricKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The user's passphrase, encrypted for the administrative recovery holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassphraseEscrow {
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

/// Fill a fixed-size array from the OS RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Seal plaintext under AES-256-GCM, returning `ciphertext || tag`.
///
/// `iv` must hold at least 12 bytes; only the first 12 are used.
pub fn seal(key: &SymmetricKey, iv: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let nonce = gcm_nonce(iv)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| {
        EndcryptError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "AES-256-GCM rejected a 32 byte key",
        )
    })?;
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| {
            EndcryptError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "AES-256-GCM encryption failed",
            )
        })
}

/// Open `ciphertext || tag` sealed by [`seal`].
///
/// A wrong key and corrupted data both produce the same
/// `AuthenticationFailed` error.
pub fn open(key: &SymmetricKey, iv: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < TAG_LEN {
        return Err(EndcryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::InvalidCiphertext,
            format!(
                "ciphertext is {} bytes, shorter than the {} byte authentication tag",
                sealed.len(),
                TAG_LEN
            ),
        ));
    }
    let nonce = gcm_nonce(iv)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| {
        EndcryptError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "AES-256-GCM rejected a 32 byte key",
        )
    })?;
    cipher
        .decrypt(nonce, Payload { msg: sealed, aad })
        .map_err(|_| EndcryptError::decryption_failed(ErrorKind::AuthenticationFailed))
}

fn gcm_nonce(iv: &[u8]) -> Result<&Nonce<aes_gcm::aead::consts::U12>> {
    if iv.len() < GCM_NONCE_LEN {
        return Err(EndcryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::MalformedEnvelope,
            format!(
                "iv is {} bytes, at least {} are required",
                iv.len(),
                GCM_NONCE_LEN
            ),
        ));
    }
    Ok(Nonce::from_slice(&iv[..GCM_NONCE_LEN]))
}

/// Derive a 256-bit key from a passphrase with HKDF-SHA256 (empty info).
pub fn derive_passphrase_key(passphrase: &[u8], salt: &[u8]) -> Result<SymmetricKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), passphrase);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(&[], &mut okm).map_err(|_| {
        EndcryptError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "HKDF refused a 32 byte output",
        )
    })?;
    Ok(SymmetricKey::from_bytes(okm))
}

/// Encrypt the raw passphrase for the administrative recovery holder.
pub fn escrow_passphrase(passphrase: &[u8], admin_passphrase: &[u8]) -> Result<PassphraseEscrow> {
    let salt = random_bytes::<SALT_LEN>();
    let iv = random_bytes::<IV_LEN>();
    escrow_passphrase_deterministic(passphrase, admin_passphrase, &salt, &iv)
}

/// Escrow with caller-provided salt and IV.
///
/// This function is ONLY for tests that need reproducible output.
/// Production code must use [`escrow_passphrase`].
pub fn escrow_passphrase_deterministic(
    passphrase: &[u8],
    admin_passphrase: &[u8],
    salt: &[u8; SALT_LEN],
    iv: &[u8; IV_LEN],
) -> Result<PassphraseEscrow> {
    let admin_key = derive_passphrase_key(admin_passphrase, salt)?;
    let encryptor = Aes256CbcEnc::new_from_slices(admin_key.as_bytes(), iv).map_err(|_| {
        EndcryptError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "AES-256-CBC rejected key or IV length",
        )
    })?;
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(passphrase);

    Ok(PassphraseEscrow {
        salt: *salt,
        iv: *iv,
        ciphertext,
    })
}

/// Recover an escrowed passphrase with the administrative passphrase.
pub fn recover_escrowed_passphrase(
    escrow: &PassphraseEscrow,
    admin_passphrase: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let admin_key = derive_passphrase_key(admin_passphrase, &escrow.salt)?;
    let decryptor = Aes256CbcDec::new_from_slices(admin_key.as_bytes(), &escrow.iv).map_err(|_| {
        EndcryptError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "AES-256-CBC rejected key or IV length",
        )
    })?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(&escrow.ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| EndcryptError::decryption_failed(ErrorKind::AuthenticationFailed))
}

/// Wrap a content key for a recipient with RSA-OAEP-SHA256.
pub fn wrap_key(recipient: &RsaPublicKey, key: &SymmetricKey) -> Result<Vec<u8>> {
    recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::UnrecognizedKeyFormat,
                "recipient key cannot wrap a content key",
                e,
            )
        })
}

/// Unwrap a content key with the recipient's private key.
///
/// Any failure, including a correctly unwrapped value of the wrong size,
/// is reported as the same opaque `UnwrapFailed`.
pub fn unwrap_key(private: &RsaPrivateKey, wrapped: &[u8]) -> Result<SymmetricKey> {
    let raw = Zeroizing::new(
        private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| EndcryptError::decryption_failed(ErrorKind::UnwrapFailed))?,
    );
    let bytes: [u8; KEY_LEN] = raw
        .as_slice()
        .try_into()
        .map_err(|_| EndcryptError::decryption_failed(ErrorKind::UnwrapFailed))?;
    Ok(SymmetricKey::from_bytes(bytes))
}

/// Derive the file vault key from the vault passphrase with scrypt.
pub fn derive_vault_key(passphrase: &[u8], salt: &[u8], log_n: u8) -> Result<SymmetricKey> {
    let params = Params::new(log_n, SCRYPT_R, SCRYPT_P, KEY_LEN).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Config,
            "invalid scrypt parameters",
            e,
        )
    })?;

    let mut key = [0u8; KEY_LEN];
    scrypt(passphrase, salt, &params, &mut key).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "scrypt key derivation failed",
            e,
        )
    })?;
    Ok(SymmetricKey::from_bytes(key))
}
