//! Process-external storage for RSA key material
//!
//! A vault maps `(tag, class)` to DER bytes. Two implementations exist:
//!
//! - [`FileVault`]: a directory of AES-256-GCM sealed entries under a key
//!   derived from a vault passphrase with scrypt. Entry file names are
//!   hashes of the tag, so aliases are not visible on disk.
//! - `KeyringVault` (feature `keychain`): the platform keychain.

use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use crate::file_ops;
use crate::secretcrypt::{self, GCM_NONCE_LEN, IV_LEN, SALT_LEN, SymmetricKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Key algorithm recorded with every vault entry.
pub const KEY_TYPE_RSA: &str = "RSA";

const HEADER_FILE: &str = "vault.json";
const HEADER_VERSION: u32 = 1;
const CHECK_PLAINTEXT: &[u8] = b"endcrypt vault";

/// Which half of a keypair an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyClass {
    Public,
    Private,
}

impl KeyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyClass::Public => "public",
            KeyClass::Private => "private",
        }
    }
}

impl fmt::Display for KeyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage for key material that outlives the process.
///
/// Implementations must be safe to query from several threads at once.
/// Concurrent mutation of the same tag is the caller's problem.
pub trait KeyVault: Send + Sync {
    /// Store (or replace) the DER bytes of one key half.
    fn put(&self, tag: &str, class: KeyClass, key_bits: usize, der: &[u8]) -> Result<()>;

    /// Fetch the DER bytes of one key half, if present.
    fn get(&self, tag: &str, class: KeyClass) -> Result<Option<Zeroizing<Vec<u8>>>>;

    /// Remove one key half. Returns whether anything was removed.
    fn delete(&self, tag: &str, class: KeyClass) -> Result<bool>;

    /// Whether one key half is present.
    fn contains(&self, tag: &str, class: KeyClass) -> Result<bool> {
        Ok(self.get(tag, class)?.is_some())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultHeader {
    version: u32,
    kdf: String,
    salt: String,
    log_n: u8,
    check: String,
}

#[derive(Serialize, Deserialize)]
struct VaultRecord {
    key_type: String,
    key_size_bits: usize,
    class: KeyClass,
    der: String,
}

/// Encrypted on-disk vault.
pub struct FileVault {
    dir: PathBuf,
    key: SymmetricKey,
}

impl FileVault {
    /// Open the vault in `dir`, creating it if it does not exist.
    ///
    /// `log_n` is the scrypt cost used when creating a vault; an existing
    /// vault keeps the cost it was created with. A wrong passphrase for an
    /// existing vault fails with `AuthenticationFailed`.
    pub fn open(dir: &Path, passphrase: &[u8], log_n: u8) -> Result<Self> {
        file_ops::create_private_dir(dir)?;
        let header_path = dir.join(HEADER_FILE);

        let key = match fs::read(&header_path) {
            Ok(bytes) => unlock(&bytes, passphrase)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(dir = %dir.display(), "creating key vault");
                initialize(&header_path, passphrase, log_n)?
            }
            Err(e) => return Err(io_error(format!("failed to read {}", header_path.display()), e)),
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            key,
        })
    }

    fn entry_path(&self, tag: &str, class: KeyClass) -> PathBuf {
        let digest = Sha256::digest(tag.as_bytes());
        self.dir
            .join(format!("{}.{}", hex::encode(digest), class.as_str()))
    }
}

fn entry_aad(tag: &str, class: KeyClass) -> Vec<u8> {
    format!("{}|{}", tag, class).into_bytes()
}

fn initialize(header_path: &Path, passphrase: &[u8], log_n: u8) -> Result<SymmetricKey> {
    let salt = secretcrypt::random_bytes::<SALT_LEN>();
    let key = secretcrypt::derive_vault_key(passphrase, &salt, log_n)?;

    let nonce = secretcrypt::random_bytes::<IV_LEN>();
    let mut check = nonce[..GCM_NONCE_LEN].to_vec();
    check.extend(secretcrypt::seal(
        &key,
        &nonce,
        CHECK_PLAINTEXT,
        HEADER_FILE.as_bytes(),
    )?);

    let header = VaultHeader {
        version: HEADER_VERSION,
        kdf: "scrypt".to_string(),
        salt: hex::encode(salt),
        log_n,
        check: hex::encode(check),
    };
    let json = serde_json::to_vec_pretty(&header).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "failed to serialize vault header",
            e,
        )
    })?;
    file_ops::write_atomic(header_path, &json)?;
    Ok(key)
}

fn unlock(header_bytes: &[u8], passphrase: &[u8]) -> Result<SymmetricKey> {
    let header: VaultHeader = serde_json::from_slice(header_bytes).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "vault header is corrupt",
            e,
        )
    })?;
    if header.version != HEADER_VERSION || header.kdf != "scrypt" {
        return Err(EndcryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::Io,
            format!(
                "unsupported vault format (version {}, kdf {})",
                header.version, header.kdf
            ),
        ));
    }

    let salt = decode_header_hex(&header.salt, "salt")?;
    let check = decode_header_hex(&header.check, "check")?;
    if check.len() < GCM_NONCE_LEN {
        return Err(EndcryptError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "vault header check value is truncated",
        ));
    }

    let key = secretcrypt::derive_vault_key(passphrase, &salt, header.log_n)?;
    let (nonce, sealed) = check.split_at(GCM_NONCE_LEN);
    secretcrypt::open(&key, nonce, sealed, HEADER_FILE.as_bytes())
        .map_err(|e| e.with_context("vault passphrase rejected"))?;
    Ok(key)
}

fn decode_header_hex(value: &str, field: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("vault header field {} is not hex", field),
            e,
        )
    })
}

impl KeyVault for FileVault {
    fn put(&self, tag: &str, class: KeyClass, key_bits: usize, der: &[u8]) -> Result<()> {
        let record = VaultRecord {
            key_type: KEY_TYPE_RSA.to_string(),
            key_size_bits: key_bits,
            class,
            der: hex::encode(der),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&record).map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "failed to serialize vault entry",
                e,
            )
        })?);
        let mut der_hex = record.der;
        zeroize::Zeroize::zeroize(&mut der_hex);

        let nonce = secretcrypt::random_bytes::<IV_LEN>();
        let mut contents = nonce[..GCM_NONCE_LEN].to_vec();
        contents.extend(secretcrypt::seal(
            &self.key,
            &nonce,
            &plaintext,
            &entry_aad(tag, class),
        )?);

        file_ops::write_atomic(&self.entry_path(tag, class), &contents)?;
        tracing::debug!(tag, %class, key_bits, "stored vault entry");
        Ok(())
    }

    fn get(&self, tag: &str, class: KeyClass) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let path = self.entry_path(tag, class);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(format!("failed to read {}", path.display()), e)),
        };
        if contents.len() < GCM_NONCE_LEN {
            return Err(EndcryptError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("vault entry {} is truncated", path.display()),
            ));
        }

        let (nonce, sealed) = contents.split_at(GCM_NONCE_LEN);
        let plaintext = Zeroizing::new(
            secretcrypt::open(&self.key, nonce, sealed, &entry_aad(tag, class))
                .map_err(|e| e.with_context(format!("vault entry {} failed to open", path.display())))?,
        );
        let mut record: VaultRecord = serde_json::from_slice(&plaintext).map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "vault entry is corrupt",
                e,
            )
        })?;
        let der = hex::decode(&record.der).map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "vault entry is corrupt",
                e,
            )
        });
        zeroize::Zeroize::zeroize(&mut record.der);
        Ok(Some(Zeroizing::new(der?)))
    }

    fn delete(&self, tag: &str, class: KeyClass) -> Result<bool> {
        let path = self.entry_path(tag, class);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(tag, %class, "deleted vault entry");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(format!("failed to delete {}", path.display()), e)),
        }
    }

    fn contains(&self, tag: &str, class: KeyClass) -> Result<bool> {
        Ok(self.entry_path(tag, class).is_file())
    }
}

fn io_error(msg: String, err: io::Error) -> EndcryptError {
    EndcryptError::with_kind_and_source(ErrorCategory::Internal, ErrorKind::Io, msg, err)
}

#[cfg(feature = "keychain")]
pub use keychain::KeyringVault;

#[cfg(feature = "keychain")]
mod keychain {
    use super::{KeyClass, KeyVault};
    use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
    use base64::{Engine, engine::general_purpose::STANDARD};
    use zeroize::Zeroizing;

    /// Platform keychain vault (macOS Keychain, Secret Service, Windows
    /// Credential Manager).
    ///
    /// The keychain carries no key attributes of its own, so only the DER
    /// bytes are stored, base64 encoded.
    pub struct KeyringVault {
        service: String,
    }

    impl KeyringVault {
        pub fn new(service: impl Into<String>) -> Self {
            Self {
                service: service.into(),
            }
        }

        fn entry(&self, tag: &str, class: KeyClass) -> Result<keyring::Entry> {
            keyring::Entry::new(&self.service, &format!("{}:{}", tag, class))
                .map_err(|e| keychain_error("keychain entry creation failed", e))
        }
    }

    impl KeyVault for KeyringVault {
        fn put(&self, tag: &str, class: KeyClass, key_bits: usize, der: &[u8]) -> Result<()> {
            let encoded = Zeroizing::new(STANDARD.encode(der));
            self.entry(tag, class)?
                .set_password(&encoded)
                .map_err(|e| keychain_error(format!("keychain store for '{}' failed", tag), e))?;
            tracing::debug!(tag, %class, key_bits, "stored secret in platform keychain");
            Ok(())
        }

        fn get(&self, tag: &str, class: KeyClass) -> Result<Option<Zeroizing<Vec<u8>>>> {
            match self.entry(tag, class)?.get_password() {
                Ok(encoded) => {
                    let encoded = Zeroizing::new(encoded);
                    let der = STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                        EndcryptError::with_kind_and_source(
                            ErrorCategory::Internal,
                            ErrorKind::Io,
                            format!("keychain entry for '{}' is corrupt", tag),
                            e,
                        )
                    })?;
                    Ok(Some(Zeroizing::new(der)))
                }
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(keychain_error(format!("keychain get for '{}' failed", tag), e)),
            }
        }

        fn delete(&self, tag: &str, class: KeyClass) -> Result<bool> {
            match self.entry(tag, class)?.delete_credential() {
                Ok(()) => {
                    tracing::debug!(tag, %class, "deleted secret from platform keychain");
                    Ok(true)
                }
                Err(keyring::Error::NoEntry) => Ok(false),
                Err(e) => Err(keychain_error(format!("keychain delete for '{}' failed", tag), e)),
            }
        }
    }

    fn keychain_error(msg: impl Into<String>, err: keyring::Error) -> EndcryptError {
        EndcryptError::with_kind_and_source(ErrorCategory::Internal, ErrorKind::Io, msg, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Cheap scrypt cost; production uses the configured value.
    const TEST_LOG_N: u8 = 10;

    #[test]
    fn test_put_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let vault = FileVault::open(temp_dir.path(), b"vault pass", TEST_LOG_N).unwrap();

        assert!(vault.get("com.endcrypt.alice", KeyClass::Public).unwrap().is_none());
        vault
            .put("com.endcrypt.alice", KeyClass::Public, 2048, b"public der")
            .unwrap();

        let der = vault.get("com.endcrypt.alice", KeyClass::Public).unwrap().unwrap();
        assert_eq!(&*der, b"public der");
        assert!(vault.contains("com.endcrypt.alice", KeyClass::Public).unwrap());
        assert!(!vault.contains("com.endcrypt.alice", KeyClass::Private).unwrap());

        assert!(vault.delete("com.endcrypt.alice", KeyClass::Public).unwrap());
        assert!(!vault.delete("com.endcrypt.alice", KeyClass::Public).unwrap());
        assert!(vault.get("com.endcrypt.alice", KeyClass::Public).unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let vault = FileVault::open(temp_dir.path(), b"vault pass", TEST_LOG_N).unwrap();
            vault
                .put("com.endcrypt.bob", KeyClass::Private, 2048, b"private der")
                .unwrap();
        }

        let vault = FileVault::open(temp_dir.path(), b"vault pass", TEST_LOG_N).unwrap();
        let der = vault.get("com.endcrypt.bob", KeyClass::Private).unwrap().unwrap();
        assert_eq!(&*der, b"private der");
    }

    #[test]
    fn test_wrong_vault_passphrase() {
        let temp_dir = TempDir::new().unwrap();
        FileVault::open(temp_dir.path(), b"vault pass", TEST_LOG_N).unwrap();

        let err = FileVault::open(temp_dir.path(), b"not it", TEST_LOG_N)
            .err()
            .expect("expected wrong passphrase to be rejected");
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
    }

    #[test]
    fn test_entries_do_not_reveal_alias_or_key() {
        let temp_dir = TempDir::new().unwrap();
        let vault = FileVault::open(temp_dir.path(), b"vault pass", TEST_LOG_N).unwrap();
        vault
            .put("com.endcrypt.carol", KeyClass::Public, 2048, b"VISIBLE-DER-BYTES")
            .unwrap();

        for entry in fs::read_dir(temp_dir.path()).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(!name.contains("carol"), "alias leaked in {}", name);
            let contents = fs::read(entry.path()).unwrap();
            assert!(
                !contents
                    .windows(b"VISIBLE".len())
                    .any(|w| w == b"VISIBLE"),
                "key bytes leaked in {}",
                name
            );
        }
    }

    #[test]
    fn test_entry_bound_to_tag() {
        let temp_dir = TempDir::new().unwrap();
        let vault = FileVault::open(temp_dir.path(), b"vault pass", TEST_LOG_N).unwrap();
        vault.put("com.endcrypt.a", KeyClass::Public, 2048, b"a").unwrap();

        // Move a's entry into b's slot; it must not open as b.
        fs::rename(
            vault.entry_path("com.endcrypt.a", KeyClass::Public),
            vault.entry_path("com.endcrypt.b", KeyClass::Public),
        )
        .unwrap();
        let err = vault
            .get("com.endcrypt.b", KeyClass::Public)
            .expect_err("expected tag-bound entry to fail");
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
    }

    #[test]
    #[cfg(unix)]
    fn test_entry_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let vault_dir = temp_dir.path().join("vault");
        let vault = FileVault::open(&vault_dir, b"vault pass", TEST_LOG_N).unwrap();
        vault.put("com.endcrypt.d", KeyClass::Private, 2048, b"d").unwrap();

        let entry = vault.entry_path("com.endcrypt.d", KeyClass::Private);
        let mode = fs::metadata(entry).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = fs::metadata(&vault_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    // Needs an unlocked platform keychain; run with
    // `cargo test --features keychain -- --ignored`.
    #[test]
    #[cfg(feature = "keychain")]
    #[ignore]
    fn test_keyring_entry_survives_new_handle() {
        let service = format!("com.endcrypt.test.{}", std::process::id());
        let tag = "com.endcrypt.test.persist";

        KeyringVault::new(service.clone())
            .put(tag, KeyClass::Public, 2048, b"public der")
            .unwrap();

        let reopened = KeyringVault::new(service);
        let der = reopened.get(tag, KeyClass::Public).unwrap();
        assert_eq!(der.as_deref().map(Vec::as_slice), Some(&b"public der"[..]));
        assert!(reopened.delete(tag, KeyClass::Public).unwrap());
        assert!(reopened.get(tag, KeyClass::Public).unwrap().is_none());
    }
}
