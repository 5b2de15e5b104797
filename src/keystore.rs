//! Named RSA keypairs: generation, import, export, deletion and availability
//!
//! The vault is the source of truth for whether a key half exists. The
//! metadata file only remembers aliases, creation times and whether a key was
//! imported, and is rewritten after every change on a best-effort basis.

use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use crate::file_ops;
use crate::keycodec::{self, PemKind};
use crate::vault::{KeyClass, KeyVault};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Modulus size of generated keypairs.
pub const KEY_BITS: usize = 2048;

/// Default vault tag prefix.
pub const DEFAULT_NAMESPACE: &str = "com.endcrypt";

/// A named keypair as seen by callers.
///
/// `has_public` and `has_private` are read from the vault when the value is
/// built and are not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub alias: String,
    pub created_at: DateTime<Utc>,
    pub is_imported: bool,
    pub has_public: bool,
    pub has_private: bool,
}

/// Which half (or halves) of a keypair an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHalf {
    Public,
    Private,
    Both,
}

impl KeyHalf {
    fn classes(self) -> &'static [KeyClass] {
        match self {
            KeyHalf::Public => &[KeyClass::Public],
            KeyHalf::Private => &[KeyClass::Private],
            KeyHalf::Both => &[KeyClass::Public, KeyClass::Private],
        }
    }
}

impl From<KeyClass> for KeyHalf {
    fn from(class: KeyClass) -> Self {
        match class {
            KeyClass::Public => KeyHalf::Public,
            KeyClass::Private => KeyHalf::Private,
        }
    }
}

/// An exported key half and the file name it is conventionally saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedKey {
    pub file_name: String,
    pub pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRecord {
    alias: String,
    created_at: DateTime<Utc>,
    is_imported: bool,
}

/// Owner of vault access and key metadata.
///
/// Construct one per process and pass it by reference. Mutations of the same
/// alias must be serialized by the caller.
pub struct KeyStore {
    vault: Box<dyn KeyVault>,
    namespace: String,
    metadata_path: PathBuf,
    pem_dir: Option<PathBuf>,
    records: Vec<KeyRecord>,
}

impl KeyStore {
    /// Open a key store over `vault`, loading metadata from `metadata_path`.
    ///
    /// A missing metadata file is an empty store. A metadata file that
    /// cannot be parsed is an error rather than silently discarded.
    pub fn open(
        vault: Box<dyn KeyVault>,
        namespace: impl Into<String>,
        metadata_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let metadata_path = metadata_path.into();
        let records = load_records(&metadata_path)?;
        tracing::debug!(
            path = %metadata_path.display(),
            count = records.len(),
            "loaded key metadata"
        );
        Ok(Self {
            vault,
            namespace: namespace.into(),
            metadata_path,
            pem_dir: None,
            records,
        })
    }

    /// Also resolve public keys from `<dir>/<alias>.pem` files.
    pub fn with_pem_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pem_dir = Some(dir.into());
        self
    }

    /// Vault tag for an alias: `<namespace>.<alias>`.
    pub fn tag(&self, alias: &str) -> String {
        format!("{}.{}", self.namespace, alias)
    }

    /// Generate a fresh RSA-2048 keypair under `alias`.
    pub fn generate(&mut self, alias: &str) -> Result<KeyPair> {
        validate_alias(alias)?;
        let (has_public, has_private) = self.availability(alias)?;
        if has_public || has_private {
            return Err(EndcryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::DuplicateAlias,
                format!("a key named '{}' already exists", alias),
            ));
        }

        let private = RsaPrivateKey::new(&mut OsRng, KEY_BITS).map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::KeyGeneration,
                "RSA key generation failed",
                e,
            )
        })?;
        let public = RsaPublicKey::from(&private);

        let private_der = private.to_pkcs1_der().map_err(|e| {
            EndcryptError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::KeyGeneration,
                format!("failed to encode private key: {}", e),
            )
        })?;
        let public_der = public.to_public_key_der().map_err(|e| {
            EndcryptError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::KeyGeneration,
                format!("failed to encode public key: {}", e),
            )
        })?;

        let tag = self.tag(alias);
        self.vault
            .put(&tag, KeyClass::Private, KEY_BITS, private_der.as_bytes())?;
        if let Err(e) = self
            .vault
            .put(&tag, KeyClass::Public, KEY_BITS, public_der.as_bytes())
        {
            // Leave nothing half-generated behind.
            if let Err(cleanup) = self.vault.delete(&tag, KeyClass::Private) {
                tracing::warn!(alias, error = %cleanup, "failed to remove orphaned private key");
            }
            return Err(e);
        }

        let record = self.upsert_record(alias, false);
        self.save();
        tracing::info!(alias, bits = KEY_BITS, "generated keypair");
        Ok(KeyPair {
            alias: record.alias,
            created_at: record.created_at,
            is_imported: record.is_imported,
            has_public: true,
            has_private: true,
        })
    }

    /// Import one key half from PEM text.
    ///
    /// The PEM is classified by its markers. When `expected` is given, a PEM
    /// of the other class is rejected. PKCS#1 public keys are rewrapped as
    /// SubjectPublicKeyInfo before storage. An existing alias gains the new
    /// half instead of getting a second entry.
    pub fn import_pem(
        &mut self,
        alias: &str,
        pem: &str,
        expected: Option<KeyClass>,
    ) -> Result<KeyPair> {
        validate_alias(alias)?;
        let class = match keycodec::classify(pem) {
            PemKind::Public => KeyClass::Public,
            PemKind::Private => KeyClass::Private,
            PemKind::Unknown => {
                return Err(EndcryptError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::UnrecognizedKeyFormat,
                    "PEM is neither an RSA public nor an RSA private key",
                ));
            }
        };
        if let Some(expected) = expected {
            if expected != class {
                return Err(EndcryptError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::UnrecognizedKeyFormat,
                    format!("expected a {} key but the PEM holds a {} key", expected, class),
                ));
            }
        }

        let mut der = keycodec::pem_to_der(pem)?;
        let key_bits = match class {
            KeyClass::Public => {
                if keycodec::is_pkcs1_public(pem) {
                    der = keycodec::pkcs1_to_pkcs8(&der);
                }
                keycodec::public_key_from_der(&der)?.size() * 8
            }
            KeyClass::Private => keycodec::private_key_from_der(&der)?.size() * 8,
        };

        let tag = self.tag(alias);
        self.vault.put(&tag, class, key_bits, &der)?;
        let record = self.upsert_record(alias, true);
        self.save();

        let (has_public, has_private) = self.availability(alias)?;
        tracing::info!(alias, %class, key_bits, "imported key");
        Ok(KeyPair {
            alias: record.alias,
            created_at: record.created_at,
            is_imported: record.is_imported,
            has_public,
            has_private,
        })
    }

    /// Remove the requested half (or halves) of `alias`.
    ///
    /// Returns whether anything was removed; a missing key is not an error.
    /// Metadata is dropped once neither half remains in the vault.
    pub fn delete(&mut self, alias: &str, half: KeyHalf) -> Result<bool> {
        let tag = self.tag(alias);
        let mut deleted = false;
        for class in half.classes() {
            if self.vault.delete(&tag, *class)? {
                tracing::info!(alias, %class, "deleted key");
                deleted = true;
            }
        }

        let (has_public, has_private) = self.availability(alias)?;
        if !has_public && !has_private {
            let before = self.records.len();
            self.records.retain(|r| r.alias != alias);
            if self.records.len() != before {
                tracing::debug!(alias, "pruned key metadata");
                self.save();
            }
        }
        Ok(deleted)
    }

    /// Export one key half as PEM.
    ///
    /// Public keys always export as SubjectPublicKeyInfo (`PUBLIC KEY`),
    /// private keys as PKCS#1 (`RSA PRIVATE KEY`).
    pub fn export(&self, alias: &str, class: KeyClass) -> Result<ExportedKey> {
        let der = self.require(alias, class)?;
        let pem = match class {
            KeyClass::Public => {
                keycodec::der_to_pem(&normalize_public(&der), keycodec::PUBLIC_KEY_LABEL)
            }
            KeyClass::Private => keycodec::der_to_pem(&der, keycodec::RSA_PRIVATE_KEY_LABEL),
        };
        Ok(ExportedKey {
            file_name: export_file_name(alias, class),
            pem,
        })
    }

    /// Export the public half in the legacy PKCS#1 `RSA PUBLIC KEY` form.
    pub fn export_pkcs1_public(&self, alias: &str) -> Result<ExportedKey> {
        let der = self.require(alias, KeyClass::Public)?;
        let pkcs1 = keycodec::spki_to_pkcs1(&normalize_public(&der))?;
        Ok(ExportedKey {
            file_name: export_file_name(alias, KeyClass::Public),
            pem: keycodec::der_to_pem(&pkcs1, keycodec::RSA_PUBLIC_KEY_LABEL),
        })
    }

    /// Every alias with a usable public key.
    ///
    /// Vault keys come first in metadata order, followed by public keys
    /// found only as PEM files in the PEM directory.
    pub fn list_public_keys(&self) -> Result<Vec<(String, RsaPublicKey)>> {
        let mut keys = Vec::new();
        for record in &self.records {
            if let Some(der) = self.vault.get(&self.tag(&record.alias), KeyClass::Public)? {
                match keycodec::public_key_from_der(&normalize_public(&der)) {
                    Ok(key) => keys.push((record.alias.clone(), key)),
                    Err(e) => {
                        tracing::warn!(alias = %record.alias, error = %e, "skipping unreadable public key")
                    }
                }
            }
        }

        for (alias, path) in self.pem_files()? {
            if keys.iter().any(|(known, _)| *known == alias) {
                continue;
            }
            let Some(pem) = read_public_pem(&path) else {
                continue;
            };
            match keycodec::public_key_from_pem(&pem) {
                Ok(key) => keys.push((alias, key)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed PEM file")
                }
            }
        }
        Ok(keys)
    }

    /// Which halves of `alias` the vault currently holds.
    pub fn availability(&self, alias: &str) -> Result<(bool, bool)> {
        let tag = self.tag(alias);
        Ok((
            self.vault.contains(&tag, KeyClass::Public)?,
            self.vault.contains(&tag, KeyClass::Private)?,
        ))
    }

    /// All known keypairs, newest first, with live availability.
    pub fn list(&self) -> Result<Vec<KeyPair>> {
        let mut pairs = Vec::with_capacity(self.records.len());
        for record in &self.records {
            let (has_public, has_private) = self.availability(&record.alias)?;
            pairs.push(KeyPair {
                alias: record.alias.clone(),
                created_at: record.created_at,
                is_imported: record.is_imported,
                has_public,
                has_private,
            });
        }
        pairs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pairs)
    }

    /// Metadata plus availability for a single alias.
    pub fn get(&self, alias: &str) -> Result<Option<KeyPair>> {
        let Some(record) = self.records.iter().find(|r| r.alias == alias) else {
            return Ok(None);
        };
        let (has_public, has_private) = self.availability(alias)?;
        Ok(Some(KeyPair {
            alias: record.alias.clone(),
            created_at: record.created_at,
            is_imported: record.is_imported,
            has_public,
            has_private,
        }))
    }

    /// Resolve the public key of `alias`, falling back to the PEM directory.
    ///
    /// PEM files match by the same derived alias [`KeyStore::list_public_keys`]
    /// reports, so `alice.pem` and `alice_public.pem` both resolve `alice`.
    pub fn public_key(&self, alias: &str) -> Result<RsaPublicKey> {
        if let Some(der) = self.vault.get(&self.tag(alias), KeyClass::Public)? {
            return keycodec::public_key_from_der(&normalize_public(&der));
        }
        if let Some((path, pem)) = self.pem_public(alias)? {
            tracing::debug!(alias, path = %path.display(), "resolved public key from PEM file");
            return keycodec::public_key_from_pem(&pem);
        }
        Err(key_not_found(alias, KeyClass::Public))
    }

    /// Resolve the private key of `alias` from the vault.
    pub fn private_key(&self, alias: &str) -> Result<RsaPrivateKey> {
        let der = self.require(alias, KeyClass::Private)?;
        keycodec::private_key_from_der(&der)
    }

    fn require(&self, alias: &str, class: KeyClass) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        self.vault
            .get(&self.tag(alias), class)?
            .ok_or_else(|| key_not_found(alias, class))
    }

    fn upsert_record(&mut self, alias: &str, imported: bool) -> KeyRecord {
        if let Some(record) = self.records.iter_mut().find(|r| r.alias == alias) {
            record.is_imported |= imported;
            return record.clone();
        }
        let record = KeyRecord {
            alias: alias.to_string(),
            created_at: Utc::now(),
            is_imported: imported,
        };
        self.records.push(record.clone());
        record
    }

    fn pem_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let Some(dir) = &self.pem_dir else {
            return Ok(Vec::new());
        };
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(file_ops::read_error(dir, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| file_ops::read_error(dir, e))?.path();
            let is_pem = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pem"));
            if !is_pem {
                continue;
            }
            if let Some(alias) = alias_from_pem_filename(&path) {
                files.push((alias, path));
            }
        }
        files.sort();
        Ok(files)
    }

    /// First public PEM in the PEM directory whose derived alias is `alias`.
    fn pem_public(&self, alias: &str) -> Result<Option<(PathBuf, String)>> {
        for (candidate, path) in self.pem_files()? {
            if candidate != alias {
                continue;
            }
            if let Some(pem) = read_public_pem(&path) {
                return Ok(Some((path, pem)));
            }
        }
        Ok(None)
    }

    /// Persist metadata. Failures are logged, never returned: the vault
    /// already holds the authoritative state.
    fn save(&self) {
        let json = match serde_json::to_vec_pretty(&self.records) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize key metadata");
                return;
            }
        };
        if let Some(parent) = self.metadata_path.parent() {
            if let Err(e) = file_ops::create_private_dir(parent) {
                tracing::warn!(error = %e, "failed to create key metadata directory");
                return;
            }
        }
        if let Err(e) = file_ops::write_atomic(&self.metadata_path, &json) {
            tracing::warn!(
                path = %self.metadata_path.display(),
                error = %e,
                "failed to save key metadata"
            );
        }
    }
}

/// Derive an alias from an exported PEM file name.
///
/// `alice_public.pem` and `alice_private.pem` both map to `alice`; any other
/// name maps to its file stem.
pub fn alias_from_pem_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let alias = stem
        .strip_suffix("_public")
        .or_else(|| stem.strip_suffix("_private"))
        .unwrap_or(stem);
    if alias.is_empty() {
        None
    } else {
        Some(alias.to_string())
    }
}

/// Conventional file name for an exported key half.
pub fn export_file_name(alias: &str, class: KeyClass) -> String {
    format!("{}_{}.pem", alias, class)
}

fn validate_alias(alias: &str) -> Result<()> {
    let invalid = alias.trim().is_empty()
        || alias.starts_with('.')
        || alias
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if invalid {
        return Err(EndcryptError::new(
            ErrorCategory::User,
            format!("invalid key alias '{}'", alias.escape_debug()),
        ));
    }
    Ok(())
}

fn read_public_pem(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(pem) if keycodec::classify(&pem) == PemKind::Public => Some(pem),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping unreadable PEM file");
            None
        }
    }
}

// Keychain entries written by other tools may hold bare PKCS#1.
fn normalize_public(der: &[u8]) -> Vec<u8> {
    if keycodec::spki_to_pkcs1(der).is_ok() {
        der.to_vec()
    } else {
        keycodec::pkcs1_to_pkcs8(der)
    }
}

fn key_not_found(alias: &str, class: KeyClass) -> EndcryptError {
    EndcryptError::with_kind(
        ErrorCategory::User,
        ErrorKind::KeyNotFound,
        format!("no {} key for '{}'", class, alias),
    )
}

fn load_records(path: &Path) -> Result<Vec<KeyRecord>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(file_ops::read_error(path, e)),
    };
    serde_json::from_slice(&bytes).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("key metadata {} is corrupt", path.display()),
            e,
        )
    })
}
