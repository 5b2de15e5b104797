//! File-level operations
//!
//! Inputs are read once and outputs written once. Everything written is
//! created with mode 0o600 on Unix. Decrypted files and default output names
//! never overwrite: a ` (n)` suffix is added instead.

use crate::container;
use crate::decrypt::Decrypted;
use crate::encrypt::{Encryptor, Method};
use crate::envelope;
use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Suffix of default encrypted output names.
pub const ENCRYPTED_SUFFIX: &str = "_Cif.json";

/// Give up looking for a free ` (n)` name after this many attempts.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Where a decrypted file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedFile {
    pub name: String,
    pub path: PathBuf,
    pub decrypted_at: DateTime<Utc>,
}

/// Encrypt a file
///
/// Reads plaintext from `input_path`, seals it with `method` and writes the
/// envelope JSON to `output_path`.
pub fn encrypt_file(
    input_path: &Path,
    output_path: &Path,
    encryptor: &Encryptor<'_>,
    method: &Method,
) -> Result<()> {
    let plaintext = read_input(input_path)?;
    let filename = input_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let envelope = encryptor
        .encrypt(&plaintext, filename, method)
        .map_err(|e| e.with_context("encryption failed"))?;
    write_file_secure(output_path, &envelope.to_json()?)
        .map_err(|e| e.with_context(format!("failed to write to {}", output_path.display())))?;
    tracing::info!(
        input = %input_path.display(),
        output = %output_path.display(),
        kind = %envelope.kind(),
        "encrypted file"
    );
    Ok(())
}

/// Write recovered plaintext into `output_dir` under its original name.
pub fn write_decrypted(output_dir: &Path, decrypted: &Decrypted) -> Result<DecryptedFile> {
    create_private_dir(output_dir)?;
    let path = write_new_file(output_dir, &decrypted.file_name, &decrypted.plaintext)?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| decrypted.file_name.clone());
    tracing::info!(path = %path.display(), "wrote decrypted file");
    Ok(DecryptedFile {
        name,
        path,
        decrypted_at: Utc::now(),
    })
}

/// Hide the envelope at `envelope_path` inside the carrier at `carrier_path`.
///
/// Image carriers are converted to PDF first. With no `output_path`, the
/// result goes to `default_dir` under the share-safe carrier name.
pub fn hide_file(
    envelope_path: &Path,
    carrier_path: &Path,
    output_path: Option<&Path>,
    default_dir: &Path,
) -> Result<PathBuf> {
    let envelope_bytes = read_input(envelope_path)?;
    if envelope::detect_method(&envelope_bytes).is_none() {
        return Err(EndcryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::MalformedEnvelope,
            format!("{} is not an envelope", envelope_path.display()),
        ));
    }
    if container::contains_delimiter(&envelope_bytes) {
        return Err(EndcryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::MalformedEnvelope,
            format!("{} is already hidden in a carrier", envelope_path.display()),
        ));
    }

    let carrier_bytes = read_input(carrier_path)?;
    let carrier_name = carrier_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("carrier");
    let hidden = container::embed_in_carrier(&envelope_bytes, carrier_name, carrier_bytes)?;

    let path = match output_path {
        Some(path) => {
            write_file_secure(path, &hidden.bytes)?;
            path.to_path_buf()
        }
        None => {
            create_private_dir(default_dir)?;
            write_new_file(default_dir, &share_safe_name(&hidden.name), &hidden.bytes)?
        }
    };
    tracing::info!(carrier = carrier_name, output = %path.display(), "hid envelope in carrier");
    Ok(path)
}

/// Pull the envelope out of a container and write it to `output_path`.
pub fn extract_file(input_path: &Path, output_path: &Path) -> Result<()> {
    let combined = read_input(input_path)?;
    let (carrier, envelope) = container::extract(&combined)
        .map_err(|e| e.with_context(format!("no hidden envelope in {}", input_path.display())))?;
    write_file_secure(output_path, envelope)?;
    tracing::info!(
        carrier_bytes = carrier.len(),
        envelope_bytes = envelope.len(),
        output = %output_path.display(),
        "extracted envelope"
    );
    Ok(())
}

/// Default name of the envelope produced from `input_name`: `<stem>_Cif.json`.
pub fn encrypted_file_name(input_name: &Path) -> String {
    let stem = input_name
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    share_safe_name(&format!("{}{}", stem, ENCRYPTED_SUFFIX))
}

/// File name safe to hand to share targets: spaces become `_`, parentheses
/// are dropped.
pub fn share_safe_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '(' && *c != ')')
        .map(|c| if c == ' ' { '_' } else { c })
        .collect()
}

pub fn read_input(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| read_error(path, e))
}

/// Create `dir` (and parents) if missing, mode 0o700 on Unix.
pub fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("failed to create directory {}", dir.display()),
            e,
        )
    })
}

/// Create `dir/name` without overwriting, trying `stem (1).ext`,
/// `stem (2).ext`, ... on collision. Returns the path written.
pub fn write_new_file(dir: &Path, name: &str, contents: &[u8]) -> Result<PathBuf> {
    let name_path = Path::new(name);
    let stem = name_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = name_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{} ({}){}", stem, attempt, ext))
        };
        match create_new_secure(&candidate) {
            Ok(mut file) => {
                file.write_all(contents).map_err(|e| {
                    EndcryptError::with_kind_and_source(
                        ErrorCategory::Internal,
                        ErrorKind::Io,
                        format!("failed to write {}", candidate.display()),
                        e,
                    )
                })?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(EndcryptError::with_kind_and_source(
                    ErrorCategory::User,
                    ErrorKind::Io,
                    format!("failed to create {}", candidate.display()),
                    e,
                ));
            }
        }
    }
    Err(EndcryptError::with_kind(
        ErrorCategory::User,
        ErrorKind::Io,
        format!("no free file name for {} in {}", name, dir.display()),
    ))
}

fn create_new_secure(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Replace `path` atomically (tempfile + fsync + rename), mode 0o600.
///
/// Either the old or the new contents exist afterwards, never a partial
/// file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        Some(_) => Path::new("."),
        None => {
            return Err(EndcryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::Io,
                format!("{} has no parent directory", path.display()),
            ));
        }
    };
    let mut temp_file = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to create tempfile",
            e,
        )
    })?;

    temp_file.write_all(contents).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to write to tempfile",
            e,
        )
    })?;
    // Flush and fsync() such that the rename later, if it succeeds, will
    // always point to a valid file.
    temp_file.flush().map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to flush tempfile",
            e,
        )
    })?;
    temp_file.as_file().sync_all().map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to sync file prior to rename",
            e,
        )
    })?;

    // NamedTempFile is already created 0o600 on Unix; make it explicit.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp_file
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| {
                EndcryptError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to set tempfile permissions",
                    e,
                )
            })?;
    }
    temp_file.persist(path).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("failed to rename to target file {}", path.display()),
            e,
        )
    })?;
    Ok(())
}

/// Write file with secure permissions (0o600 on Unix)
pub fn write_file_secure(path: &Path, contents: &[u8]) -> Result<()> {
    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| {
                EndcryptError::with_kind_and_source(
                    ErrorCategory::User,
                    ErrorKind::Io,
                    format!("failed to open {}", path.display()),
                    e,
                )
            })?;

        file.write_all(contents).map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("failed to write {}", path.display()),
                e,
            )
        })?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        fs::write(path, contents).map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::Io,
                format!("failed to write {}", path.display()),
                e,
            )
        })?;
        Ok(())
    }
}

pub(crate) fn read_error(path: &Path, err: io::Error) -> EndcryptError {
    let category = if err.kind() == io::ErrorKind::NotFound {
        ErrorCategory::User
    } else {
        ErrorCategory::Internal
    };
    EndcryptError::with_kind_and_source(
        category,
        ErrorKind::Io,
        format!("failed to read from {}", path.display()),
        err,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decrypt::{self, Secret};
    use crate::encrypt::Recovery;
    use crate::keystore::{DEFAULT_NAMESPACE, KeyStore};
    use crate::vault::FileVault;
    use tempfile::TempDir;
    use zeroize::Zeroizing;

    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    fn empty_store(dir: &Path) -> KeyStore {
        let vault = FileVault::open(&dir.join("vault"), b"vault pass", 10).unwrap();
        KeyStore::open(Box::new(vault), DEFAULT_NAMESPACE, dir.join("keys.json")).unwrap()
    }

    fn password(s: &str) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(s.as_bytes().to_vec())
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = empty_store(temp_dir.path());
        let encryptor = Encryptor::new(Recovery::none()).with_keys(&store);

        let plain_path = temp_dir.path().join("plain.txt");
        let crypt_path = temp_dir.path().join(encrypted_file_name(&plain_path));
        fs::write(&plain_path, b"Hello, endcrypt!").unwrap();

        encrypt_file(
            &plain_path,
            &crypt_path,
            &encryptor,
            &Method::Password(password("test password")),
        )
        .unwrap();
        assert!(crypt_path.ends_with("plain_Cif.json"));

        let bytes = read_input(&crypt_path).unwrap();
        let decrypted =
            decrypt::open(&bytes, Some(&Secret::Passphrase(password("test password")))).unwrap();
        let out_dir = temp_dir.path().join("out");
        let written = write_decrypted(&out_dir, &decrypted).unwrap();
        assert_eq!(written.name, "plain.txt");
        assert_eq!(fs::read(&written.path).unwrap(), b"Hello, endcrypt!");
    }

    #[test]
    fn test_decrypted_names_never_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let decrypted = Decrypted {
            kind: envelope::EnvelopeKind::Password,
            file_name: "report.pdf".to_string(),
            plaintext: Zeroizing::new(b"v".to_vec()),
        };

        let first = write_decrypted(temp_dir.path(), &decrypted).unwrap();
        let second = write_decrypted(temp_dir.path(), &decrypted).unwrap();
        let third = write_decrypted(temp_dir.path(), &decrypted).unwrap();
        assert_eq!(first.name, "report.pdf");
        assert_eq!(second.name, "report (1).pdf");
        assert_eq!(third.name, "report (2).pdf");
    }

    #[test]
    #[cfg(unix)]
    fn test_file_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let store = empty_store(temp_dir.path());
        let encryptor = Encryptor::new(Recovery::none()).with_keys(&store);
        let plain_path = temp_dir.path().join("plain.txt");
        let crypt_path = temp_dir.path().join("crypt.json");
        fs::write(&plain_path, b"test").unwrap();

        encrypt_file(&plain_path, &crypt_path, &encryptor, &Method::Password(password("pw")))
            .unwrap();
        let mode = fs::metadata(&crypt_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let written = write_new_file(temp_dir.path(), "new.bin", b"x").unwrap();
        let mode = fs::metadata(&written).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let atomic = temp_dir.path().join("atomic.json");
        write_atomic(&atomic, b"[]").unwrap();
        let mode = fs::metadata(&atomic).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_write_atomic_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys.json");
        write_atomic(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_encrypt_missing_recipient() {
        let temp_dir = TempDir::new().unwrap();
        let store = empty_store(temp_dir.path());
        let encryptor = Encryptor::new(Recovery::none()).with_keys(&store);
        let plain_path = temp_dir.path().join("plain.txt");
        let crypt_path = temp_dir.path().join("crypt.json");
        fs::write(&plain_path, b"test").unwrap();

        let err = encrypt_file(
            &plain_path,
            &crypt_path,
            &encryptor,
            &Method::PublicKey("nobody".to_string()),
        )
        .expect_err("expected missing recipient");
        assert_eq!(err.kind, Some(ErrorKind::KeyNotFound));
        assert!(!crypt_path.exists());
    }

    #[test]
    fn test_hide_and_extract() {
        let temp_dir = TempDir::new().unwrap();
        let store = empty_store(temp_dir.path());
        let encryptor = Encryptor::new(Recovery::none()).with_keys(&store);

        let plain_path = temp_dir.path().join("plain.txt");
        let envelope_path = temp_dir.path().join("plain_Cif.json");
        let carrier_path = temp_dir.path().join("my report (final).pdf");
        fs::write(&plain_path, b"hidden text").unwrap();
        fs::write(&carrier_path, b"%PDF-1.7 carrier").unwrap();
        encrypt_file(&plain_path, &envelope_path, &encryptor, &Method::Password(password("pw")))
            .unwrap();

        let out_dir = temp_dir.path().join("out");
        let hidden = hide_file(&envelope_path, &carrier_path, None, &out_dir).unwrap();
        assert!(hidden.ends_with("my_report_final.pdf"));
        assert!(fs::read(&hidden).unwrap().starts_with(b"%PDF-1.7 carrier"));

        let extracted = temp_dir.path().join("extracted.json");
        extract_file(&hidden, &extracted).unwrap();
        assert_eq!(fs::read(&extracted).unwrap(), fs::read(&envelope_path).unwrap());

        let err = hide_file(&carrier_path, &carrier_path, None, &out_dir)
            .expect_err("expected non-envelope rejection");
        assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope));

        let err = extract_file(&carrier_path, &extracted).expect_err("expected no delimiter");
        assert_eq!(err.kind, Some(ErrorKind::DelimiterNotFound));
    }

    #[test]
    fn test_share_safe_name() {
        assert_eq!(share_safe_name("my file (1).pdf"), "my_file_1.pdf");
        assert_eq!(share_safe_name("plain.txt"), "plain.txt");
        assert_eq!(encrypted_file_name(Path::new("/x/Tax Return (2024).pdf")), "Tax_Return_2024_Cif.json");
    }

    #[test]
    fn test_read_missing_is_user_error() {
        let err = read_input(Path::new("/nonexistent/endcrypt/input")).expect_err("missing");
        assert_eq!(err.kind, Some(ErrorKind::Io));
        assert_eq!(err.category, ErrorCategory::User);
    }
}
