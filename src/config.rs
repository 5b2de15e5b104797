use crate::encrypt::Recovery;
use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use crate::keycodec;
use crate::keystore::DEFAULT_NAMESPACE;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Name of the config file looked up inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Default scrypt cost (log2 N) for the file vault.
pub const DEFAULT_VAULT_LOG_N: u8 = 15;

const MIN_VAULT_LOG_N: u8 = 10;
const MAX_VAULT_LOG_N: u8 = 22;

/// endcrypt configuration (loaded from config.toml)
///
/// Every path may be relative, in which case it resolves against the data
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of all state; not read from the file itself.
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Vault tag prefix (default: com.endcrypt)
    pub namespace: String,
    /// Encrypted key vault directory (default: <data_dir>/vault)
    pub vault_dir: Option<PathBuf>,
    /// Key metadata file (default: <data_dir>/keys.json)
    pub metadata_path: Option<PathBuf>,
    /// Public keys kept as plain PEM files (default: <data_dir>/pem)
    pub pem_dir: Option<PathBuf>,
    /// Default destination of produced files (default: <data_dir>/out)
    pub output_dir: Option<PathBuf>,
    /// scrypt cost of the vault passphrase
    pub vault_scrypt_log_n: u8,
    pub recovery: RecoveryConfig,
}

/// Escrow settings. Leaving a field out disables that half of escrow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    /// PEM of the recovery recipient for public-key envelopes
    pub public_key_path: Option<PathBuf>,
    /// Environment variable holding the administrative recovery passphrase
    pub admin_passphrase_env: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            vault_dir: None,
            metadata_path: None,
            pem_dir: None,
            output_dir: None,
            vault_scrypt_log_n: DEFAULT_VAULT_LOG_N,
            recovery: RecoveryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration for `data_dir`.
    ///
    /// `explicit` must exist when given. Otherwise `<data_dir>/config.toml`
    /// is used if present and defaults apply if not.
    pub fn load(data_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_dir.join(CONFIG_FILE));

        let mut config = match fs::read_to_string(&path) {
            Ok(content) => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::parse(&content).map_err(|e| {
                    e.with_context(format!("invalid config {}", path.display()))
                })?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && explicit.is_none() => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(EndcryptError::with_kind_and_source(
                    ErrorCategory::User,
                    ErrorKind::Config,
                    format!("failed to read config {}", path.display()),
                    e,
                ));
            }
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    /// Parse and validate TOML text. `data_dir` is left empty.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::Config,
                format!("config is not valid: {}", e),
                e,
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(config_error("namespace must not be empty"));
        }
        if !(MIN_VAULT_LOG_N..=MAX_VAULT_LOG_N).contains(&self.vault_scrypt_log_n) {
            return Err(config_error(format!(
                "vault_scrypt_log_n must be between {} and {}",
                MIN_VAULT_LOG_N, MAX_VAULT_LOG_N
            )));
        }
        Ok(())
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.resolve(self.vault_dir.as_deref(), "vault")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.resolve(self.metadata_path.as_deref(), "keys.json")
    }

    pub fn pem_dir(&self) -> PathBuf {
        self.resolve(self.pem_dir.as_deref(), "pem")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.resolve(self.output_dir.as_deref(), "out")
    }

    fn resolve(&self, configured: Option<&Path>, default: &str) -> PathBuf {
        match configured {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.data_dir.join(path),
            None => self.data_dir.join(default),
        }
    }

    /// Build the escrow recipients this configuration asks for.
    ///
    /// Every configured recipient must be usable: an unreadable recovery key
    /// or an unset admin passphrase variable is a `Config` error.
    pub fn recovery(&self) -> Result<Recovery> {
        let mut recovery = Recovery::none();
        if let Some(path) = &self.recovery.public_key_path {
            let path = self.resolve(Some(path), "");
            let pem = fs::read_to_string(&path).map_err(|e| {
                EndcryptError::with_kind_and_source(
                    ErrorCategory::User,
                    ErrorKind::Config,
                    format!("failed to read recovery key {}", path.display()),
                    e,
                )
            })?;
            let key = keycodec::public_key_from_pem(&pem)
                .map_err(|e| e.with_context(format!("invalid recovery key {}", path.display())))?;
            recovery = recovery.with_public_key(key);
        }
        if let Some(var) = &self.recovery.admin_passphrase_env {
            let passphrase = self.admin_passphrase()?.ok_or_else(|| {
                config_error(format!(
                    "recovery.admin_passphrase_env names {} but it is unset or empty",
                    var
                ))
            })?;
            recovery = recovery.with_admin_passphrase(passphrase);
        }
        Ok(recovery)
    }

    /// The administrative recovery passphrase, if configured and set.
    pub fn admin_passphrase(&self) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let Some(var) = &self.recovery.admin_passphrase_env else {
            return Ok(None);
        };
        Ok(env::var_os(var)
            .filter(|value| !value.is_empty())
            .map(|value| Zeroizing::new(value.to_string_lossy().into_owned().into_bytes())))
    }
}

/// The data directory when none is given: `$HOME/.endcrypt`.
pub fn default_data_dir() -> Result<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(".endcrypt"))
        .ok_or_else(|| config_error("cannot determine home directory; pass --home"))
}

fn config_error(msg: impl Into<String>) -> EndcryptError {
    EndcryptError::with_kind(ErrorCategory::User, ErrorKind::Config, msg)
}
