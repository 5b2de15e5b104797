//! endcrypt CLI - hybrid file encryption
//!
//! Encrypts files for a passphrase or a stored RSA recipient, manages the
//! key vault, and hides envelopes inside carrier files.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use endcrypt::config::{self, Config};
use endcrypt::decrypt::{self, Decryptor, RecoverySecret, Secret};
use endcrypt::encrypt::{Encryptor, Method};
use endcrypt::envelope::{self, EnvelopeKind};
use endcrypt::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use endcrypt::file_ops;
use endcrypt::keycodec;
use endcrypt::keystore::{self, KeyHalf, KeyStore};
use endcrypt::passphrase::{PassphraseReader, ReaderPassphraseReader, TerminalPassphraseReader};
use endcrypt::vault::KeyClass;
use rsa::traits::PublicKeyParts;

/// Environment variable consulted for the vault passphrase before prompting.
#[cfg(not(feature = "keychain"))]
const VAULT_PASSPHRASE_ENV: &str = "ENDCRYPT_VAULT_PASSPHRASE";

#[derive(Parser)]
#[command(name = "endcrypt")]
#[command(version)]
#[command(about = "Hybrid passphrase / RSA file encryption.", long_about = None)]
struct Cli {
    /// Data directory holding the vault, key metadata and config
    /// (default: $HOME/.endcrypt)
    #[arg(long, global = true, env = "ENDCRYPT_HOME", value_name = "DIR")]
    home: Option<PathBuf>,

    /// Config file to use instead of <home>/config.toml
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Read the file passphrase from stdin instead of from terminal
    #[arg(long, global = true)]
    passphrase_stdin: bool,

    /// Log debug output to stderr
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a file into an envelope
    #[command(alias = "e")]
    Encrypt {
        /// Path to the file whose contents is to be encrypted
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to write the envelope to (default: <out>/<stem>_Cif.json)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        #[command(flatten)]
        method: MethodArgs,
    },

    /// Decrypt an envelope (bare or hidden in a carrier)
    #[command(alias = "d")]
    Decrypt {
        /// Path to the envelope or container
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Directory to write the decrypted file to (default: <out>)
        #[arg(short = 'd', long, value_name = "DIR")]
        dir: Option<PathBuf>,

        /// Alias of the stored private key to use (default: try every stored key)
        #[arg(long, value_name = "ALIAS", conflicts_with = "key_file")]
        key: Option<String>,

        /// PEM file holding the private key to use
        #[arg(long, value_name = "PEM")]
        key_file: Option<PathBuf>,
    },

    /// Decrypt an envelope with the recovery secret
    Recover {
        /// Path to the envelope or container
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Directory to write the decrypted file to (default: <out>)
        #[arg(short = 'd', long, value_name = "DIR")]
        dir: Option<PathBuf>,

        /// PEM file holding the recovery private key (rsa envelopes)
        #[arg(long, value_name = "PEM")]
        master_key: Option<PathBuf>,

        /// Print the escrowed user passphrase instead of decrypting
        #[arg(long, conflicts_with = "master_key")]
        show_passphrase: bool,
    },

    /// Print which secret an envelope needs: password, rsa or unknown
    Detect {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
    },

    /// Hide an envelope inside a carrier file
    Hide {
        /// Path to the envelope
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Carrier file; images are converted to PDF
        #[arg(short, long, value_name = "FILE")]
        carrier: PathBuf,

        /// Path to write the container to (default: <out>/<carrier name>)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Extract the envelope hidden in a carrier file
    Extract {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to write the envelope to (default: <out>/<stem>_Cif.json)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Manage RSA keypairs
    #[command(alias = "k")]
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct MethodArgs {
    /// Encrypt with a passphrase
    #[arg(long)]
    password: bool,

    /// Encrypt for the public key stored under this alias
    #[arg(long, value_name = "ALIAS")]
    recipient: Option<String>,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ClassArgs {
    #[arg(long)]
    public: bool,

    #[arg(long)]
    private: bool,
}

impl ClassArgs {
    fn class(&self) -> KeyClass {
        if self.private {
            KeyClass::Private
        } else {
            KeyClass::Public
        }
    }
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct HalfArgs {
    #[arg(long)]
    public: bool,

    #[arg(long)]
    private: bool,

    #[arg(long)]
    both: bool,
}

impl HalfArgs {
    fn half(&self) -> KeyHalf {
        if self.both {
            KeyHalf::Both
        } else if self.private {
            KeyClass::Private.into()
        } else {
            KeyClass::Public.into()
        }
    }
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new RSA-2048 keypair
    Generate { alias: String },

    /// Import a public or private key from a PEM file
    Import {
        file: PathBuf,

        /// Alias to store the key under (default: derived from the file name)
        #[arg(long)]
        alias: Option<String>,

        /// Reject the file unless it holds this class of key
        #[arg(long, value_name = "CLASS", value_parser = parse_class)]
        expect: Option<KeyClass>,
    },

    /// Export one half of a keypair as PEM
    Export {
        alias: String,

        #[command(flatten)]
        class: ClassArgs,

        /// Export the public key in the legacy PKCS#1 "RSA PUBLIC KEY" form
        #[arg(long, conflicts_with = "private")]
        pkcs1: bool,

        /// Path to write the PEM to (default: <out>/<alias>_<class>.pem)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Delete one or both halves of a keypair
    Delete {
        alias: String,

        #[command(flatten)]
        half: HalfArgs,
    },

    /// List keypairs, newest first
    List,

    /// List every alias that can be used with `encrypt --recipient`
    Recipients,

    /// Show which halves of a keypair are present
    Status { alias: String },
}

fn parse_class(value: &str) -> std::result::Result<KeyClass, String> {
    match value {
        "public" => Ok(KeyClass::Public),
        "private" => Ok(KeyClass::Private),
        other => Err(format!("expected 'public' or 'private', got '{}'", other)),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", error_chain(&e));
        process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = if verbose > 0 { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn error_chain(err: &EndcryptError) -> String {
    let mut chain = err.to_string();
    let mut source = StdError::source(err);
    while let Some(cause) = source {
        let text = cause.to_string();
        if !chain.ends_with(&text) {
            chain.push_str(": ");
            chain.push_str(&text);
        }
        source = cause.source();
    }
    chain
}

fn run(cli: Cli) -> Result<()> {
    let data_dir = match &cli.home {
        Some(home) => home.clone(),
        None => config::default_data_dir()?,
    };
    let config = Config::load(&data_dir, cli.config.as_deref())?;
    let ctx = Context {
        config,
        passphrase_stdin: cli.passphrase_stdin,
    };

    match cli.command {
        Commands::Encrypt {
            input,
            output,
            method,
        } => ctx.encrypt(&input, output, &method),
        Commands::Decrypt {
            input,
            dir,
            key,
            key_file,
        } => ctx.decrypt(&input, dir, key.as_deref(), key_file.as_deref()),
        Commands::Recover {
            input,
            dir,
            master_key,
            show_passphrase,
        } => ctx.recover(&input, dir, master_key.as_deref(), show_passphrase),
        Commands::Detect { input } => {
            let bytes = file_ops::read_input(&input)?;
            let kind = envelope::detect_method(&bytes);
            println!("{}", kind.map_or("unknown", |k| k.as_str()));
            Ok(())
        }
        Commands::Hide {
            input,
            carrier,
            output,
        } => {
            let path = file_ops::hide_file(
                &input,
                &carrier,
                output.as_deref(),
                &ctx.config.output_dir(),
            )?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Extract { input, output } => {
            let output = match output {
                Some(path) => path,
                None => {
                    let dir = ctx.config.output_dir();
                    file_ops::create_private_dir(&dir)?;
                    dir.join(file_ops::encrypted_file_name(&input))
                }
            };
            file_ops::extract_file(&input, &output)?;
            println!("{}", output.display());
            Ok(())
        }
        Commands::Keys { command } => ctx.keys(command),
    }
}

struct Context {
    config: Config,
    passphrase_stdin: bool,
}

impl Context {
    fn file_passphrase(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut reader: Box<dyn PassphraseReader> = if self.passphrase_stdin {
            Box::new(ReaderPassphraseReader::new(Box::new(std::io::stdin())))
        } else {
            Box::new(TerminalPassphraseReader::new())
        };
        reader.read_passphrase()
    }

    #[cfg(not(feature = "keychain"))]
    fn open_keystore(&self) -> Result<KeyStore> {
        use endcrypt::passphrase::{EnvPassphraseReader, FallbackPassphraseReader};
        use endcrypt::vault::FileVault;

        let mut reader = FallbackPassphraseReader::new(
            Box::new(EnvPassphraseReader::new(VAULT_PASSPHRASE_ENV)),
            Box::new(TerminalPassphraseReader::with_prompt("Vault passphrase: ")),
        );
        let passphrase = reader
            .read_passphrase()
            .map_err(|e| e.with_context("vault passphrase required"))?;
        let vault = FileVault::open(
            &self.config.vault_dir(),
            &passphrase,
            self.config.vault_scrypt_log_n,
        )?;
        self.keystore_over(Box::new(vault))
    }

    #[cfg(feature = "keychain")]
    fn open_keystore(&self) -> Result<KeyStore> {
        use endcrypt::vault::KeyringVault;

        self.keystore_over(Box::new(KeyringVault::new(self.config.namespace.clone())))
    }

    fn keystore_over(&self, vault: Box<dyn endcrypt::vault::KeyVault>) -> Result<KeyStore> {
        Ok(KeyStore::open(
            vault,
            self.config.namespace.clone(),
            self.config.metadata_path(),
        )?
        .with_pem_dir(self.config.pem_dir()))
    }

    fn encrypt(&self, input: &Path, output: Option<PathBuf>, method: &MethodArgs) -> Result<()> {
        let output = match output {
            Some(path) => path,
            None => {
                let dir = self.config.output_dir();
                file_ops::create_private_dir(&dir)?;
                dir.join(file_ops::encrypted_file_name(input))
            }
        };
        let recovery = self.config.recovery()?;

        match &method.recipient {
            Some(alias) => {
                let store = self.open_keystore()?;
                let encryptor = Encryptor::new(recovery).with_keys(&store);
                file_ops::encrypt_file(
                    input,
                    &output,
                    &encryptor,
                    &Method::PublicKey(alias.clone()),
                )?;
            }
            None => {
                let passphrase = self.file_passphrase()?;
                let encryptor = Encryptor::new(recovery);
                file_ops::encrypt_file(input, &output, &encryptor, &Method::Password(passphrase))?;
            }
        }
        println!("{}", output.display());
        Ok(())
    }

    fn decrypt(
        &self,
        input: &Path,
        dir: Option<PathBuf>,
        key: Option<&str>,
        key_file: Option<&Path>,
    ) -> Result<()> {
        let bytes = file_ops::read_input(input)?;
        let decrypted = match envelope::detect_method(&bytes) {
            Some(EnvelopeKind::Password) => {
                let passphrase = self.file_passphrase()?;
                decrypt::open(&bytes, Some(&Secret::Passphrase(passphrase)))
            }
            Some(EnvelopeKind::Rsa) => match (key, key_file) {
                (_, Some(path)) => {
                    let private = read_private_key(path)?;
                    decrypt::open(&bytes, Some(&Secret::PrivateKey(private)))
                }
                (Some(alias), None) => {
                    let store = self.open_keystore()?;
                    Decryptor::new(&store).open_with_alias(&bytes, alias)
                }
                (None, None) => {
                    let store = self.open_keystore()?;
                    Decryptor::new(&store).open_with_any_key(&bytes)
                }
            },
            // Let the parser say what is wrong with it.
            None => decrypt::open(&bytes, None),
        }
        .map_err(|e| e.with_context("failed to decrypt"))?;

        let dir = dir.unwrap_or_else(|| self.config.output_dir());
        let written = file_ops::write_decrypted(&dir, &decrypted)?;
        println!("{}", written.path.display());
        Ok(())
    }

    fn recover(
        &self,
        input: &Path,
        dir: Option<PathBuf>,
        master_key: Option<&Path>,
        show_passphrase: bool,
    ) -> Result<()> {
        let bytes = file_ops::read_input(input)?;

        if show_passphrase {
            let admin = self.require_admin_passphrase()?;
            let passphrase = decrypt::recover_passphrase(&bytes, &admin)?;
            println!("{}", String::from_utf8_lossy(&passphrase));
            return Ok(());
        }

        let secret = match envelope::detect_method(&bytes) {
            Some(EnvelopeKind::Rsa) => {
                let path = master_key.ok_or_else(|| {
                    EndcryptError::with_kind(
                        ErrorCategory::User,
                        ErrorKind::MissingSecret,
                        "rsa envelopes are recovered with --master-key",
                    )
                })?;
                RecoverySecret::MasterKey(read_private_key(path)?)
            }
            _ => RecoverySecret::AdminPassphrase(self.require_admin_passphrase()?),
        };
        let decrypted =
            decrypt::recover(&bytes, &secret).map_err(|e| e.with_context("failed to recover"))?;

        let dir = dir.unwrap_or_else(|| self.config.output_dir());
        let written = file_ops::write_decrypted(&dir, &decrypted)?;
        println!("{}", written.path.display());
        Ok(())
    }

    fn require_admin_passphrase(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.config.admin_passphrase()?.ok_or_else(|| {
            EndcryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::MissingSecret,
                "admin passphrase unavailable: set recovery.admin_passphrase_env and that variable",
            )
        })
    }

    fn keys(&self, command: KeyCommands) -> Result<()> {
        let mut store = self.open_keystore()?;
        match command {
            KeyCommands::Generate { alias } => {
                let pair = store.generate(&alias)?;
                println!("generated {}", pair.alias);
            }
            KeyCommands::Import {
                file,
                alias,
                expect,
            } => {
                let alias = match alias {
                    Some(alias) => alias,
                    None => keystore::alias_from_pem_filename(&file).ok_or_else(|| {
                        EndcryptError::new(
                            ErrorCategory::User,
                            format!("cannot derive an alias from {}; pass --alias", file.display()),
                        )
                    })?,
                };
                let pem = std::fs::read_to_string(&file).map_err(|e| {
                    EndcryptError::with_kind_and_source(
                        ErrorCategory::User,
                        ErrorKind::Io,
                        format!("failed to read from {}", file.display()),
                        e,
                    )
                })?;
                let pair = store.import_pem(&alias, &pem, expect)?;
                println!(
                    "imported {} (public: {}, private: {})",
                    pair.alias,
                    yes_no(pair.has_public),
                    yes_no(pair.has_private)
                );
            }
            KeyCommands::Export {
                alias,
                class,
                pkcs1,
                output,
            } => {
                let exported = if pkcs1 {
                    store.export_pkcs1_public(&alias)?
                } else {
                    store.export(&alias, class.class())?
                };
                let path = match output {
                    Some(path) => {
                        file_ops::write_file_secure(&path, exported.pem.as_bytes())?;
                        path
                    }
                    None => {
                        let dir = self.config.output_dir();
                        file_ops::create_private_dir(&dir)?;
                        file_ops::write_new_file(&dir, &exported.file_name, exported.pem.as_bytes())?
                    }
                };
                println!("{}", path.display());
            }
            KeyCommands::Delete { alias, half } => {
                if store.delete(&alias, half.half())? {
                    println!("deleted");
                } else {
                    println!("nothing to delete");
                }
            }
            KeyCommands::List => {
                for pair in store.list()? {
                    println!(
                        "{}\t{}\t{}\tpublic:{}\tprivate:{}",
                        pair.alias,
                        pair.created_at.to_rfc3339(),
                        if pair.is_imported { "imported" } else { "generated" },
                        yes_no(pair.has_public),
                        yes_no(pair.has_private)
                    );
                }
            }
            KeyCommands::Recipients => {
                for (alias, key) in store.list_public_keys()? {
                    println!("{}	{} bits", alias, key.size() * 8);
                }
            }
            KeyCommands::Status { alias } => {
                let (has_public, has_private) = store.availability(&alias)?;
                println!("public: {}", yes_no(has_public));
                println!("private: {}", yes_no(has_private));
            }
        }
        Ok(())
    }
}

fn read_private_key(path: &Path) -> Result<rsa::RsaPrivateKey> {
    let pem = std::fs::read_to_string(path).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Io,
            format!("failed to read from {}", path.display()),
            e,
        )
    })?;
    keycodec::private_key_from_pem(&pem)
        .map_err(|e| e.with_context(format!("invalid private key {}", path.display())))
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
