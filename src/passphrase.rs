//! Passphrase reading functionality

use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use std::env;
use std::io::{self, IsTerminal, Read, Write};
use zeroize::Zeroizing;

/// Trait for reading passphrases from various sources
pub trait PassphraseReader {
    /// Read a passphrase as arbitrary bytes (not necessarily UTF-8)
    ///
    /// Returns the passphrase wrapped in `Zeroizing` to ensure it is securely
    /// wiped from memory when dropped.
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>>;
}

/// Returns a fixed passphrase (for testing)
pub struct ConstantPassphraseReader {
    passphrase: Zeroizing<Vec<u8>>,
}

impl ConstantPassphraseReader {
    pub fn new(passphrase: Vec<u8>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase),
        }
    }
}

impl PassphraseReader for ConstantPassphraseReader {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new((*self.passphrase).clone()))
    }
}

/// Reads passphrase from any io::Read source
pub struct ReaderPassphraseReader {
    reader: Box<dyn Read>,
}

impl ReaderPassphraseReader {
    pub fn new(reader: Box<dyn Read>) -> Self {
        Self { reader }
    }
}

impl PassphraseReader for ReaderPassphraseReader {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        let mut data = Zeroizing::new(Vec::new());
        self.reader.read_to_end(&mut data).map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("error reading passphrase: {}", e),
                e,
            )
        })?;
        Ok(data)
    }
}

/// Reads a passphrase from an environment variable.
///
/// An unset or empty variable is `PassphraseUnavailable`.
pub struct EnvPassphraseReader {
    var: String,
}

impl EnvPassphraseReader {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl PassphraseReader for EnvPassphraseReader {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        match env::var_os(&self.var) {
            Some(value) if !value.is_empty() => {
                Ok(Zeroizing::new(value.to_string_lossy().into_owned().into_bytes()))
            }
            _ => Err(EndcryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::PassphraseUnavailable,
                format!("environment variable {} is not set", self.var),
            )),
        }
    }
}

/// Reads passphrase from terminal with no echo
pub struct TerminalPassphraseReader {
    prompt: String,
}

impl TerminalPassphraseReader {
    pub fn new() -> Self {
        Self::with_prompt("Passphrase: ")
    }

    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl Default for TerminalPassphraseReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PassphraseReader for TerminalPassphraseReader {
    /// Read passphrase from terminal.
    ///
    /// Note: Terminal input is limited to UTF-8 due to rpassword library constraints.
    /// For non-UTF-8 passphrases, use --passphrase-stdin instead.
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        if !io::stdin().is_terminal() {
            return Err(EndcryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::PassphraseUnavailable,
                "cannot read passphrase from terminal - stdin is not a terminal",
            ));
        }

        io::stderr()
            .write_all(self.prompt.as_bytes())
            .map_err(|e| {
                EndcryptError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    format!("failed to write prompt: {}", e),
                    e,
                )
            })?;
        io::stderr().flush().map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("failed to flush prompt: {}", e),
                e,
            )
        })?;

        // Read password *without echo*
        // Note: rpassword returns String (UTF-8 only), not zeroized
        let passphrase = rpassword::read_password().map_err(|e| {
            EndcryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::PassphraseUnavailable,
                format!("failure reading passphrase: {}", e),
                e,
            )
        })?;

        Ok(Zeroizing::new(passphrase.into_bytes()))
    }
}

/// Tries `primary` first and asks `fallback` only when the primary source
/// has no passphrase to offer. Other errors are returned as they are.
pub struct FallbackPassphraseReader {
    primary: Box<dyn PassphraseReader>,
    fallback: Box<dyn PassphraseReader>,
}

impl FallbackPassphraseReader {
    pub fn new(primary: Box<dyn PassphraseReader>, fallback: Box<dyn PassphraseReader>) -> Self {
        Self { primary, fallback }
    }
}

impl PassphraseReader for FallbackPassphraseReader {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        match self.primary.read_passphrase() {
            Err(e) if e.kind == Some(ErrorKind::PassphraseUnavailable) => {
                tracing::debug!(reason = %e, "falling back to secondary passphrase source");
                self.fallback.read_passphrase()
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnavailableReader;

    impl PassphraseReader for UnavailableReader {
        fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
            Err(EndcryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::PassphraseUnavailable,
                "simulated absence",
            ))
        }
    }

    struct BrokenReader;

    impl PassphraseReader for BrokenReader {
        fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
            Err(EndcryptError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "simulated error",
            ))
        }
    }

    #[test]
    fn test_constant_reader() {
        let mut reader = ConstantPassphraseReader::new(b"test123".to_vec());
        assert_eq!(&*reader.read_passphrase().unwrap(), b"test123");
        assert_eq!(&*reader.read_passphrase().unwrap(), b"test123");
    }

    /// Tests the terminal reader. This is ignored by default and must be run
    /// explicitly and with human input:
    ///
    /// cargo test test_terminal_reader_interactive -- --ignored --nocapture
    #[test]
    #[ignore]
    fn test_terminal_reader_interactive() {
        let mut reader = TerminalPassphraseReader::with_prompt("Test passphrase: ");
        let passphrase = reader.read_passphrase().unwrap();
        println!("You entered: {}", String::from_utf8_lossy(&passphrase));
        assert!(!passphrase.is_empty(), "Expected non-empty passphrase");
    }

    #[test]
    fn test_reader_passphrase_reader() {
        let data = b"mypassword";
        let mut reader = ReaderPassphraseReader::new(Box::new(&data[..]));
        assert_eq!(&*reader.read_passphrase().unwrap(), b"mypassword");
    }

    /// Verifies that ReaderPassphraseReader accepts arbitrary byte sequences,
    /// not just valid UTF-8. This enables --passphrase-stdin to work with
    /// passphrases containing non-UTF-8 bytes.
    #[test]
    fn test_reader_passphrase_reader_non_utf8() {
        let data: &[u8] = &[0xff, 0xfe, 0x00, 0x01];
        let mut reader = ReaderPassphraseReader::new(Box::new(data));
        assert_eq!(&*reader.read_passphrase().unwrap(), data);
    }

    #[test]
    fn test_env_reader_unset() {
        let mut reader = EnvPassphraseReader::new("ENDCRYPT_TEST_SURELY_UNSET_VARIABLE");
        let err = reader.read_passphrase().expect_err("expected unavailable");
        assert_eq!(err.kind, Some(ErrorKind::PassphraseUnavailable));
    }

    #[test]
    fn test_fallback_only_on_unavailable() {
        let mut reader = FallbackPassphraseReader::new(
            Box::new(UnavailableReader),
            Box::new(ConstantPassphraseReader::new(b"second".to_vec())),
        );
        assert_eq!(&*reader.read_passphrase().unwrap(), b"second");

        let mut reader = FallbackPassphraseReader::new(
            Box::new(ConstantPassphraseReader::new(b"first".to_vec())),
            Box::new(BrokenReader),
        );
        assert_eq!(&*reader.read_passphrase().unwrap(), b"first");

        let mut reader = FallbackPassphraseReader::new(
            Box::new(BrokenReader),
            Box::new(ConstantPassphraseReader::new(b"second".to_vec())),
        );
        let err = reader.read_passphrase().expect_err("expected primary error");
        assert_eq!(err.kind, Some(ErrorKind::Io));
    }
}
