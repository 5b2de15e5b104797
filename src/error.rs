use std::error::Error as StdError;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Any failure that cannot be confidently attributed to any other error
    /// category in this enum.
    ///
    /// Use of Internal is never a guarantee the error is not, for example,
    /// caused by the user - merely that the code cannot tell.
    Internal,

    /// The user provided invalid input, the wrong secret, or asked for
    /// something that does not exist.
    User,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A keypair already exists under the requested alias.
    DuplicateAlias,
    /// The requested key half is not present in the vault.
    KeyNotFound,
    /// PEM text is neither a recognized public nor private RSA key.
    UnrecognizedKeyFormat,
    /// PEM body could not be base64 decoded.
    InvalidBase64,
    /// The envelope needs a passphrase or private key that was not supplied.
    MissingSecret,
    /// Envelope JSON is unparsable or lacks required fields.
    MalformedEnvelope,
    /// Envelope `type` names a method this build does not know.
    UnsupportedMethod,
    /// Ciphertext is too short to contain an authentication tag.
    InvalidCiphertext,
    /// AEAD tag verification failed: wrong key, wrong passphrase, or
    /// tampered data. Deliberately indistinguishable.
    AuthenticationFailed,
    /// RSA-OAEP unwrap of the content key failed.
    UnwrapFailed,
    /// Container delimiter was not found in the input.
    DelimiterNotFound,
    /// An image carrier could not be normalized into a document.
    CarrierConversionFailed,
    /// RSA key generation or encoding failed.
    KeyGeneration,
    /// Passphrase could not be obtained from the configured reader.
    PassphraseUnavailable,
    /// Configuration could not be read or is inconsistent.
    Config,
    /// Unexpected state reached within endcrypt logic.
    InternalInvariant,
    /// Interaction with the filesystem, key vault, stdin/stdout or other
    /// I/O failed.
    Io,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct EndcryptError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Optional specific condition tag. Any code consuming errors MUST
    /// handle the absence of a defined kind.
    pub kind: Option<ErrorKind>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl EndcryptError {
    /// Creates a new error with a required category and display message.
    pub fn new(category: ErrorCategory, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: None,
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that also tags the failure with a kind.
    pub fn with_kind(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that carries both a kind tag and the originating source error.
    pub fn with_kind_and_source(
        category: ErrorCategory,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// The opaque failure returned whenever a secret does not open an
    /// envelope. `kind` says which stage refused; the message never does.
    pub(crate) fn decryption_failed(kind: ErrorKind) -> Self {
        Self::with_kind(
            ErrorCategory::User,
            kind,
            "decryption failed: wrong secret or corrupted data",
        )
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Wraps the current error with a higher-level message while preserving the original as source.
    ///
    /// The kind and category of the inner error are carried over so callers
    /// can still branch on them.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        Self {
            category,
            kind,
            source: Some(Box::new(self)),
            msg: msg.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, EndcryptError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_context_preserves_kind() {
        let inner = EndcryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::KeyNotFound,
            "no public key for alias",
        );
        let outer = inner.with_context("export failed");

        assert_eq!(outer.kind, Some(ErrorKind::KeyNotFound));
        assert_eq!(outer.category, ErrorCategory::User);
        assert_eq!(outer.message(), "export failed");
        assert_eq!(
            outer.source_error().unwrap().to_string(),
            "no public key for alias"
        );
    }

    #[test]
    fn test_source_is_exposed() {
        let err = EndcryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "vault write failed",
            io::Error::other("disk full"),
        );
        assert_eq!(err.source_error().unwrap().to_string(), "disk full");
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn test_decryption_failures_share_message() {
        let a = EndcryptError::decryption_failed(ErrorKind::AuthenticationFailed);
        let b = EndcryptError::decryption_failed(ErrorKind::UnwrapFailed);
        assert_eq!(a.to_string(), b.to_string());
        assert_ne!(a.kind, b.kind);
    }
}
