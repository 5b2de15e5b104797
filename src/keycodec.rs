//! PEM armoring and DER transcoding for RSA keys
//!
//! Keys move through three binary shapes:
//! - PKCS#1 `RSAPublicKey` / `RSAPrivateKey` (RSA specific, no algorithm tag)
//! - X.509 `SubjectPublicKeyInfo` (PKCS#1 public key wrapped with the
//!   rsaEncryption algorithm identifier)
//! - PEM text, which is any of the above base64 encoded between
//!   `-----BEGIN <label>-----` / `-----END <label>-----` lines
//!
//! All ASN.1 lengths are computed, never assumed, so keys of any modulus
//! size transcode correctly.

use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use base64::{Engine, engine::general_purpose::STANDARD};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

/// PEM label of an X.509 SubjectPublicKeyInfo public key.
pub const PUBLIC_KEY_LABEL: &str = "PUBLIC KEY";

/// PEM label of a PKCS#1 public key.
pub const RSA_PUBLIC_KEY_LABEL: &str = "RSA PUBLIC KEY";

/// PEM label of a PKCS#1 private key.
pub const RSA_PRIVATE_KEY_LABEL: &str = "RSA PRIVATE KEY";

/// Base64 characters per PEM body line.
const PEM_LINE_LEN: usize = 64;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_BIT_STRING: u8 = 0x03;

/// DER of `AlgorithmIdentifier { rsaEncryption (1.2.840.113549.1.1.1), NULL }`.
const RSA_ALGORITHM_IDENTIFIER: [u8; 15] = [
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

/// What a PEM document claims to hold, judged by its header markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PemKind {
    Public,
    Private,
    Unknown,
}

/// Classify PEM text as public or private by scanning for its BEGIN marker.
pub fn classify(pem: &str) -> PemKind {
    if pem.contains("BEGIN RSA PRIVATE KEY") {
        PemKind::Private
    } else if pem.contains("BEGIN PUBLIC KEY") || pem.contains("BEGIN RSA PUBLIC KEY") {
        PemKind::Public
    } else {
        PemKind::Unknown
    }
}

/// True if the PEM holds a public key in the bare PKCS#1 form.
pub fn is_pkcs1_public(pem: &str) -> bool {
    pem.contains("BEGIN RSA PUBLIC KEY")
}

/// Strip the armor lines and whitespace from PEM text and decode the body.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();

    STANDARD.decode(body.as_bytes()).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::InvalidBase64,
            format!("PEM body is not valid base64: {}", e),
            e,
        )
    })
}

/// Armor DER bytes as PEM with the given label and 64 character lines.
pub fn der_to_pem(der: &[u8], label: &str) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::with_capacity(encoded.len() + encoded.len() / PEM_LINE_LEN + 64);
    pem.push_str(&format!("-----BEGIN {}-----\n", label));
    // Base64 output is ASCII, so byte chunks are always valid str slices.
    for line in encoded.as_bytes().chunks(PEM_LINE_LEN) {
        pem.push_str(std::str::from_utf8(line).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}

/// Wrap a PKCS#1 `RSAPublicKey` into an X.509 `SubjectPublicKeyInfo`.
///
/// ```text
/// SEQUENCE {
///   SEQUENCE { OID rsaEncryption, NULL }
///   BIT STRING { 0x00 unused bits, <pkcs1 bytes> }
/// }
/// ```
pub fn pkcs1_to_pkcs8(pkcs1_der: &[u8]) -> Vec<u8> {
    let mut bit_string = Vec::with_capacity(pkcs1_der.len() + 8);
    bit_string.push(TAG_BIT_STRING);
    encode_length(pkcs1_der.len() + 1, &mut bit_string);
    bit_string.push(0x00);
    bit_string.extend_from_slice(pkcs1_der);

    let body_len = RSA_ALGORITHM_IDENTIFIER.len() + bit_string.len();
    let mut spki = Vec::with_capacity(body_len + 8);
    spki.push(TAG_SEQUENCE);
    encode_length(body_len, &mut spki);
    spki.extend_from_slice(&RSA_ALGORITHM_IDENTIFIER);
    spki.extend_from_slice(&bit_string);
    spki
}

/// Unwrap an X.509 `SubjectPublicKeyInfo` back to the PKCS#1 `RSAPublicKey`.
pub fn spki_to_pkcs1(spki_der: &[u8]) -> Result<Vec<u8>> {
    let (content, rest) = read_tlv(spki_der, TAG_SEQUENCE)?;
    if !rest.is_empty() {
        return Err(malformed("trailing bytes after SubjectPublicKeyInfo"));
    }

    let algorithm_len = RSA_ALGORITHM_IDENTIFIER.len();
    if content.len() < algorithm_len || content[..algorithm_len] != RSA_ALGORITHM_IDENTIFIER {
        return Err(malformed("SubjectPublicKeyInfo is not an rsaEncryption key"));
    }

    let (bits, rest) = read_tlv(&content[algorithm_len..], TAG_BIT_STRING)?;
    if !rest.is_empty() {
        return Err(malformed("trailing bytes inside SubjectPublicKeyInfo"));
    }
    match bits.split_first() {
        Some((0x00, key)) => Ok(key.to_vec()),
        _ => Err(malformed("public key BIT STRING has unused bits")),
    }
}

/// Parse an RSA public key from SubjectPublicKeyInfo DER.
pub fn public_key_from_der(spki_der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(spki_der)
        .map_err(|e| malformed(format!("not an RSA public key: {}", e)))
}

/// Parse an RSA private key from PKCS#1 DER.
pub fn private_key_from_der(pkcs1_der: &[u8]) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_der(pkcs1_der)
        .map_err(|e| malformed(format!("not an RSA private key: {}", e)))
}

/// Parse a public key PEM in either the `PUBLIC KEY` or `RSA PUBLIC KEY` form.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey> {
    if classify(pem) != PemKind::Public {
        return Err(malformed("PEM does not hold a public key"));
    }
    let der = pem_to_der(pem)?;
    if is_pkcs1_public(pem) {
        public_key_from_der(&pkcs1_to_pkcs8(&der))
    } else {
        public_key_from_der(&der)
    }
}

/// Parse a private key PEM.
///
/// Besides `RSA PRIVATE KEY`, unencrypted PKCS#8 `PRIVATE KEY` documents are
/// accepted here since that is what current OpenSSL writes by default. Key
/// import stays limited to the PKCS#1 form.
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey> {
    if pem.contains("BEGIN PRIVATE KEY") {
        let der = pem_to_der(pem)?;
        return RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|e| malformed(format!("not an RSA private key: {}", e)));
    }
    if classify(pem) != PemKind::Private {
        return Err(malformed("PEM does not hold a private key"));
    }
    private_key_from_der(&pem_to_der(pem)?)
}

/// Append a DER length in short form (< 128) or minimal long form.
pub fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let significant = &bytes[skip..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}

/// Decode a DER length at the start of `input`.
///
/// Returns the length and the number of bytes the length field occupied.
/// Indefinite and non-minimal encodings are rejected, as DER requires.
pub fn decode_length(input: &[u8]) -> Result<(usize, usize)> {
    let first = *input
        .first()
        .ok_or_else(|| malformed("input truncated while reading DER length"))?;
    if first < 0x80 {
        return Ok((first as usize, 1));
    }

    let count = (first & 0x7f) as usize;
    if count == 0 {
        return Err(malformed("indefinite length is not allowed in DER"));
    }
    if count > size_of::<u32>() {
        return Err(malformed("DER length field too large"));
    }
    if input.len() < 1 + count {
        return Err(malformed("input truncated while reading DER length"));
    }

    let field = &input[1..1 + count];
    if field[0] == 0 {
        return Err(malformed("non-minimal DER length encoding"));
    }
    let len = field.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    if len < 0x80 {
        return Err(malformed("long form used for a short DER length"));
    }
    Ok((len, 1 + count))
}

/// Read one tag-length-value element with the expected tag.
///
/// Returns the element's content and whatever follows it.
fn read_tlv(input: &[u8], expected_tag: u8) -> Result<(&[u8], &[u8])> {
    match input.first() {
        Some(tag) if *tag == expected_tag => {}
        Some(tag) => {
            return Err(malformed(format!(
                "unexpected DER tag 0x{:02x}, expected 0x{:02x}",
                tag, expected_tag
            )));
        }
        None => return Err(malformed("input truncated while reading DER tag")),
    }

    let (len, len_size) = decode_length(&input[1..])?;
    let start = 1 + len_size;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= input.len())
        .ok_or_else(|| malformed("DER element longer than available input"))?;
    Ok((&input[start..end], &input[end..]))
}

fn malformed(msg: impl Into<String>) -> EndcryptError {
    EndcryptError::with_kind(ErrorCategory::User, ErrorKind::UnrecognizedKeyFormat, msg)
}
