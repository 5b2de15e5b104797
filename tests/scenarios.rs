//! End-to-end scenarios through the library API.

use endcrypt::container;
use endcrypt::decrypt::{self, Decryptor, RecoverySecret, Secret};
use endcrypt::encrypt::{Encryptor, Method, Recovery};
use endcrypt::envelope::{self, EnvelopeKind};
use endcrypt::error::ErrorKind;
use endcrypt::keycodec;
use endcrypt::keystore::{KeyHalf, KeyStore};
use endcrypt::secretcrypt::{self, SymmetricKey};
use endcrypt::vault::{FileVault, KeyClass};
use rand::rngs::OsRng;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::TempDir;
use zeroize::Zeroizing;

fn open_store(dir: &TempDir) -> KeyStore {
    let vault = FileVault::open(&dir.path().join("vault"), b"vault-secret", 10).unwrap();
    KeyStore::open(Box::new(vault), "com.endcrypt", dir.path().join("keys.json")).unwrap()
}

fn passphrase(value: &str) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(value.as_bytes().to_vec())
}

#[test]
fn test_password_envelope_opens_only_with_its_passphrase() {
    let encryptor = Encryptor::new(Recovery::none());
    let envelope = encryptor
        .encrypt(
            b"hello1234",
            "hello.txt",
            &Method::Password(passphrase("correct-horse")),
        )
        .unwrap();
    let json = envelope.to_json().unwrap();
    assert_eq!(envelope::detect_method(&json), Some(EnvelopeKind::Password));

    let opened = decrypt::open(&json, Some(&Secret::Passphrase(passphrase("correct-horse"))))
        .unwrap();
    assert_eq!(&*opened.plaintext, b"hello1234");
    assert_eq!(opened.file_name, "hello.txt");

    let err = decrypt::open(&json, Some(&Secret::Passphrase(passphrase("wrong-horse"))))
        .expect_err("expected wrong passphrase to fail");
    assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
}

#[test]
fn test_exported_private_key_outlives_the_vault_copy() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store.generate("alice").unwrap();

    let json = {
        let encryptor = Encryptor::new(Recovery::none()).with_keys(&store);
        encryptor
            .encrypt(b"for alice", "memo.txt", &Method::PublicKey("alice".into()))
            .unwrap()
            .to_json()
            .unwrap()
    };
    let exported = store.export("alice", KeyClass::Private).unwrap();
    assert_eq!(exported.file_name, "alice_private.pem");

    assert!(store.delete("alice", KeyHalf::Private).unwrap());
    let err = Decryptor::new(&store)
        .open_with_alias(&json, "alice")
        .expect_err("expected private half to be gone");
    assert_eq!(err.kind, Some(ErrorKind::KeyNotFound));

    let private = keycodec::private_key_from_pem(&exported.pem).unwrap();
    let opened = decrypt::open(&json, Some(&Secret::PrivateKey(private))).unwrap();
    assert_eq!(&*opened.plaintext, b"for alice");
}

#[test]
fn test_escrow_with_master_key_and_admin_passphrase() {
    let user = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
    let master = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
    let recovery = Recovery::none()
        .with_public_key(RsaPublicKey::from(&master))
        .with_admin_passphrase(passphrase("admin-secret"));

    let rsa_json = endcrypt::encrypt::seal_with_public_key(
        b"rsa payload",
        "a.bin",
        &RsaPublicKey::from(&user),
        &recovery,
    )
    .unwrap()
    .to_json()
    .unwrap();
    let recovered = decrypt::recover(&rsa_json, &RecoverySecret::MasterKey(master)).unwrap();
    assert_eq!(&*recovered.plaintext, b"rsa payload");

    let password_json = endcrypt::encrypt::seal_with_passphrase(
        b"password payload",
        "b.bin",
        b"user-secret",
        &recovery,
    )
    .unwrap()
    .to_json()
    .unwrap();
    let recovered = decrypt::recover(
        &password_json,
        &RecoverySecret::AdminPassphrase(passphrase("admin-secret")),
    )
    .unwrap();
    assert_eq!(&*recovered.plaintext, b"password payload");
    assert_eq!(
        &*decrypt::recover_passphrase(&password_json, b"admin-secret").unwrap(),
        b"user-secret"
    );
}

#[test]
fn test_unescrowed_envelope_cannot_be_recovered() {
    let json =
        endcrypt::encrypt::seal_with_passphrase(b"x", "x.txt", b"pw", &Recovery::none())
            .unwrap()
            .to_json()
            .unwrap();
    let text = String::from_utf8(json.clone()).unwrap();
    assert!(!text.contains("salt_admin"));

    let err = decrypt::recover(
        &json,
        &RecoverySecret::AdminPassphrase(passphrase("admin-secret")),
    )
    .expect_err("expected missing escrow");
    assert_eq!(err.kind, Some(ErrorKind::MissingSecret));
}

#[test]
fn test_pkcs1_public_key_rewrapped_as_spki_imports_and_wraps() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
    let pkcs1 = RsaPublicKey::from(&private).to_pkcs1_der().unwrap();

    let spki = keycodec::pkcs1_to_pkcs8(pkcs1.as_bytes());
    let pem = keycodec::der_to_pem(&spki, keycodec::PUBLIC_KEY_LABEL);
    let pair = store.import_pem("dave", &pem, Some(KeyClass::Public)).unwrap();
    assert!(pair.has_public);
    assert!(!pair.has_private);

    let imported = store.public_key("dave").unwrap();
    let key = SymmetricKey::generate();
    let wrapped = secretcrypt::wrap_key(&imported, &key).unwrap();
    let unwrapped = secretcrypt::unwrap_key(&private, &wrapped).unwrap();
    assert_eq!(unwrapped.as_bytes(), key.as_bytes());
}

#[test]
fn test_container_keeps_carrier_and_envelope_intact() {
    let json = endcrypt::encrypt::seal_with_passphrase(b"x", "x.txt", b"pw", &Recovery::none())
        .unwrap()
        .to_json()
        .unwrap();
    let carrier = b"%PDF-1.7 pretend carrier".to_vec();

    let combined = container::embed(&json, &carrier);
    let (front, back) = container::extract(&combined).unwrap();
    assert_eq!(front, carrier.as_slice());
    assert_eq!(back, json.as_slice());
    assert_eq!(container::envelope_bytes(&json), json.as_slice());

    let opened = decrypt::open(&combined, Some(&Secret::Passphrase(passphrase("pw")))).unwrap();
    assert_eq!(&*opened.plaintext, b"x");
}
