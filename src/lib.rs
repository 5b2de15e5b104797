//! endcrypt - hybrid file encryption
//!
//! Files are sealed with AES-256-GCM into self-describing JSON envelopes,
//! opened either by a passphrase or by an RSA private key, with optional
//! escrow for a recovery holder. Keypairs live in a [`vault::KeyVault`]
//! managed by a [`keystore::KeyStore`]. Envelopes can be hidden behind an
//! ordinary carrier file with the [`container`] codec.

#![forbid(unsafe_code)]

pub mod config;
pub mod container;
pub mod decrypt;
pub mod encrypt;
pub mod envelope;
pub mod error;
pub mod file_ops;
pub mod keycodec;
pub mod keystore;
pub mod passphrase;
pub mod secretcrypt;
pub mod vault;
