//! Sealed storage of the CRM webhook link.
//!
//! The inbound webhook URL doubles as a credential, so it is never kept in
//! plain text: `/init` seals it with AES-256-CBC under a key and IV drawn
//! from the OS RNG, and the three values land in a `.env`-style file
//! (`CRYPTO_KEY`/`CRYPTO_IV` hex-encoded, `BX_LINK` base64).  The format
//! matches the credential files of the previously deployed service, so an
//! existing installation keeps working after an upgrade.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const KEY_ENTRY: &str = "CRYPTO_KEY";
const IV_ENTRY: &str = "CRYPTO_IV";
const LINK_ENTRY: &str = "BX_LINK";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read or write the credential file: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential file is missing the {0} entry")]
    MissingEntry(&'static str),
    #[error("credential file entry {0} is not valid")]
    MalformedEntry(&'static str),
    #[error("stored webhook link cannot be decrypted")]
    Decrypt,
}

/// A sealed webhook link together with the material needed to open it.
///
/// No `Debug` implementation: the key must stay out of logs.
#[derive(Clone)]
pub struct StoredCredentials {
    key: [u8; 32],
    iv: [u8; 16],
    ciphertext: Vec<u8>,
}

impl StoredCredentials {
    /// Encrypts `link` under a fresh key and IV.
    pub fn seal(link: &str) -> Self {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        rand::rng().fill_bytes(&mut key);
        rand::rng().fill_bytes(&mut iv);
        let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(link.as_bytes());
        Self {
            key,
            iv,
            ciphertext,
        }
    }

    /// Decrypts the stored link, normalised to end with a slash so CRM
    /// method names can be appended directly.
    pub fn webhook_url(&self) -> Result<String, CredentialError> {
        let plain = Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&self.ciphertext)
            .map_err(|_| CredentialError::Decrypt)?;
        let mut url = String::from_utf8(plain).map_err(|_| CredentialError::Decrypt)?;
        if !url.ends_with('/') {
            url.push('/');
        }
        Ok(url)
    }
}

/// File-backed credential storage.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Seals `link` and persists it, replacing any previous credentials.
    pub fn seal(&self, link: &str) -> Result<StoredCredentials, CredentialError> {
        let credentials = StoredCredentials::seal(link);
        let contents = format!(
            "{KEY_ENTRY}={}\n{IV_ENTRY}={}\n{LINK_ENTRY}={}\n",
            hex::encode(credentials.key),
            hex::encode(credentials.iv),
            BASE64.encode(&credentials.ciphertext),
        );
        fs::write(&self.path, contents)?;
        Ok(credentials)
    }

    /// Loads previously stored credentials.  A missing file is not an
    /// error: the service has simply not been initialised yet.
    pub fn load(&self) -> Result<Option<StoredCredentials>, CredentialError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut key_hex = None;
        let mut iv_hex = None;
        let mut link_b64 = None;
        for line in contents.lines() {
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            match name.trim() {
                KEY_ENTRY => key_hex = Some(value.trim().to_string()),
                IV_ENTRY => iv_hex = Some(value.trim().to_string()),
                LINK_ENTRY => link_b64 = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let key_hex = key_hex.ok_or(CredentialError::MissingEntry(KEY_ENTRY))?;
        let iv_hex = iv_hex.ok_or(CredentialError::MissingEntry(IV_ENTRY))?;
        let link_b64 = link_b64.ok_or(CredentialError::MissingEntry(LINK_ENTRY))?;

        let key: [u8; 32] = hex::decode(&key_hex)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(CredentialError::MalformedEntry(KEY_ENTRY))?;
        let iv: [u8; 16] = hex::decode(&iv_hex)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(CredentialError::MalformedEntry(IV_ENTRY))?;
        let ciphertext = BASE64
            .decode(&link_b64)
            .map_err(|_| CredentialError::MalformedEntry(LINK_ENTRY))?;

        Ok(Some(StoredCredentials {
            key,
            iv,
            ciphertext,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_round_trip() {
        let credentials = StoredCredentials::seal("https://portal.example/rest/1/abc/");
        assert_eq!(
            credentials.webhook_url().unwrap(),
            "https://portal.example/rest/1/abc/"
        );
    }

    #[test]
    fn opened_link_gains_a_trailing_slash() {
        let credentials = StoredCredentials::seal("https://portal.example/rest/1/abc");
        assert_eq!(
            credentials.webhook_url().unwrap(),
            "https://portal.example/rest/1/abc/"
        );
    }

    #[test]
    fn store_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("creds.env"));

        store.seal("https://portal.example/rest/1/abc/").unwrap();
        let loaded = store.load().unwrap().expect("credentials were written");
        assert_eq!(
            loaded.webhook_url().unwrap(),
            "https://portal.example/rest/1/abc/"
        );
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("nope.env"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn malformed_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.env");
        std::fs::write(
            &path,
            "CRYPTO_KEY=zz\nCRYPTO_IV=00000000000000000000000000000000\nBX_LINK=aGk=\n",
        )
        .unwrap();
        let store = CredentialStore::new(path);
        assert!(matches!(
            store.load(),
            Err(CredentialError::MalformedEntry(KEY_ENTRY))
        ));
    }

    #[test]
    fn missing_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.env");
        std::fs::write(&path, "CRYPTO_KEY=00\n").unwrap();
        let store = CredentialStore::new(path);
        assert!(matches!(
            store.load(),
            Err(CredentialError::MissingEntry(_))
        ));
    }
}
