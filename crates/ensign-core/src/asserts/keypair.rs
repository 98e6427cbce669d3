//! Device keys and their filesystem-backed store.
//!
//! A device key is a 4096-bit RSA keypair identified by the base64url
//! SHA3-384 digest of its DER-encoded public key. Keys are persisted as
//! PKCS#8 PEM files named after the key id, written with owner-only
//! permissions and an atomic rename so a crash never leaves a torn key
//! on disk.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey,
    LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use sha3::{Digest, Sha3_384};
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors from device key generation, encoding and storage.
#[derive(Debug, Error)]
pub enum KeypairError {
    /// Key generation failed.
    #[error("cannot generate device key pair: {0}")]
    Generate(rsa::Error),

    /// I/O error while persisting or reading a key.
    #[error("cannot store device key pair: {0}")]
    Storage(#[from] std::io::Error),

    /// No key stored under the requested id.
    #[error("no device key pair with id {key_id}")]
    NotFound {
        /// The key id that was not found.
        key_id: String,
    },

    /// A key or public key could not be encoded or decoded.
    #[error("cannot encode device key: {0}")]
    Encode(String),

    /// Signing with the device key failed.
    #[error("cannot sign with device key: {0}")]
    Signing(rsa::Error),
}

/// Compute the key id of a DER-encoded public key.
fn key_id_for_der(der: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha3_384::digest(der))
}

/// An RSA device keypair.
#[derive(Debug, Clone)]
pub struct DeviceKey {
    key: RsaPrivateKey,
    id: String,
}

impl DeviceKey {
    /// Generate a fresh keypair with the given modulus size.
    ///
    /// # Errors
    ///
    /// Returns [`KeypairError::Generate`] when key generation fails.
    pub fn generate(bits: usize) -> Result<Self, KeypairError> {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, bits).map_err(KeypairError::Generate)?;
        Self::from_private_key(key)
    }

    fn from_private_key(key: RsaPrivateKey) -> Result<Self, KeypairError> {
        let der = key
            .to_public_key()
            .to_public_key_der()
            .map_err(|err| KeypairError::Encode(err.to_string()))?;
        let id = key_id_for_der(der.as_bytes());
        Ok(Self { key, id })
    }

    /// The public-key id identifying this keypair.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The armoured (PEM) encoding of the public key.
    ///
    /// # Errors
    ///
    /// Returns [`KeypairError::Encode`] when the key cannot be encoded.
    pub fn public_key_pem(&self) -> Result<String, KeypairError> {
        self.key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| KeypairError::Encode(err.to_string()))
    }

    /// Sign `content` with the private key (PKCS#1 v1.5 over SHA-256),
    /// returning the base64 signature.
    ///
    /// # Errors
    ///
    /// Returns [`KeypairError::Signing`] when the signature operation
    /// fails.
    pub fn sign(&self, content: &[u8]) -> Result<String, KeypairError> {
        let digest = Sha256::digest(content);
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(KeypairError::Signing)?;
        Ok(STANDARD.encode(signature))
    }

    fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>, KeypairError> {
        self.key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| KeypairError::Encode(err.to_string()))
    }

    fn from_pkcs8_pem(pem: &str) -> Result<Self, KeypairError> {
        let key =
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|err| KeypairError::Encode(err.to_string()))?;
        Self::from_private_key(key)
    }
}

/// Compute the key id of an armoured (PEM) public key.
///
/// # Errors
///
/// Returns [`KeypairError::Encode`] when the PEM does not parse.
pub fn key_id_for_public_pem(pem: &str) -> Result<String, KeypairError> {
    let key =
        RsaPublicKey::from_public_key_pem(pem).map_err(|err| KeypairError::Encode(err.to_string()))?;
    let der = key
        .to_public_key_der()
        .map_err(|err| KeypairError::Encode(err.to_string()))?;
    Ok(key_id_for_der(der.as_bytes()))
}

/// Filesystem-backed map from key id to device keypair.
#[derive(Debug)]
pub struct FsKeypairManager {
    keys_dir: PathBuf,
}

impl FsKeypairManager {
    /// Open (creating if needed) the key directory.
    ///
    /// # Errors
    ///
    /// Returns [`KeypairError::Storage`] when the directory cannot be
    /// created.
    pub fn new(keys_dir: impl Into<PathBuf>) -> Result<Self, KeypairError> {
        let keys_dir = keys_dir.into();
        if !keys_dir.exists() {
            fs::create_dir_all(&keys_dir)?;
            fs::set_permissions(&keys_dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { keys_dir })
    }

    fn key_path(&self, key_id: &str) -> PathBuf {
        self.keys_dir.join(format!("{key_id}.key"))
    }

    /// Persist a keypair under its key id.
    ///
    /// The key is written to a temporary file and moved into place, so
    /// concurrent readers never observe a partial key. Re-putting the
    /// same key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`KeypairError::Encode`] when the key cannot be encoded
    /// and [`KeypairError::Storage`] on I/O failure.
    pub fn put(&self, key: &DeviceKey) -> Result<(), KeypairError> {
        let pem = key.to_pkcs8_pem()?;
        let tmp_path = self.keys_dir.join(format!(".{}.key.tmp", key.id()));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        file.write_all(pem.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, self.key_path(key.id()))?;
        Ok(())
    }

    /// Retrieve the keypair stored under `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`KeypairError::NotFound`] when no key is stored under the
    /// id, [`KeypairError::Storage`] on I/O failure and
    /// [`KeypairError::Encode`] when the stored key does not parse.
    pub fn get(&self, key_id: &str) -> Result<DeviceKey, KeypairError> {
        let path = self.key_path(key_id);
        if !path.exists() {
            return Err(KeypairError::NotFound {
                key_id: key_id.to_string(),
            });
        }
        let pem = Zeroizing::new(fs::read_to_string(&path)?);
        DeviceKey::from_pkcs8_pem(&pem)
    }
}
