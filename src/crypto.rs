//! cryptographic keys
//!
//! Third party caveats are sealed with authenticated public-key encryption
//! (Curve25519 + XSalsa20-Poly1305): the minting service encrypts the caveat
//! root key and condition so that only the third party can read them.
//!
//! The implementation is based on [crypto_box](https://github.com/RustCrypto/nacl-compat).

use std::fmt::Display;
use std::hash::Hash;

use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

use crate::error::FormatError;

/// pair of cryptographic keys identifying a service or third party
#[derive(Clone)]
pub struct KeyPair {
    pub(crate) secret: crypto_box::SecretKey,
}

impl KeyPair {
    pub fn new() -> Self {
        Self::new_with_rng(&mut crypto_box::aead::OsRng)
    }

    pub fn new_with_rng<T: RngCore + CryptoRng>(rng: &mut T) -> Self {
        let secret = crypto_box::SecretKey::generate(rng);
        KeyPair { secret }
    }

    pub fn from(key: &PrivateKey) -> Self {
        KeyPair {
            secret: crypto_box::SecretKey::from(key.0),
        }
    }

    pub fn private(&self) -> PrivateKey {
        PrivateKey(self.secret.to_bytes())
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.secret.public_key())
    }
}

impl std::default::Default for KeyPair {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public())
            .finish()
    }
}

/// the private part of a [KeyPair]
pub struct PrivateKey(pub(crate) [u8; 32]);

impl PrivateKey {
    /// serializes to a byte array
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// serializes to an hex-encoded string
    pub fn to_bytes_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// deserializes from a byte array
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FormatError::InvalidKeySize(bytes.len()))?;
        Ok(PrivateKey(bytes))
    }

    /// deserializes from an hex-encoded string
    pub fn from_bytes_hex(str: &str) -> Result<Self, FormatError> {
        let bytes = hex::decode(str).map_err(|e| FormatError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// returns the matching public key
    pub fn public(&self) -> PublicKey {
        PublicKey(crypto_box::SecretKey::from(self.0).public_key())
    }
}

impl std::clone::Clone for PrivateKey {
    fn clone(&self) -> Self {
        PrivateKey(self.0)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey(..)")
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// the public part of a [KeyPair]
#[derive(Clone, Eq)]
pub struct PublicKey(pub(crate) crypto_box::PublicKey);

impl PublicKey {
    /// serializes to a byte array
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    /// serializes to an hex-encoded string
    pub fn to_bytes_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// deserializes from a byte array
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FormatError::InvalidKeySize(bytes.len()))?;
        Ok(PublicKey(crypto_box::PublicKey::from(bytes)))
    }

    /// deserializes from an hex-encoded string
    pub fn from_bytes_hex(str: &str) -> Result<Self, FormatError> {
        let bytes = hex::decode(str).map_err(|e| FormatError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "curve25519/{}", hex::encode(self.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{prelude::StdRng, SeedableRng};

    #[test]
    fn key_bytes_round_trip() {
        let mut rng: StdRng = SeedableRng::seed_from_u64(0);
        let kp = KeyPair::new_with_rng(&mut rng);

        let private = PrivateKey::from_bytes(&kp.private().to_bytes()).unwrap();
        assert_eq!(KeyPair::from(&private).public(), kp.public());

        let public = PublicKey::from_bytes(&kp.public().to_bytes()).unwrap();
        assert_eq!(public, kp.public());
    }

    #[test]
    fn hex_round_trip() {
        let kp = KeyPair::new();
        let hex = kp.public().to_bytes_hex();
        assert_eq!(PublicKey::from_bytes_hex(&hex).unwrap(), kp.public());
        assert!(kp.public().to_string().starts_with("curve25519/"));
    }

    #[test]
    fn rejects_bad_key_sizes() {
        assert_eq!(
            PublicKey::from_bytes(&[0u8; 16]),
            Err(FormatError::InvalidKeySize(16))
        );
        assert!(PrivateKey::from_bytes_hex("zz").is_err());
    }

    #[test]
    fn distinct_keys() {
        assert_ne!(KeyPair::new().public(), KeyPair::new().public());
    }
}
