//! the macaroon primitive
//!
//! A macaroon is a bearer token whose authority is progressively attenuated
//! by appending caveats. The signature is an HMAC-SHA256 chain seeded by a
//! root key known only to the minting service:
//!
//! ```text
//! sig_0 = HMAC(derive(root_key), id)
//! sig_i = HMAC(sig_{i-1}, caveat_i)
//! ```
//!
//! Any holder can append caveats without contacting the issuer; nobody can
//! remove one without invalidating the chain. A third party caveat carries a
//! verification id: the caveat's own root key, sealed under the signature at
//! the point the caveat was added, so the verifier can recover it while
//! walking the chain. Discharge macaroons prove such caveats and are bound
//! to the primary's final signature, making them useless with any other
//! primary.
//!
//! Wire encodings (V1/V2, binary and JSON) live in [`format`].

mod format;

use hmac::{Hmac, Mac};
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key as SecretBoxKey, Nonce, XSalsa20Poly1305};

use crate::context::Context;
use crate::error::{Error, FormatError, VerificationError};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const SIG_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const BOX_OVERHEAD: usize = 16;

/// wire format versions understood by this implementation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V1 = 1,
    V2 = 2,
}

/// the highest wire version this implementation emits
pub const LATEST_VERSION: Version = Version::V2;

impl Version {
    pub fn from_u32(v: u32) -> Result<Version, FormatError> {
        match v {
            1 => Ok(Version::V1),
            2 => Ok(Version::V2),
            other => Err(FormatError::UnknownVersion(other)),
        }
    }
}

/// a single caveat in a macaroon's chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caveat {
    /// the condition (first party) or opaque sealed identifier (third party)
    pub id: Vec<u8>,
    /// the sealed discharge root key; empty for first party caveats
    pub verification_id: Vec<u8>,
    /// discharge location hint; empty for first party caveats
    pub location: String,
}

impl Caveat {
    pub fn is_third_party(&self) -> bool {
        !self.verification_id.is_empty()
    }
}

/// a primary macaroon followed by its discharge macaroons
pub type Slice = Vec<Macaroon>;

/// a macaroon with its HMAC-SHA256 signature chain
#[derive(Clone, PartialEq, Eq)]
pub struct Macaroon {
    pub(crate) location: String,
    pub(crate) id: Vec<u8>,
    pub(crate) caveats: Vec<Caveat>,
    pub(crate) signature: [u8; SIG_LEN],
    pub(crate) version: Version,
}

impl Macaroon {
    /// mints a macaroon for the given root key, id and location
    pub fn new(
        root_key: &[u8],
        id: impl Into<Vec<u8>>,
        location: impl Into<String>,
        version: Version,
    ) -> Macaroon {
        let id = id.into();
        let signature = keyed_hash(&macaroon_key(root_key), &id);
        Macaroon {
            location: location.into(),
            id,
            caveats: Vec::new(),
            signature,
            version,
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    pub fn signature(&self) -> [u8; SIG_LEN] {
        self.signature
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// the third party caveats that still need discharging
    pub fn third_party_caveats(&self) -> Vec<Caveat> {
        self.caveats
            .iter()
            .filter(|cav| cav.is_third_party())
            .cloned()
            .collect()
    }

    /// Attenuates the macaroon with a condition checked by the target
    /// service itself. Any holder may do this; the root key is not needed.
    pub fn add_first_party_caveat(&mut self, condition: &str) {
        self.signature = keyed_hash(&self.signature, condition.as_bytes());
        self.caveats.push(Caveat {
            id: condition.as_bytes().to_vec(),
            verification_id: Vec::new(),
            location: String::new(),
        });
    }

    /// Attenuates the macaroon with a caveat that must be discharged by a
    /// third party holding `caveat_key`. The key is sealed under the current
    /// chain signature so the verifier can recover it.
    pub fn add_third_party_caveat(
        &mut self,
        caveat_key: &[u8],
        id: impl Into<Vec<u8>>,
        location: impl Into<String>,
    ) -> Result<(), Error> {
        self.add_third_party_caveat_with_rng(caveat_key, id, location, &mut rand::rngs::OsRng)
    }

    pub fn add_third_party_caveat_with_rng<T: RngCore + CryptoRng>(
        &mut self,
        caveat_key: &[u8],
        id: impl Into<Vec<u8>>,
        location: impl Into<String>,
        rng: &mut T,
    ) -> Result<(), Error> {
        let id = id.into();
        let derived = macaroon_key(caveat_key);

        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let cipher = XSalsa20Poly1305::new(SecretBoxKey::from_slice(&self.signature));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), derived.as_slice())
            .map_err(|e| FormatError::Encryption(e.to_string()))?;
        let mut verification_id = nonce.to_vec();
        verification_id.extend_from_slice(&sealed);

        self.signature = keyed_hash2(&self.signature, &verification_id, &id);
        self.caveats.push(Caveat {
            id,
            verification_id,
            location: location.into(),
        });
        Ok(())
    }

    /// Binds a discharge macaroon to the primary's signature so the two are
    /// only usable together. Returns the bound copy; the original stays
    /// valid for binding to other primaries.
    pub fn bind_for_request(&self, primary_signature: &[u8; SIG_LEN]) -> Macaroon {
        let mut bound = self.clone();
        bound.signature = bind_signature(primary_signature, &self.signature);
        bound
    }

    /// Verifies the signature chain of this macaroon and its discharges,
    /// returning every first party caveat condition found in the slice.
    ///
    /// Each discharge must have been bound to this macaroon's signature and
    /// is consumed exactly once; a discharge that tries to discharge itself,
    /// directly or through a cycle, fails with a missing-discharge error.
    pub fn verify_signature(
        &self,
        root_key: &[u8],
        discharges: &[Macaroon],
    ) -> Result<Vec<String>, VerificationError> {
        let mut used = vec![false; discharges.len()];
        let mut conditions = Vec::new();
        self.verify_chain(
            &self.signature,
            &macaroon_key(root_key),
            true,
            discharges,
            &mut used,
            &mut conditions,
        )?;
        if let Some(i) = used.iter().position(|u| !u) {
            return Err(VerificationError::UnusedDischarge(
                String::from_utf8_lossy(&discharges[i].id).into_owned(),
            ));
        }
        Ok(conditions)
    }

    /// Verifies the signature chain and checks every first party condition
    /// with `check`.
    pub fn verify<F>(
        &self,
        root_key: &[u8],
        check: F,
        discharges: &[Macaroon],
    ) -> Result<(), Error>
    where
        F: Fn(&Context, &str) -> Result<(), Error>,
    {
        let ctx = Context::background();
        self.verify_with_context(&ctx, root_key, check, discharges)
    }

    pub fn verify_with_context<F>(
        &self,
        ctx: &Context,
        root_key: &[u8],
        check: F,
        discharges: &[Macaroon],
    ) -> Result<(), Error>
    where
        F: Fn(&Context, &str) -> Result<(), Error>,
    {
        let conditions = self.verify_signature(root_key, discharges)?;
        for cond in &conditions {
            check(ctx, cond)?;
        }
        Ok(())
    }

    fn verify_chain(
        &self,
        primary_signature: &[u8; SIG_LEN],
        key: &[u8; SIG_LEN],
        is_primary: bool,
        discharges: &[Macaroon],
        used: &mut [bool],
        conditions: &mut Vec<String>,
    ) -> Result<(), VerificationError> {
        let mut sig = keyed_hash(key, &self.id);
        for cav in &self.caveats {
            if cav.is_third_party() {
                let caveat_key = open_verification_id(&sig, &cav.verification_id)?;
                let index = discharges
                    .iter()
                    .enumerate()
                    .position(|(i, d)| !used[i] && d.id == cav.id)
                    .ok_or_else(|| {
                        VerificationError::DischargeNotFound(
                            String::from_utf8_lossy(&cav.id).into_owned(),
                        )
                    })?;
                used[index] = true;
                discharges[index].verify_chain(
                    primary_signature,
                    &caveat_key,
                    false,
                    discharges,
                    used,
                    conditions,
                )?;
                sig = keyed_hash2(&sig, &cav.verification_id, &cav.id);
            } else {
                let cond = std::str::from_utf8(&cav.id)
                    .map_err(|_| VerificationError::InvalidCondition)?;
                conditions.push(cond.to_owned());
                sig = keyed_hash(&sig, &cav.id);
            }
        }
        let expected = if is_primary {
            sig
        } else {
            bind_signature(primary_signature, &sig)
        };
        if !bool::from(expected.ct_eq(&self.signature)) {
            return Err(VerificationError::InvalidSignature);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Macaroon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Macaroon(id={:?}, loc={:?}, caveats={}, sig={}..)",
            String::from_utf8_lossy(&self.id),
            self.location,
            self.caveats.len(),
            hex::encode(&self.signature[..4]),
        )
    }
}

/// Derives the HMAC chain key from a root key of any length.
pub(crate) fn macaroon_key(root_key: &[u8]) -> [u8; SIG_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"macaroons-key-generator")
        .expect("hmac accepts keys of any length");
    mac.update(root_key);
    mac.finalize().into_bytes().into()
}

fn keyed_hash(key: &[u8; SIG_LEN], data: &[u8]) -> [u8; SIG_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn keyed_hash2(key: &[u8; SIG_LEN], d1: &[u8], d2: &[u8]) -> [u8; SIG_LEN] {
    let mut data = [0u8; SIG_LEN * 2];
    data[..SIG_LEN].copy_from_slice(&keyed_hash(key, d1));
    data[SIG_LEN..].copy_from_slice(&keyed_hash(key, d2));
    keyed_hash(key, &data)
}

fn bind_signature(
    primary_signature: &[u8; SIG_LEN],
    discharge_signature: &[u8; SIG_LEN],
) -> [u8; SIG_LEN] {
    if primary_signature == discharge_signature {
        return *primary_signature;
    }
    keyed_hash2(&[0u8; SIG_LEN], primary_signature, discharge_signature)
}

fn open_verification_id(
    sig: &[u8; SIG_LEN],
    verification_id: &[u8],
) -> Result<[u8; SIG_LEN], VerificationError> {
    if verification_id.len() < NONCE_LEN + BOX_OVERHEAD {
        return Err(VerificationError::InvalidSignature);
    }
    let (nonce, sealed) = verification_id.split_at(NONCE_LEN);
    let cipher = XSalsa20Poly1305::new(SecretBoxKey::from_slice(sig));
    let key = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| VerificationError::InvalidSignature)?;
    key.as_slice()
        .try_into()
        .map_err(|_| VerificationError::InvalidSignature)
}
