//! third party caveat id encoding
//!
//! A third party caveat's id carries everything the third party needs to
//! produce a discharge: the caveat's root key and condition, sealed with
//! authenticated public-key encryption so only the third party can read
//! them. The layout is versioned:
//!
//! ```text
//! [version byte] [first party public key (32)] [nonce (24)] [box ciphertext]
//! ```
//!
//! Version 3 (the latest) seals a JSON payload; version 2 seals the legacy
//! `rootkey-base64 \n condition` layout. Both are recognized on decode and
//! any other version byte is rejected.

use serde::{Deserialize, Serialize};

use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::SalsaBox;

use crate::crypto::{KeyPair, PublicKey};
use crate::discharge::{ThirdPartyCaveatInfo, ThirdPartyInfo};
use crate::error::{Error, FormatError};

const PUBLIC_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const BOX_OVERHEAD: usize = 16;

#[derive(Serialize, Deserialize)]
struct CaveatIdPayloadV3 {
    #[serde(rename = "c")]
    condition: String,
    #[serde(rename = "k")]
    root_key: String,
    #[serde(rename = "fp", skip_serializing_if = "Vec::is_empty", default)]
    seed_caveats: Vec<String>,
}

/// Seals `condition` and `root_key` for the third party described by `info`,
/// producing the caveat id placed on the macaroon.
pub(crate) fn encode_caveat_id(
    info: &ThirdPartyInfo,
    first_party: &KeyPair,
    root_key: &[u8],
    condition: &str,
    seed_caveats: &[String],
) -> Result<Vec<u8>, Error> {
    let version = if info.version >= 3 { 3u8 } else { 2 };
    let payload = match version {
        3 => serde_json::to_vec(&CaveatIdPayloadV3 {
            condition: condition.to_owned(),
            root_key: base64::encode_config(root_key, base64::URL_SAFE_NO_PAD),
            seed_caveats: seed_caveats.to_vec(),
        })
        .map_err(|e| FormatError::Serialization(e.to_string()))?,
        _ => {
            let mut payload = base64::encode_config(root_key, base64::URL_SAFE_NO_PAD).into_bytes();
            payload.push(b'\n');
            payload.extend_from_slice(condition.as_bytes());
            payload
        }
    };

    let sealer = SalsaBox::new(&info.public_key.0, &first_party.secret);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let sealed = sealer
        .encrypt(&nonce, payload.as_slice())
        .map_err(|e| FormatError::Encryption(e.to_string()))?;

    let mut id = Vec::with_capacity(1 + PUBLIC_KEY_LEN + NONCE_LEN + sealed.len());
    id.push(version);
    id.extend_from_slice(&first_party.public().to_bytes());
    id.extend_from_slice(&nonce);
    id.extend_from_slice(&sealed);
    Ok(id)
}

/// Unseals a caveat id with the third party's key pair, recovering the
/// condition and discharge root key.
pub(crate) fn decode_caveat_id(
    key: &KeyPair,
    caveat_id: &[u8],
) -> Result<ThirdPartyCaveatInfo, Error> {
    let version = *caveat_id
        .first()
        .ok_or_else(|| FormatError::Deserialization("empty caveat id".to_owned()))?;
    if version != 2 && version != 3 {
        return Err(FormatError::UnknownVersion(u32::from(version)).into());
    }
    if caveat_id.len() < 1 + PUBLIC_KEY_LEN + NONCE_LEN + BOX_OVERHEAD {
        return Err(FormatError::Deserialization("caveat id too short".to_owned()).into());
    }
    let first_party_public_key = PublicKey::from_bytes(&caveat_id[1..1 + PUBLIC_KEY_LEN])?;
    let nonce = &caveat_id[1 + PUBLIC_KEY_LEN..1 + PUBLIC_KEY_LEN + NONCE_LEN];
    let sealed = &caveat_id[1 + PUBLIC_KEY_LEN + NONCE_LEN..];

    let sealer = SalsaBox::new(&first_party_public_key.0, &key.secret);
    let payload = sealer
        .decrypt(crypto_box::Nonce::from_slice(nonce), sealed)
        .map_err(|_| FormatError::Decryption("caveat id does not unseal".to_owned()))?;

    let (condition, root_key, seed_caveats) = match version {
        3 => {
            let payload: CaveatIdPayloadV3 = serde_json::from_slice(&payload)
                .map_err(|e| FormatError::Deserialization(e.to_string()))?;
            let root_key = base64::decode_config(&payload.root_key, base64::URL_SAFE_NO_PAD)?;
            (payload.condition, root_key, payload.seed_caveats)
        }
        _ => {
            let text = String::from_utf8(payload).map_err(|_| {
                FormatError::Deserialization("caveat payload is not valid utf-8".to_owned())
            })?;
            let (root_key64, condition) = text.split_once('\n').ok_or_else(|| {
                FormatError::Deserialization("caveat payload has no condition".to_owned())
            })?;
            let root_key = base64::decode_config(root_key64, base64::URL_SAFE_NO_PAD)?;
            (condition.to_owned(), root_key, Vec::new())
        }
    };

    Ok(ThirdPartyCaveatInfo {
        condition,
        first_party_public_key,
        root_key,
        caveat: caveat_id.to_vec(),
        macaroon_id: caveat_id.to_vec(),
        seed_caveats,
        version: u32::from(version),
    })
}
