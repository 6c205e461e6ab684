//! the macaroon op store
//!
//! The op store is the sole authority on what operations a verified
//! macaroon confers. Minting encodes the operations into the macaroon id
//! together with the root key's storage id and a random nonce; recovery
//! decodes the id, fetches the root key, verifies the whole slice and
//! returns the declared operations plus the first party conditions that
//! still need checking.
//!
//! The id encoding is versioned: a leading version byte followed by a JSON
//! payload. Ids with an unknown version byte are rejected with a
//! verification error, like any other macaroon this store cannot vouch for.

use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checker::Op;
use crate::checkers::{Caveat, Namespace};
use crate::context::Context;
use crate::crypto::KeyPair;
use crate::discharge::{add_caveat, ThirdPartyInfo, ThirdPartyLocator};
use crate::error::{Error, VerificationError};
use crate::macaroon::{Macaroon, LATEST_VERSION};
use crate::store::RootKeyStore;

const LATEST_ID_VERSION: u8 = 3;
const LEGACY_ID_VERSION: u8 = 2;

/// mints macaroons bound to operations and recovers those operations
pub trait MacaroonOpStore: Send + Sync {
    /// Mints a macaroon conferring `ops`, carrying the given caveats
    /// resolved against `ns`.
    fn new_macaroon(
        &self,
        ctx: &Context,
        ops: &[Op],
        caveats: &[Caveat],
        ns: &Namespace,
    ) -> Result<Macaroon, Error>;

    /// Verifies a presented macaroon slice and returns the operations it
    /// confers plus the first party caveat conditions that remain to be
    /// checked. Fails with a [`VerificationError`] when the slice cannot be
    /// vouched for; any other error is fatal.
    fn macaroon_ops(&self, ctx: &Context, ms: &[Macaroon]) -> Result<(Vec<Op>, Vec<String>), Error>;
}

#[derive(Serialize, Deserialize)]
struct MacaroonIdPayload {
    #[serde(rename = "n")]
    nonce: String,
    #[serde(rename = "k")]
    storage_id: String,
    #[serde(rename = "ops")]
    ops: Vec<(String, String)>,
}

#[derive(Deserialize)]
struct LegacyIdPayload {
    #[serde(rename = "k")]
    storage_id: String,
    #[serde(rename = "ops")]
    ops: Vec<(String, String)>,
}

/// the standard op store, backed by a [`RootKeyStore`]
pub struct MacaroonStore {
    key: KeyPair,
    location: String,
    locator: Option<Arc<dyn ThirdPartyLocator>>,
    root_keys: Arc<dyn RootKeyStore>,
}

struct NoThirdParties;

impl ThirdPartyLocator for NoThirdParties {
    fn third_party_info(&self, _ctx: &Context, _loc: &str) -> Result<ThirdPartyInfo, Error> {
        Err(Error::NotFound)
    }
}

impl MacaroonStore {
    pub fn new(
        key: KeyPair,
        location: impl Into<String>,
        locator: Option<Arc<dyn ThirdPartyLocator>>,
        root_keys: Arc<dyn RootKeyStore>,
    ) -> Self {
        MacaroonStore {
            key,
            location: location.into(),
            locator,
            root_keys,
        }
    }

    /// the key pair this store seals third party caveats with
    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    fn decode_macaroon_id(&self, id: &[u8]) -> Result<(Vec<u8>, Vec<Op>), VerificationError> {
        let version = *id
            .first()
            .ok_or_else(|| VerificationError::InvalidId("empty macaroon id".to_owned()))?;
        let (storage_id64, ops) = match version {
            LATEST_ID_VERSION => {
                let payload: MacaroonIdPayload = serde_json::from_slice(&id[1..])
                    .map_err(|e| VerificationError::InvalidId(e.to_string()))?;
                (payload.storage_id, payload.ops)
            }
            LEGACY_ID_VERSION => {
                let payload: LegacyIdPayload = serde_json::from_slice(&id[1..])
                    .map_err(|e| VerificationError::InvalidId(e.to_string()))?;
                (payload.storage_id, payload.ops)
            }
            other => return Err(VerificationError::UnknownIdVersion(u32::from(other))),
        };
        let storage_id = base64::decode_config(storage_id64, base64::URL_SAFE_NO_PAD)
            .map_err(|e| VerificationError::InvalidId(e.to_string()))?;
        let ops = ops
            .into_iter()
            .map(|(entity, action)| Op { entity, action })
            .collect();
        Ok((storage_id, ops))
    }
}

impl MacaroonOpStore for MacaroonStore {
    fn new_macaroon(
        &self,
        ctx: &Context,
        ops: &[Op],
        caveats: &[Caveat],
        ns: &Namespace,
    ) -> Result<Macaroon, Error> {
        let ops = canonical_ops(ops);
        if ops.is_empty() {
            return Err(Error::other(
                "cannot mint a macaroon associated with no operations",
            ));
        }
        if ops.iter().any(|op| op.entity.is_empty() || op.action.is_empty()) {
            return Err(Error::other("invalid operation entity or action"));
        }
        ctx.check_live()?;
        let (root_key, storage_id) = self.root_keys.root_key(ctx)?;

        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let payload = MacaroonIdPayload {
            nonce: base64::encode_config(nonce, base64::URL_SAFE_NO_PAD),
            storage_id: base64::encode_config(&storage_id, base64::URL_SAFE_NO_PAD),
            ops: ops
                .iter()
                .map(|op| (op.entity.clone(), op.action.clone()))
                .collect(),
        };
        let mut id = vec![LATEST_ID_VERSION];
        id.extend_from_slice(
            &serde_json::to_vec(&payload)
                .map_err(|e| crate::error::FormatError::Serialization(e.to_string()))?,
        );

        let mut m = Macaroon::new(&root_key, id, self.location.clone(), LATEST_VERSION);
        let locator: &dyn ThirdPartyLocator = match &self.locator {
            Some(locator) => locator.as_ref(),
            None => &NoThirdParties,
        };
        for cav in caveats {
            add_caveat(ctx, &self.key, locator, &mut m, cav, ns)?;
        }
        Ok(m)
    }

    fn macaroon_ops(&self, ctx: &Context, ms: &[Macaroon]) -> Result<(Vec<Op>, Vec<String>), Error> {
        let primary = match ms.first() {
            Some(primary) => primary,
            None => return Err(VerificationError::EmptySlice.into()),
        };
        let (storage_id, ops) = self.decode_macaroon_id(primary.id())?;
        ctx.check_live()?;
        let root_key = self.root_keys.get(ctx, &storage_id).map_err(|e| match e {
            Error::NotFound => VerificationError::RootKeyNotFound.into(),
            other => other,
        })?;
        let conditions = primary.verify_signature(&root_key, &ms[1..]).map_err(|e| {
            debug!(error = %e, "macaroon failed verification");
            e
        })?;
        Ok((ops, conditions))
    }
}

/// Sorts and deduplicates a set of operations; macaroon ids always carry
/// operations in canonical order.
pub fn canonical_ops(ops: &[Op]) -> Vec<Op> {
    let mut ops = ops.to_vec();
    ops.sort();
    ops.dedup();
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers;
    use crate::checkers::FirstPartyCaveatChecker;
    use crate::store::MemRootKeyStore;

    fn store() -> MacaroonStore {
        MacaroonStore::new(
            KeyPair::new(),
            "test-service",
            None,
            Arc::new(MemRootKeyStore::new()),
        )
    }

    fn read_op(entity: &str) -> Op {
        Op {
            entity: entity.to_owned(),
            action: "read".to_owned(),
        }
    }

    #[test]
    fn ops_round_trip() {
        let ctx = Context::background();
        let store = store();
        let ns = checkers::Checker::new().namespace().clone();
        let ops = vec![read_op("e2"), read_op("e1"), read_op("e2")];

        let m = store.new_macaroon(&ctx, &ops, &[], &ns).unwrap();
        let (got_ops, conditions) = store.macaroon_ops(&ctx, &[m]).unwrap();
        assert_eq!(got_ops, vec![read_op("e1"), read_op("e2")]);
        assert!(conditions.is_empty());
    }

    #[test]
    fn conditions_are_returned_for_checking() {
        let ctx = Context::background();
        let store = store();
        let ns = checkers::Checker::new().namespace().clone();
        let caveats = vec![
            checkers::declared_caveat("username", "bob"),
            checkers::allow_caveat(&["read"]),
        ];
        let m = store
            .new_macaroon(&ctx, &[read_op("e1")], &caveats, &ns)
            .unwrap();
        let (_, conditions) = store.macaroon_ops(&ctx, &[m]).unwrap();
        assert_eq!(
            conditions,
            vec!["declared username bob".to_owned(), "allow read".to_owned()]
        );
    }

    #[test]
    fn tampered_macaroon_fails_verification() {
        let ctx = Context::background();
        let store = store();
        let ns = checkers::Checker::new().namespace().clone();
        let mut m = store
            .new_macaroon(&ctx, &[read_op("e1")], &[], &ns)
            .unwrap();
        m.add_first_party_caveat("true 1");
        // Attenuation is fine.
        assert!(store.macaroon_ops(&ctx, std::slice::from_ref(&m)).is_ok());

        // Stripping the caveat afterwards is not; mint a fresh macaroon and
        // splice its id onto a different signature chain.
        let other = store
            .new_macaroon(&ctx, &[read_op("e2")], &[], &ns)
            .unwrap();
        let mut forged = m.clone();
        forged.caveats.clear();
        forged.signature = other.signature();
        assert!(matches!(
            store.macaroon_ops(&ctx, &[forged]),
            Err(Error::Verification(VerificationError::InvalidSignature))
        ));
    }

    #[test]
    fn unknown_id_versions_are_rejected() {
        let ctx = Context::background();
        let store = store();
        let m = Macaroon::new(b"whatever", vec![9u8, b'{', b'}'], "loc", LATEST_VERSION);
        assert!(matches!(
            store.macaroon_ops(&ctx, &[m]),
            Err(Error::Verification(VerificationError::UnknownIdVersion(9)))
        ));
    }

    #[test]
    fn unknown_root_key_is_a_verification_error() {
        let ctx = Context::background();
        let minting = store();
        let verifying = store();
        let ns = checkers::Checker::new().namespace().clone();
        // A different store has a different root key under the same id, so
        // the signature does not match.
        let m = minting
            .new_macaroon(&ctx, &[read_op("e1")], &[], &ns)
            .unwrap();
        let err = verifying.macaroon_ops(&ctx, &[m]).unwrap_err();
        assert!(err.is_verification_error());
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let ctx = Context::background();
        let store = store();
        let ns = checkers::Checker::new().namespace().clone();
        assert!(store.new_macaroon(&ctx, &[], &[], &ns).is_err());
        assert!(matches!(
            store.macaroon_ops(&ctx, &[]),
            Err(Error::Verification(VerificationError::EmptySlice))
        ));
    }

    #[test]
    fn canonical_ops_sorts_and_dedups() {
        let ops = vec![read_op("b"), read_op("a"), read_op("b")];
        assert_eq!(canonical_ops(&ops), vec![read_op("a"), read_op("b")]);
        assert!(canonical_ops(&[]).is_empty());
    }
}
