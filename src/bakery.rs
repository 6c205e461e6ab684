//! convenience wiring
//!
//! A [`Bakery`] ties together the two halves a service needs: a
//! [`MacaroonStore`] to mint and verify macaroons, and a [`Checker`] to
//! authorize operations against them, sharing the same key, location and
//! third party locator.

use std::sync::Arc;

use crate::authorizer::Authorizer;
use crate::checker::{Checker, CheckerParams};
use crate::checkers::FirstPartyCaveatChecker;
use crate::crypto::KeyPair;
use crate::discharge::ThirdPartyLocator;
use crate::identity::IdentityClient;
use crate::opstore::{MacaroonOpStore, MacaroonStore};
use crate::store::{MemRootKeyStore, RootKeyStore};

/// configuration for [`Bakery::new`]; unset fields get sensible defaults
#[derive(Default)]
pub struct BakeryParams {
    /// the location set on minted macaroons
    pub location: String,
    /// the service's key pair; freshly generated when unset
    pub key: Option<KeyPair>,
    /// how third party locations are resolved; none discharge when unset
    pub locator: Option<Arc<dyn ThirdPartyLocator>>,
    /// root key storage; a single-key in-memory store when unset
    pub root_key_store: Option<Arc<dyn RootKeyStore>>,
    /// first party caveat checking; the standard conditions when unset
    pub checker: Option<Arc<dyn FirstPartyCaveatChecker>>,
    /// operation authorization; everything denied when unset
    pub authorizer: Option<Arc<dyn Authorizer>>,
    /// identity establishment; no identities when unset
    pub identity_client: Option<Arc<dyn IdentityClient>>,
}

/// a macaroon store and a checker wired to the same service
pub struct Bakery {
    checker: Checker,
    store: Arc<MacaroonStore>,
}

impl Bakery {
    pub fn new(p: BakeryParams) -> Bakery {
        let key = p.key.unwrap_or_default();
        let root_keys = p
            .root_key_store
            .unwrap_or_else(|| Arc::new(MemRootKeyStore::new()));
        let store = Arc::new(MacaroonStore::new(
            key,
            p.location,
            p.locator.clone(),
            root_keys,
        ));

        let mut params = CheckerParams::new(store.clone() as Arc<dyn MacaroonOpStore>);
        if let Some(checker) = p.checker {
            params = params.with_checker(checker);
        }
        if let Some(authorizer) = p.authorizer {
            params = params.with_authorizer(authorizer);
        }
        if let Some(identity_client) = p.identity_client {
            params = params.with_identity_client(identity_client);
        }
        if let Some(locator) = p.locator {
            params = params.with_locator(locator);
        }
        Bakery {
            checker: Checker::new(params),
            store,
        }
    }

    pub fn checker(&self) -> &Checker {
        &self.checker
    }

    pub fn store(&self) -> &Arc<MacaroonStore> {
        &self.store
    }
}
