//! third party caveats and discharges
//!
//! A third party caveat is only satisfied by a discharge macaroon minted by
//! the party at the caveat's location. This module covers the whole
//! life cycle: sealing a caveat for a third party ([`add_caveat`]), the
//! third party checking it and minting the discharge ([`discharge`]), and
//! the client side collecting every required discharge ([`discharge_all`]).
//!
//! The discharger and the locator naturally reference each other (a
//! discharge may itself carry third party caveats that need sealing), so
//! the locator is always passed in as a trait handle rather than owned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use rand::RngCore;
use tracing::debug;

use crate::checkers::{Caveat, Namespace};
use crate::codec;
use crate::context::Context;
use crate::crypto::{KeyPair, PublicKey};
use crate::error::Error;
use crate::macaroon::{self, Macaroon, Slice};

/// the highest third party caveat id version this implementation emits
pub const LATEST_VERSION: u32 = 3;

/// what a first party needs to know to seal caveats for a third party
#[derive(Clone, Debug, PartialEq)]
pub struct ThirdPartyInfo {
    pub public_key: PublicKey,
    /// the caveat id version the third party understands
    pub version: u32,
}

/// resolves third party locations to their public information
pub trait ThirdPartyLocator: Send + Sync {
    /// Returns information on the third party at `loc`, or
    /// [`Error::NotFound`] if the location is unknown.
    fn third_party_info(&self, ctx: &Context, loc: &str) -> Result<ThirdPartyInfo, Error>;
}

/// an in-memory [`ThirdPartyLocator`]
#[derive(Debug, Default)]
pub struct ThirdPartyStore {
    info: RwLock<HashMap<String, ThirdPartyInfo>>,
}

impl ThirdPartyStore {
    pub fn new() -> Self {
        ThirdPartyStore::default()
    }

    pub fn add_info(&self, loc: &str, info: ThirdPartyInfo) {
        self.info
            .write()
            .expect("third party store lock poisoned")
            .insert(loc.to_owned(), info);
    }
}

impl ThirdPartyLocator for ThirdPartyStore {
    fn third_party_info(&self, _ctx: &Context, loc: &str) -> Result<ThirdPartyInfo, Error> {
        self.info
            .read()
            .expect("third party store lock poisoned")
            .get(loc)
            .cloned()
            .ok_or(Error::NotFound)
    }
}

/// everything a third party learns when unsealing a caveat id
#[derive(Clone, Debug)]
pub struct ThirdPartyCaveatInfo {
    /// the condition the third party must check
    pub condition: String,
    /// the public key of the service that created the caveat
    pub first_party_public_key: PublicKey,
    /// the root key for the discharge macaroon
    pub root_key: Vec<u8>,
    /// the caveat id as it appears on the primary macaroon
    pub caveat: Vec<u8>,
    /// the id the discharge macaroon must carry so the verifier can match it
    pub macaroon_id: Vec<u8>,
    /// conditions the first party asked to be attached to the discharge
    pub seed_caveats: Vec<String>,
    /// the caveat id version the caveat was sealed with
    pub version: u32,
}

/// checks the condition of a third party caveat
pub trait ThirdPartyCaveatChecker: Send + Sync {
    /// Checks that the caveat condition holds, returning any further
    /// caveats the discharge macaroon must carry.
    fn check_third_party_caveat(
        &self,
        ctx: &Context,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>, Error>;
}

impl<F> ThirdPartyCaveatChecker for F
where
    F: Fn(&Context, &ThirdPartyCaveatInfo) -> Result<Vec<Caveat>, Error> + Send + Sync,
{
    fn check_third_party_caveat(
        &self,
        ctx: &Context,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>, Error> {
        self(ctx, info)
    }
}

/// Attaches a caveat to `m`, resolving first party caveats against `ns` and
/// sealing third party caveats for the party located through `locator`.
pub fn add_caveat(
    ctx: &Context,
    key: &KeyPair,
    locator: &dyn ThirdPartyLocator,
    m: &mut Macaroon,
    cav: &Caveat,
    ns: &Namespace,
) -> Result<(), Error> {
    if !cav.is_third_party() {
        let resolved = ns.resolve_caveat(cav);
        m.add_first_party_caveat(&resolved.condition);
        return Ok(());
    }
    ctx.check_live()?;
    let info = locator.third_party_info(ctx, &cav.location)?;
    let mut root_key = vec![0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut root_key);
    let id = codec::encode_caveat_id(&info, key, &root_key, &cav.condition, &[])?;
    m.add_third_party_caveat(&root_key, id, cav.location.clone())?;
    debug!(location = %cav.location, "sealed third party caveat");
    Ok(())
}

/// Discharges the caveat with the given id: unseals it with the third
/// party's `key`, runs `checker` on the condition, and mints the discharge
/// macaroon. The returned caveats must be attached to the discharge by the
/// caller (via [`add_caveat`]) before handing it out.
pub fn discharge(
    ctx: &Context,
    key: &KeyPair,
    checker: &dyn ThirdPartyCaveatChecker,
    caveat_id: &[u8],
) -> Result<(Macaroon, Vec<Caveat>), Error> {
    ctx.check_live()?;
    let info = codec::decode_caveat_id(key, caveat_id)?;
    let extra_caveats = checker.check_third_party_caveat(ctx, &info)?;
    debug!(condition = %info.condition, "discharging third party caveat");
    let mut m = Macaroon::new(
        &info.root_key,
        info.macaroon_id.clone(),
        "",
        macaroon::LATEST_VERSION,
    );
    for cond in &info.seed_caveats {
        m.add_first_party_caveat(cond);
    }
    Ok((m, extra_caveats))
}

/// Collects all discharges required by `primary`, walking the caveat tree
/// breadth first and calling `get_discharge` for each pending third party
/// caveat. Every discharge is bound to the primary's signature, so the
/// returned slice is only usable as a whole.
///
/// A caveat id encountered twice means the discharge graph has a cycle and
/// collection fails.
pub fn discharge_all<F>(
    ctx: &Context,
    primary: Macaroon,
    mut get_discharge: F,
) -> Result<Slice, Error>
where
    F: FnMut(&macaroon::Caveat) -> Result<Macaroon, Error>,
{
    let primary_signature = primary.signature();
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    let mut queue: VecDeque<macaroon::Caveat> = VecDeque::new();
    for cav in primary.third_party_caveats() {
        if !seen.insert(cav.id.clone()) {
            return Err(Error::DischargeCycle(
                String::from_utf8_lossy(&cav.id).into_owned(),
            ));
        }
        queue.push_back(cav);
    }

    let mut slice: Slice = vec![primary];
    while let Some(cav) = queue.pop_front() {
        ctx.check_live()?;
        let dm = get_discharge(&cav)?;
        for next in dm.third_party_caveats() {
            if !seen.insert(next.id.clone()) {
                return Err(Error::DischargeCycle(
                    String::from_utf8_lossy(&next.id).into_owned(),
                ));
            }
            queue.push_back(next);
        }
        slice.push(dm.bind_for_request(&primary_signature));
    }
    Ok(slice)
}
