//! Macaroon-based authorization
//!
//! This library lets a service decide whether a set of operations is
//! allowed for a request, where authority is carried by *macaroons*: bearer
//! tokens that anyone can attenuate by appending caveats, but nobody can
//! forge or widen. A service hands out macaroons tied to operations; a
//! client presents whatever macaroons it has collected, and the service's
//! checker works out whether they cover the request.
//!
//! Three outcomes are possible:
//!
//! * authorized, with an [`AuthInfo`] naming the responsible identity and
//!   the macaroons actually used;
//! * [`DischargeRequiredError`]: the request could be authorized if the
//!   client obtains proofs (*discharge macaroons*) from third parties; the
//!   error names the operations still pending and the caveats a freshly
//!   minted macaroon must carry;
//! * rejected.
//!
//! # Usage
//!
//! A [`Bakery`] wires up the usual pieces: a [`MacaroonStore`] minting and
//! verifying macaroons against root keys, and a [`Checker`] running the
//! authorization logic:
//!
//! ```rust
//! use std::sync::Arc;
//! use bakery_auth::{
//!     ACLAuthorizer, Bakery, BakeryParams, Context, MacaroonOpStore, Op, EVERYONE,
//! };
//!
//! fn main() -> Result<(), bakery_auth::Error> {
//!     // A service whose "read" ACL is open to everyone.
//!     let bakery = Bakery::new(BakeryParams {
//!         location: "example.com".to_owned(),
//!         authorizer: Some(Arc::new(ACLAuthorizer {
//!             allow_public: true,
//!             get_acl: |_: &Context, _: &Op| Ok::<_, bakery_auth::Error>(vec![EVERYONE.to_owned()]),
//!         })),
//!         ..BakeryParams::default()
//!     });
//!     let ctx = Context::background();
//!
//!     // Open access: no macaroons needed, no identity involved.
//!     let info = bakery
//!         .checker()
//!         .auth(vec![])
//!         .allow(&ctx, &[Op::new("something", "read")])?;
//!     assert!(info.identity.is_none());
//!     assert!(info.macaroons.is_empty());
//!
//!     // Mint a capability macaroon for the operation and use it alone.
//!     let ops = [Op::new("something", "read")];
//!     let m = bakery
//!         .store()
//!         .new_macaroon(&ctx, &ops, &[], bakery.checker().namespace())?;
//!     let info = bakery.checker().auth(vec![vec![m]]).allow(&ctx, &ops)?;
//!     assert_eq!(info.macaroons.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! # Concepts
//!
//! ## Caveats
//!
//! A macaroon's authority is restricted by its caveats. A *first party*
//! caveat is a condition the service checks itself (`time-before ...`,
//! `allow read`, `declared username bob`); the [`checkers`] registry
//! resolves conditions under namespaces and dispatches them to check
//! functions. A *third party* caveat can only be satisfied by a discharge
//! macaroon minted by the party at its location; its id seals the discharge
//! root key and condition under that party's public key, so nothing about
//! the condition leaks to anyone else.
//!
//! ## Discharges
//!
//! When authorization needs proofs the client does not hold, the checker
//! fails with [`DischargeRequiredError`]. The service turns that into a
//! macaroon carrying the named caveats; the client resolves every third
//! party caveat through [`discharge_all`], contacting each third party
//! ([`discharge`]) and binding the collected discharges to the primary
//! macaroon so the set is only usable together. Presented again, the
//! discharged set authorizes the request.
//!
//! ## Identity
//!
//! Authentication is just another discharge: an identity provider
//! discharges an `is-authenticated-user` caveat and declares the username
//! on the way. The resulting *login macaroon* satisfies the sentinel
//! [`Op::login`] operation and gives the [`Authorizer`] an identity to
//! decide ACLs against. The checker itself has no opinion about what an
//! identity is; see [`IdentityClient`].

pub mod authorizer;
pub mod bakery;
pub mod checker;
pub mod checkers;
mod codec;
pub mod context;
pub mod crypto;
pub mod discharge;
pub mod error;
pub mod identity;
pub mod macaroon;
pub mod opstore;
pub mod store;

pub use authorizer::{
    ACLAuthorizer, Authorizer, AuthorizerFunc, ClosedAuthorizer, OpenAuthorizer, EVERYONE,
};
pub use bakery::{Bakery, BakeryParams};
pub use checker::{AuthChecker, AuthInfo, Checker, CheckerParams, Op};
pub use checkers::{Caveat, FirstPartyCaveatChecker, Namespace, STD_NAMESPACE};
pub use context::{CancelHandle, Clock, Context, WallClock};
pub use crypto::{KeyPair, PrivateKey, PublicKey};
pub use discharge::{
    add_caveat, discharge, discharge_all, ThirdPartyCaveatChecker, ThirdPartyCaveatInfo,
    ThirdPartyInfo, ThirdPartyLocator, ThirdPartyStore, LATEST_VERSION,
};
pub use error::{DischargeRequiredError, Error, FormatError, VerificationError};
pub use identity::{Identity, IdentityClient, NoIdentities, SimpleIdentity};
pub use macaroon::{Macaroon, Slice};
pub use opstore::{canonical_ops, MacaroonOpStore, MacaroonStore};
pub use store::{MemRootKeyStore, RootKeyStore};
