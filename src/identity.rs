//! identity contracts
//!
//! The checker knows nothing about how identities are established; it asks
//! an [`IdentityClient`] to extract one from the request context or from the
//! `declared` caveats of a login macaroon, and hands the result to the
//! authorizer.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::checkers::Caveat;
use crate::context::Context;
use crate::error::Error;

/// an authenticated identity
pub trait Identity: std::fmt::Debug + Send + Sync {
    /// Returns the id of the user, which must be stable over time.
    fn id(&self) -> String;

    /// Returns the domain of the user, or the empty string if there is
    /// none.
    fn domain(&self) -> String;

    /// Reports whether the user is a member of any of the ACL's entries.
    /// `Ok(None)` means the identity does not support ACL membership and
    /// leaves the decision to the authorizer's public-access rules.
    fn allow(&self, ctx: &Context, acl: &[String]) -> Result<Option<bool>, Error> {
        let _ = (ctx, acl);
        Ok(None)
    }
}

/// An identity known only by name: it is a member of exactly the ACL
/// entries equal to its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimpleIdentity {
    id: String,
}

impl SimpleIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        SimpleIdentity { id: id.into() }
    }
}

impl Identity for SimpleIdentity {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn domain(&self) -> String {
        String::new()
    }

    fn allow(&self, _ctx: &Context, acl: &[String]) -> Result<Option<bool>, Error> {
        Ok(Some(acl.iter().any(|entry| *entry == self.id)))
    }
}

/// establishes identities for the checker
pub trait IdentityClient: Send + Sync {
    /// Returns the identity carried by the request context, if any.
    ///
    /// `(None, caveats)` means the caller has no identity yet, but
    /// discharging the given caveats (typically one third party caveat
    /// pointing at an identity provider) will establish one.
    fn identity_from_context(
        &self,
        ctx: &Context,
    ) -> Result<(Option<Arc<dyn Identity>>, Vec<Caveat>), Error>;

    /// Maps the declared key/value pairs found on a login macaroon to an
    /// identity.
    fn declared_identity(
        &self,
        declared: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn Identity>, Error>;
}

/// an [`IdentityClient`] for services that do no authentication at all
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIdentities;

impl IdentityClient for NoIdentities {
    fn identity_from_context(
        &self,
        _ctx: &Context,
    ) -> Result<(Option<Arc<dyn Identity>>, Vec<Caveat>), Error> {
        Ok((None, Vec::new()))
    }

    fn declared_identity(
        &self,
        _declared: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn Identity>, Error> {
        Err(Error::other("no identity declared or possible"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_identity_acl_membership() {
        let ctx = Context::background();
        let bob = SimpleIdentity::new("bob");
        assert_eq!(bob.id(), "bob");
        assert_eq!(bob.domain(), "");
        assert_eq!(
            bob.allow(&ctx, &["alice".to_owned(), "bob".to_owned()]),
            Ok(Some(true))
        );
        assert_eq!(bob.allow(&ctx, &["alice".to_owned()]), Ok(Some(false)));
        assert_eq!(bob.allow(&ctx, &[]), Ok(Some(false)));
    }

    #[test]
    fn no_identities() {
        let ctx = Context::background();
        let (identity, caveats) = NoIdentities.identity_from_context(&ctx).unwrap();
        assert!(identity.is_none());
        assert!(caveats.is_empty());
        assert!(NoIdentities.declared_identity(&BTreeMap::new()).is_err());
    }
}
