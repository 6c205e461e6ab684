//! authorization of operations for an identity
//!
//! When presented macaroons do not directly cover an operation, the checker
//! consults an [`Authorizer`]: given the authenticated identity (if any) and
//! the pending operations, it reports which are allowed and may demand
//! further third party caveats be discharged first.

use crate::checker::Op;
use crate::checkers::Caveat;
use crate::context::Context;
use crate::error::Error;
use crate::identity::Identity;

/// the ACL entry that stands for any user, authenticated or not
pub const EVERYONE: &str = "everyone";

/// decides which operations an identity may perform
pub trait Authorizer: Send + Sync {
    /// Authorizes `ops` for `identity`, returning one decision per
    /// operation (parallel to `ops`) plus any caveats that must hold for
    /// the authorization to be valid.
    fn authorize(
        &self,
        ctx: &Context,
        identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), Error>;
}

/// an [`Authorizer`] that never allows anything
#[derive(Clone, Copy, Debug, Default)]
pub struct ClosedAuthorizer;

impl Authorizer for ClosedAuthorizer {
    fn authorize(
        &self,
        _ctx: &Context,
        _identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), Error> {
        Ok((vec![false; ops.len()], Vec::new()))
    }
}

/// an [`Authorizer`] that allows everything
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenAuthorizer;

impl Authorizer for OpenAuthorizer {
    fn authorize(
        &self,
        _ctx: &Context,
        _identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), Error> {
        Ok((vec![true; ops.len()], Vec::new()))
    }
}

/// adapts a per-operation closure into an [`Authorizer`]
pub struct AuthorizerFunc<F>(pub F);

impl<F> Authorizer for AuthorizerFunc<F>
where
    F: Fn(&Context, Option<&dyn Identity>, &Op) -> Result<(bool, Vec<Caveat>), Error>
        + Send
        + Sync,
{
    fn authorize(
        &self,
        ctx: &Context,
        identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), Error> {
        let mut allowed = Vec::with_capacity(ops.len());
        let mut caveats = Vec::new();
        for op in ops {
            let (ok, mut extra) = (self.0)(ctx, identity, op)?;
            allowed.push(ok);
            caveats.append(&mut extra);
        }
        Ok((allowed, caveats))
    }
}

/// An [`Authorizer`] that looks each operation up in an ACL.
///
/// Membership is decided by the identity itself (via
/// [`Identity::allow`]) when it supports ACLs; otherwise, and for
/// unauthenticated requests, an operation is allowed only when
/// `allow_public` is set and its ACL contains [`EVERYONE`]. The login
/// operation is never granted through an ACL.
pub struct ACLAuthorizer<F> {
    pub allow_public: bool,
    pub get_acl: F,
}

impl<F> Authorizer for ACLAuthorizer<F>
where
    F: Fn(&Context, &Op) -> Result<Vec<String>, Error> + Send + Sync,
{
    fn authorize(
        &self,
        ctx: &Context,
        identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), Error> {
        let mut allowed = vec![false; ops.len()];
        for (i, op) in ops.iter().enumerate() {
            if op.is_login() {
                // Authentication can only come from identity extraction.
                continue;
            }
            let acl = (self.get_acl)(ctx, op)?;
            let public = self.allow_public && acl.iter().any(|entry| entry == EVERYONE);
            allowed[i] = match identity {
                Some(identity) => match identity.allow(ctx, &acl)? {
                    Some(member) => member,
                    None => public,
                },
                None => public,
            };
        }
        Ok((allowed, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SimpleIdentity;

    fn read_op(entity: &str) -> Op {
        Op {
            entity: entity.to_owned(),
            action: "read".to_owned(),
        }
    }

    #[test]
    fn closed_and_open() {
        let ctx = Context::background();
        let ops = [read_op("e1"), read_op("e2")];
        assert_eq!(
            ClosedAuthorizer.authorize(&ctx, None, &ops).unwrap().0,
            vec![false, false]
        );
        assert_eq!(
            OpenAuthorizer.authorize(&ctx, None, &ops).unwrap().0,
            vec![true, true]
        );
    }

    #[test]
    fn acl_membership_is_checked_by_the_identity() {
        let ctx = Context::background();
        let auth = ACLAuthorizer {
            allow_public: false,
            get_acl: |_: &Context, op: &Op| {
                if op.entity == "e1" {
                    Ok(vec!["bob".to_owned()])
                } else {
                    Ok(vec!["alice".to_owned()])
                }
            },
        };
        let bob = SimpleIdentity::new("bob");
        let (allowed, caveats) = auth
            .authorize(&ctx, Some(&bob), &[read_op("e1"), read_op("e2")])
            .unwrap();
        assert_eq!(allowed, vec![true, false]);
        assert!(caveats.is_empty());
    }

    #[test]
    fn everyone_requires_allow_public() {
        let ctx = Context::background();
        let acl = |_: &Context, _: &Op| Ok(vec![EVERYONE.to_owned()]);

        let open = ACLAuthorizer {
            allow_public: true,
            get_acl: acl,
        };
        assert_eq!(open.authorize(&ctx, None, &[read_op("e1")]).unwrap().0, vec![true]);

        let closed = ACLAuthorizer {
            allow_public: false,
            get_acl: acl,
        };
        assert_eq!(
            closed.authorize(&ctx, None, &[read_op("e1")]).unwrap().0,
            vec![false]
        );
    }

    #[test]
    fn login_is_never_granted_via_acl() {
        let ctx = Context::background();
        let auth = ACLAuthorizer {
            allow_public: true,
            get_acl: |_: &Context, _: &Op| Ok(vec![EVERYONE.to_owned(), "bob".to_owned()]),
        };
        let bob = SimpleIdentity::new("bob");
        let (allowed, _) = auth.authorize(&ctx, Some(&bob), &[Op::login()]).unwrap();
        assert_eq!(allowed, vec![false]);
    }

    #[test]
    fn authorizer_func_collects_caveats() {
        let ctx = Context::background();
        let auth = AuthorizerFunc(|_: &Context, _: Option<&dyn Identity>, op: &Op| {
            if op.entity == "e1" {
                Ok((
                    true,
                    vec![crate::checkers::Caveat {
                        condition: "question".to_owned(),
                        namespace: String::new(),
                        location: "other".to_owned(),
                    }],
                ))
            } else {
                Ok((false, Vec::new()))
            }
        });
        let (allowed, caveats) = auth
            .authorize(&ctx, None, &[read_op("e1"), read_op("e2")])
            .unwrap();
        assert_eq!(allowed, vec![true, false]);
        assert_eq!(caveats.len(), 1);
    }
}
