//! the authorization engine
//!
//! A [`Checker`] decides whether a set of operations is allowed for a
//! request, given the macaroons presented with it. Authority can come from
//! two directions:
//!
//! * a *capability* path: a presented macaroon directly confers the
//!   operation and all its first party caveats hold;
//! * an *identity* path: an identity is established (from a login macaroon
//!   or from the request context) and the [`Authorizer`] allows the
//!   operation for it.
//!
//! When neither applies but more discharges would help, the checker fails
//! with a [`DischargeRequiredError`] naming the operations still pending and
//! the caveats a newly minted macaroon must carry; when nothing would help
//! it fails with permission denied.
//!
//! One [`AuthChecker`] is built per request from the presented macaroons.
//! Its expensive op-store calls run at most once, on first use, however many
//! threads share it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::authorizer::{Authorizer, ClosedAuthorizer};
use crate::checkers::{
    self, context_with_declared, context_with_operations, infer_declared_from_conditions,
    namespace::join_prefix, Caveat, FirstPartyCaveatChecker, Namespace, STD_NAMESPACE,
};
use crate::context::Context;
use crate::discharge::ThirdPartyLocator;
use crate::error::{DischargeRequiredError, Error};
use crate::identity::{Identity, IdentityClient, NoIdentities};
use crate::macaroon::Slice;
use crate::opstore::MacaroonOpStore;

/// an operation on an entity
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Op {
    pub entity: String,
    pub action: String,
}

impl Op {
    pub fn new(entity: impl Into<String>, action: impl Into<String>) -> Op {
        Op {
            entity: entity.into(),
            action: action.into(),
        }
    }

    /// The sentinel operation standing for "authenticate": it can only be
    /// authorized through identity extraction, never through an ACL.
    pub fn login() -> Op {
        Op::new("login", "login")
    }

    pub fn is_login(&self) -> bool {
        self.entity == "login" && self.action == "login"
    }
}

/// collaborators wired into a [`Checker`]
pub struct CheckerParams {
    pub checker: Arc<dyn FirstPartyCaveatChecker>,
    pub authorizer: Arc<dyn Authorizer>,
    pub identity_client: Arc<dyn IdentityClient>,
    pub op_store: Arc<dyn MacaroonOpStore>,
    pub locator: Option<Arc<dyn ThirdPartyLocator>>,
}

impl CheckerParams {
    /// Params with the given op store and defaults for everything else:
    /// standard first party checkers, a closed authorizer and no identities.
    pub fn new(op_store: Arc<dyn MacaroonOpStore>) -> Self {
        CheckerParams {
            checker: Arc::new(checkers::Checker::new()),
            authorizer: Arc::new(ClosedAuthorizer),
            identity_client: Arc::new(NoIdentities),
            op_store,
            locator: None,
        }
    }

    pub fn with_checker(mut self, checker: Arc<dyn FirstPartyCaveatChecker>) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_identity_client(mut self, identity_client: Arc<dyn IdentityClient>) -> Self {
        self.identity_client = identity_client;
        self
    }

    pub fn with_locator(mut self, locator: Arc<dyn ThirdPartyLocator>) -> Self {
        self.locator = Some(locator);
        self
    }
}

/// the result of a successful authorization
#[derive(Clone, Debug)]
pub struct AuthInfo {
    /// the identity responsible, if the authorization involved one
    pub identity: Option<Arc<dyn Identity>>,
    /// the presented macaroons actually used, in presentation order
    pub macaroons: Vec<Slice>,
    /// for each presented macaroon, whether it was used
    pub used: Vec<bool>,
}

/// the authorization engine; build one per service and share it freely
pub struct Checker {
    p: CheckerParams,
}

impl Checker {
    pub fn new(p: CheckerParams) -> Checker {
        Checker { p }
    }

    /// the namespace caveats are resolved against
    pub fn namespace(&self) -> &Namespace {
        self.p.checker.namespace()
    }

    pub fn locator(&self) -> Option<&Arc<dyn ThirdPartyLocator>> {
        self.p.locator.as_ref()
    }

    /// Starts an authorization for one request, with the macaroons
    /// presented on it. Callers present slices in a well defined order
    /// (e.g. sorted by cookie name): when several can authorize the same
    /// operation, the first match wins.
    pub fn auth(&self, macaroons: Vec<Slice>) -> AuthChecker<'_> {
        AuthChecker {
            checker: self,
            macaroons,
            init: OnceLock::new(),
        }
    }
}

struct Init {
    /// first party conditions per presented macaroon, verified slices only
    conditions: Vec<Vec<String>>,
    /// operation -> indexes of the presented macaroons conferring it
    auth_indexes: HashMap<Op, Vec<usize>>,
    identity: Option<Arc<dyn Identity>>,
    identity_caveats: Vec<Caveat>,
    /// index of the login macaroon the identity was derived from
    identity_macaroon: Option<usize>,
    /// verification errors on presented macaroons, kept for diagnostics
    init_errors: Vec<Error>,
}

struct Outcome {
    authed: Vec<bool>,
    used: Vec<bool>,
    failure: Option<Error>,
}

/// checks operations against one request's presented macaroons
pub struct AuthChecker<'a> {
    checker: &'a Checker,
    macaroons: Vec<Slice>,
    init: OnceLock<Result<Init, Error>>,
}

impl<'a> AuthChecker<'a> {
    /// Checks that all the given operations are allowed, in input order.
    ///
    /// Fails with [`DischargeRequiredError`] when further discharges would
    /// authorize the pending operations, with [`Error::PermissionDenied`]
    /// when nothing would.
    pub fn allow(&self, ctx: &Context, ops: &[Op]) -> Result<AuthInfo, Error> {
        let outcome = self.allow_outcome(ctx, ops)?;
        if let Some(failure) = outcome.failure {
            return Err(failure);
        }
        let init = self.init(ctx)?;
        Ok(self.new_auth_info(init, outcome.used))
    }

    /// Like [`allow`](Self::allow), but reports a per-operation verdict
    /// instead of failing: discharge-required and permission-denied
    /// outcomes are folded into the booleans and whatever partial
    /// [`AuthInfo`] is available. Fatal errors still propagate.
    pub fn allow_any(&self, ctx: &Context, ops: &[Op]) -> Result<(AuthInfo, Vec<bool>), Error> {
        let outcome = self.allow_outcome(ctx, ops)?;
        let init = self.init(ctx)?;
        Ok((self.new_auth_info(init, outcome.used), outcome.authed))
    }

    /// Returns the first party conditions to bake into a capability
    /// macaroon covering `ops`: the squashed union of the conditions from
    /// every macaroon used to authorize them. Operation caveats (`allow`,
    /// `deny`) and `declared` caveats are dropped, as the new macaroon is
    /// bound to specific operations already.
    pub fn allow_capability(&self, ctx: &Context, ops: &[Op]) -> Result<Vec<String>, Error> {
        if ops.is_empty() {
            return Err(Error::other("no operations required in capability"));
        }
        if ops.iter().any(|op| op.is_login()) {
            return Err(Error::other("capabilities cannot cover the login operation"));
        }
        let outcome = self.allow_outcome(ctx, ops)?;
        if let Some(failure) = outcome.failure {
            return Err(failure);
        }
        let init = self.init(ctx)?;
        let conditions = outcome
            .used
            .iter()
            .enumerate()
            .filter(|(_, used)| **used)
            .flat_map(|(i, _)| init.conditions[i].iter());
        Ok(squash_conditions(self.checker.namespace(), conditions))
    }

    fn init(&self, ctx: &Context) -> Result<&Init, Error> {
        match self.init.get_or_init(|| self.init_once(ctx)) {
            Ok(init) => Ok(init),
            Err(e) => Err(e.clone()),
        }
    }

    fn init_once(&self, ctx: &Context) -> Result<Init, Error> {
        ctx.check_live()?;
        let p = &self.checker.p;
        let mut init = Init {
            conditions: vec![Vec::new(); self.macaroons.len()],
            auth_indexes: HashMap::new(),
            identity: None,
            identity_caveats: Vec::new(),
            identity_macaroon: None,
            init_errors: Vec::new(),
        };
        for (i, ms) in self.macaroons.iter().enumerate() {
            let (ops, conditions) = match p.op_store.macaroon_ops(ctx, ms) {
                Ok(res) => res,
                Err(e) if e.is_verification_error() => {
                    debug!(index = i, error = %e, "presented macaroon failed verification");
                    init.init_errors.push(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            init.conditions[i] = conditions;
            let mut is_login = false;
            for op in ops {
                if op.is_login() {
                    is_login = true;
                } else {
                    init.auth_indexes.entry(op).or_default().push(i);
                }
            }
            if !is_login {
                continue;
            }
            // A login macaroon. Check its conditions now so that every
            // caller of this AuthChecker sees the same identity.
            let declared = match self.check_conditions(ctx, &Op::login(), &init.conditions[i]) {
                Ok(declared) => declared,
                Err(e) if e.is_recoverable_caveat_failure() => {
                    debug!(index = i, error = %e, "login macaroon conditions failed");
                    init.init_errors.push(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if init.identity.is_some() {
                debug!(index = i, "ignoring extra login macaroon");
                continue;
            }
            match p.identity_client.declared_identity(&declared) {
                Ok(identity) => {
                    init.identity = Some(identity);
                    init.identity_macaroon = Some(i);
                    init.auth_indexes.entry(Op::login()).or_default().push(i);
                }
                Err(e @ (Error::Cancelled | Error::DeadlineExceeded)) => return Err(e),
                Err(e) => {
                    debug!(index = i, error = %e, "cannot resolve declared identity");
                    init.init_errors.push(e);
                }
            }
        }
        if init.identity.is_none() {
            ctx.check_live()?;
            let (identity, caveats) = p.identity_client.identity_from_context(ctx)?;
            init.identity = identity;
            init.identity_caveats = caveats;
        }
        Ok(init)
    }

    /// Checks every condition of one macaroon against the context, for one
    /// operation. Returns the macaroon's declared map on success.
    fn check_conditions(
        &self,
        ctx: &Context,
        op: &Op,
        conditions: &[String],
    ) -> Result<BTreeMap<String, String>, Error> {
        let checker = &self.checker.p.checker;
        let declared = infer_declared_from_conditions(checker.namespace(), conditions)?;
        let ctx = context_with_operations(ctx, vec![op.action.clone()]);
        let ctx = context_with_declared(&ctx, declared.clone());
        for cond in conditions {
            checker.check_first_party_caveat(&ctx, cond)?;
        }
        Ok(declared)
    }

    fn allow_outcome(&self, ctx: &Context, ops: &[Op]) -> Result<Outcome, Error> {
        let init = self.init(ctx)?;
        let mut authed = vec![false; ops.len()];
        let mut used = vec![false; self.macaroons.len()];
        let mut num_authed = 0;

        for (i, op) in ops.iter().enumerate() {
            if op.is_login() {
                // Only identity extraction can satisfy the login operation.
                if init.identity.is_some() {
                    authed[i] = true;
                    num_authed += 1;
                    if let Some(index) = init.identity_macaroon {
                        used[index] = true;
                    }
                }
                continue;
            }
            if let Some(indexes) = init.auth_indexes.get(op) {
                for &index in indexes {
                    match self.check_conditions(ctx, op, &init.conditions[index]) {
                        Ok(_) => {
                            authed[i] = true;
                            num_authed += 1;
                            used[index] = true;
                            break;
                        }
                        Err(e) if e.is_recoverable_caveat_failure() => {
                            debug!(index, op = ?op, error = %e, "macaroon does not apply");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        if num_authed == ops.len() {
            return Ok(Outcome {
                authed,
                used,
                failure: None,
            });
        }

        // Some operations remain; ask the authorizer, with whatever
        // identity we have.
        let mut need = Vec::new();
        let mut need_index = Vec::new();
        for (i, ok) in authed.iter().enumerate() {
            if !ok {
                need.push(ops[i].clone());
                need_index.push(i);
            }
        }
        ctx.check_live()?;
        let (allowed, caveats) =
            self.checker
                .p
                .authorizer
                .authorize(ctx, init.identity.as_deref(), &need)?;

        let mut still_need = Vec::new();
        let mut authorizer_allowed_any = false;
        for (i, op) in need.iter().enumerate() {
            if allowed.get(i).copied().unwrap_or(false) {
                authed[need_index[i]] = true;
                authorizer_allowed_any = true;
            } else {
                still_need.push(op.clone());
            }
        }
        if authorizer_allowed_any {
            // The identity carried the decision; its macaroon was used.
            if let Some(index) = init.identity_macaroon {
                used[index] = true;
            }
        }

        if still_need.is_empty() && caveats.is_empty() {
            return Ok(Outcome {
                authed,
                used,
                failure: None,
            });
        }
        if init.identity.is_none() && !init.identity_caveats.is_empty() {
            debug!("authentication required");
            return Ok(Outcome {
                authed,
                used,
                failure: Some(
                    DischargeRequiredError {
                        ops: vec![Op::login()],
                        caveats: init.identity_caveats.clone(),
                        for_authentication: true,
                    }
                    .into(),
                ),
            });
        }
        if caveats.is_empty() {
            debug!(still_need = ?still_need, "permission denied");
            return Ok(Outcome {
                authed,
                used,
                failure: Some(Error::PermissionDenied),
            });
        }
        debug!(caveats = caveats.len(), "discharge required");
        Ok(Outcome {
            authed,
            used,
            failure: Some(
                DischargeRequiredError {
                    ops: need,
                    caveats,
                    for_authentication: false,
                }
                .into(),
            ),
        })
    }

    fn new_auth_info(&self, init: &Init, used: Vec<bool>) -> AuthInfo {
        let macaroons = used
            .iter()
            .enumerate()
            .filter(|(_, u)| **u)
            .map(|(i, _)| self.macaroons[i].clone())
            .collect();
        AuthInfo {
            identity: init.identity.clone(),
            macaroons,
            used,
        }
    }
}

/// Combines first party conditions gathered from several macaroons into the
/// minimal set for a fresh capability:
///
/// * exact duplicates fold to one, keeping source order;
/// * of all `time-before` conditions only the earliest survives, at the
///   first one's position;
/// * `allow`, `deny` and `declared` conditions are dropped.
fn squash_conditions<'c>(
    ns: &Namespace,
    conditions: impl Iterator<Item = &'c String>,
) -> Vec<String> {
    let std_prefix = ns.resolve(STD_NAMESPACE).unwrap_or("");
    let time_before = join_prefix(std_prefix, checkers::COND_TIME_BEFORE);
    let dropped: HashSet<String> = [
        checkers::COND_ALLOW,
        checkers::COND_DENY,
        checkers::COND_DECLARED,
    ]
    .iter()
    .map(|cond| join_prefix(std_prefix, cond))
    .collect();

    let mut out: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut earliest: Option<(usize, OffsetDateTime)> = None;
    for cond in conditions {
        if let Ok((name, args)) = checkers::parse_caveat(cond) {
            if dropped.contains(name) {
                continue;
            }
            if name == time_before {
                if let Ok(t) = OffsetDateTime::parse(args, &Rfc3339) {
                    match earliest {
                        None => {
                            earliest = Some((out.len(), t));
                            out.push(cond.clone());
                        }
                        Some((index, current)) if t < current => {
                            earliest = Some((index, t));
                            out[index] = cond.clone();
                        }
                        Some(_) => {}
                    }
                    continue;
                }
            }
        }
        if seen.insert(cond.clone()) {
            out.push(cond.clone());
        }
    }
    out
}
