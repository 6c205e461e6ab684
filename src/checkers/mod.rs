//! first party caveat checking
//!
//! A first party caveat is a condition string the verifying service checks
//! itself: `time-before 2030-01-01T00:00:00Z`, `declared username bob`,
//! `allow read`. The [`Checker`] is an open registry dispatching conditions
//! to check functions by resolved condition name; services register their
//! own vocabularies under namespace URIs and the standard conditions are
//! registered out of the box.
//!
//! Check functions receive the request [`Context`] plus the condition name
//! and its arguments (the condition body split on its first space), and fail
//! with an error when the condition does not hold.

pub mod namespace;

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::net::IpAddr;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::context::Context;
use crate::error::Error;

pub use namespace::{Namespace, STD_NAMESPACE};

/// the `time-before` condition name
pub const COND_TIME_BEFORE: &str = "time-before";
/// the `declared` condition name
pub const COND_DECLARED: &str = "declared";
/// the `allow` condition name
pub const COND_ALLOW: &str = "allow";
/// the `deny` condition name
pub const COND_DENY: &str = "deny";
/// the `error` condition name
pub const COND_ERROR: &str = "error";
/// the `client-ip-addr` condition name
pub const COND_CLIENT_IP_ADDR: &str = "client-ip-addr";

/// A caveat as authored by a service, before namespace resolution.
///
/// A first party caveat has an empty `location`; a third party caveat names
/// the location of the party that must discharge it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caveat {
    pub condition: String,
    pub namespace: String,
    pub location: String,
}

impl Caveat {
    pub fn is_third_party(&self) -> bool {
        !self.location.is_empty()
    }
}

/// a caveat valid strictly before the given time
pub fn time_before_caveat(t: OffsetDateTime) -> Caveat {
    match t.format(&Rfc3339) {
        Ok(stamp) => std_caveat(format!("{} {}", COND_TIME_BEFORE, stamp)),
        Err(_) => error_caveat("cannot format time-before timestamp"),
    }
}

/// a caveat declaring that `key` has the given value
pub fn declared_caveat(key: &str, value: &str) -> Caveat {
    if key.contains(' ') || key.is_empty() {
        return error_caveat(format!("invalid declared caveat key {:?}", key));
    }
    std_caveat(format!("{} {} {}", COND_DECLARED, key, value))
}

/// a caveat restricting the macaroon to operations with the given actions
pub fn allow_caveat(actions: &[&str]) -> Caveat {
    operation_caveat(COND_ALLOW, actions)
}

/// a caveat forbidding operations with the given actions
pub fn deny_caveat(actions: &[&str]) -> Caveat {
    operation_caveat(COND_DENY, actions)
}

/// a caveat that always fails; useful to author a caveat that turned out
/// to be unsatisfiable
pub fn error_caveat(msg: impl Display) -> Caveat {
    std_caveat(format!("{} {}", COND_ERROR, msg))
}

/// a caveat restricting the client IP address
pub fn client_ip_addr_caveat(ip: IpAddr) -> Caveat {
    std_caveat(format!("{} {}", COND_CLIENT_IP_ADDR, ip))
}

fn operation_caveat(cond: &str, actions: &[&str]) -> Caveat {
    if actions.is_empty() {
        return error_caveat(format!("no operations allowed in {} caveat", cond));
    }
    if actions.iter().any(|a| a.is_empty() || a.contains(' ')) {
        return error_caveat(format!("invalid operation in {} caveat", cond));
    }
    std_caveat(format!("{} {}", cond, actions.join(" ")))
}

fn std_caveat(condition: String) -> Caveat {
    Caveat {
        condition,
        namespace: STD_NAMESPACE.to_owned(),
        location: String::new(),
    }
}

/// Splits a resolved condition into its name and arguments.
///
/// The split happens at the first space; a condition with no space has empty
/// arguments. Empty conditions and conditions starting with a space are
/// malformed.
pub fn parse_caveat(cav: &str) -> Result<(&str, &str), Error> {
    if cav.is_empty() {
        return Err(Error::CaveatParse(cav.to_owned()));
    }
    match cav.find(' ') {
        Some(0) => Err(Error::CaveatParse(cav.to_owned())),
        Some(i) => Ok((&cav[..i], &cav[i + 1..])),
        None => Ok((cav, "")),
    }
}

/// checks first party caveats under some namespace
pub trait FirstPartyCaveatChecker: Send + Sync {
    /// Checks that the given resolved condition holds in `ctx`.
    fn check_first_party_caveat(&self, ctx: &Context, caveat: &str) -> Result<(), Error>;

    /// The namespace caveats are resolved against before being attached.
    fn namespace(&self) -> &Namespace;
}

type CheckFn = Box<dyn Fn(&Context, &str, &str) -> Result<(), Error> + Send + Sync>;

/// dispatches first party caveat conditions to registered check functions
pub struct Checker {
    ns: Namespace,
    checkers: HashMap<String, CheckFn>,
    fallback: Option<CheckFn>,
}

impl Checker {
    /// a checker with the standard conditions registered
    pub fn new() -> Self {
        let mut ns = Namespace::new();
        // The namespace is freshly created; registration cannot fail.
        let _ = ns.register(STD_NAMESPACE, "");
        let mut checker = Checker {
            ns,
            checkers: HashMap::new(),
            fallback: None,
        };
        checker.register_std();
        checker
    }

    fn register_std(&mut self) {
        // Registration over the fresh std namespace cannot fail.
        let _ = self.register(COND_TIME_BEFORE, STD_NAMESPACE, check_time_before);
        let _ = self.register(COND_DECLARED, STD_NAMESPACE, check_declared);
        let _ = self.register(COND_ALLOW, STD_NAMESPACE, check_allow);
        let _ = self.register(COND_DENY, STD_NAMESPACE, check_deny);
        let _ = self.register(COND_ERROR, STD_NAMESPACE, check_error);
        let _ = self.register(COND_CLIENT_IP_ADDR, STD_NAMESPACE, check_client_ip_addr);
    }

    pub fn namespace_mut(&mut self) -> &mut Namespace {
        &mut self.ns
    }

    /// Registers `check` for condition `cond` in the namespace `uri`.
    ///
    /// The namespace must already be registered, and a condition may only
    /// be registered once.
    pub fn register<F>(&mut self, cond: &str, uri: &str, check: F) -> Result<(), Error>
    where
        F: Fn(&Context, &str, &str) -> Result<(), Error> + Send + Sync + 'static,
    {
        if cond.is_empty() || cond.contains(' ') || cond.contains(':') {
            return Err(Error::other(format!("invalid condition name {:?}", cond)));
        }
        let prefix = self
            .ns
            .resolve(uri)
            .ok_or_else(|| Error::other(format!("no prefix registered for namespace {:?}", uri)))?;
        let key = namespace::join_prefix(prefix, cond);
        if self.checkers.contains_key(&key) {
            return Err(Error::other(format!(
                "checker for {:?} (namespace {:?}) already registered",
                cond, uri
            )));
        }
        self.checkers.insert(key, Box::new(check));
        Ok(())
    }

    /// Registers a catch-all invoked for conditions with no exact match.
    pub fn register_fallback<F>(&mut self, check: F) -> Result<(), Error>
    where
        F: Fn(&Context, &str, &str) -> Result<(), Error> + Send + Sync + 'static,
    {
        if self.fallback.is_some() {
            return Err(Error::other("fallback checker already registered"));
        }
        self.fallback = Some(Box::new(check));
        Ok(())
    }
}

impl Default for Checker {
    fn default() -> Self {
        Checker::new()
    }
}

impl FirstPartyCaveatChecker for Checker {
    fn check_first_party_caveat(&self, ctx: &Context, caveat: &str) -> Result<(), Error> {
        let (cond, args) = parse_caveat(caveat)?;
        let check = match self.checkers.get(cond) {
            Some(check) => check,
            None => match &self.fallback {
                Some(fallback) => fallback,
                None => return Err(Error::CaveatNotRecognized(caveat.to_owned())),
            },
        };
        check(ctx, cond, args).map_err(|e| match e {
            Error::Cancelled | Error::DeadlineExceeded => e,
            e => Error::CaveatNotSatisfied {
                condition: caveat.to_owned(),
                reason: e.to_string(),
            },
        })
    }

    fn namespace(&self) -> &Namespace {
        &self.ns
    }
}

impl std::fmt::Debug for Checker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut conds: Vec<&String> = self.checkers.keys().collect();
        conds.sort();
        f.debug_struct("Checker").field("conditions", &conds).finish()
    }
}

// Context values consumed by the standard conditions. The authorization
// engine fills these in before checking each operation.

struct DeclaredKey(BTreeMap<String, String>);
struct OperationsKey(Vec<String>);
struct ClientIpKey(IpAddr);

/// derives a context carrying the final declared key/value map
pub fn context_with_declared(ctx: &Context, declared: BTreeMap<String, String>) -> Context {
    ctx.with_value(DeclaredKey(declared))
}

/// the declared map, empty if none was set
pub fn declared_from_context(ctx: &Context) -> BTreeMap<String, String> {
    ctx.value::<DeclaredKey>()
        .map(|d| d.0.clone())
        .unwrap_or_default()
}

/// derives a context carrying the actions of the operations being checked
pub fn context_with_operations(ctx: &Context, actions: Vec<String>) -> Context {
    ctx.with_value(OperationsKey(actions))
}

/// the actions of the operations being checked
pub fn operations_from_context(ctx: &Context) -> Vec<String> {
    ctx.value::<OperationsKey>()
        .map(|o| o.0.clone())
        .unwrap_or_default()
}

/// derives a context carrying the requesting client's IP address
pub fn context_with_client_ip(ctx: &Context, ip: IpAddr) -> Context {
    ctx.with_value(ClientIpKey(ip))
}

/// the requesting client's IP address, if known
pub fn client_ip_from_context(ctx: &Context) -> Option<IpAddr> {
    ctx.value::<ClientIpKey>().map(|ip| ip.0)
}

/// Extracts the declared key/value map from a set of resolved conditions.
///
/// Two declarations of the same key with different values are contradictory
/// and fail the whole authorization rather than silently shadowing each
/// other.
pub fn infer_declared_from_conditions(
    ns: &Namespace,
    conds: &[String],
) -> Result<BTreeMap<String, String>, Error> {
    let declared_cond = namespace::join_prefix(ns.resolve(STD_NAMESPACE).unwrap_or(""), COND_DECLARED);
    let mut declared = BTreeMap::new();
    for cond in conds {
        let (name, args) = match parse_caveat(cond) {
            Ok(parsed) => parsed,
            // Unparseable conditions are rejected by the condition checks.
            Err(_) => continue,
        };
        if name != declared_cond {
            continue;
        }
        let (key, value) = match args.find(' ') {
            Some(i) => (&args[..i], &args[i + 1..]),
            None => continue,
        };
        if let Some(existing) = declared.get(key) {
            if existing != value {
                return Err(Error::DeclaredInconsistent {
                    key: key.to_owned(),
                });
            }
        }
        declared.insert(key.to_owned(), value.to_owned());
    }
    Ok(declared)
}

fn check_time_before(ctx: &Context, _cond: &str, args: &str) -> Result<(), Error> {
    let t = OffsetDateTime::parse(args, &Rfc3339)
        .map_err(|e| Error::other(format!("cannot parse time {:?}: {}", args, e)))?;
    if ctx.now() < t {
        Ok(())
    } else {
        Err(Error::other("macaroon has expired"))
    }
}

fn check_declared(ctx: &Context, _cond: &str, args: &str) -> Result<(), Error> {
    let (key, value) = match args.find(' ') {
        Some(i) => (&args[..i], &args[i + 1..]),
        None => return Err(Error::other(format!("declared caveat has no value: {:?}", args))),
    };
    let declared = declared_from_context(ctx);
    match declared.get(key) {
        Some(actual) if actual == value => Ok(()),
        Some(actual) => Err(Error::other(format!(
            "got {}={:?}, expected {:?}",
            key, actual, value
        ))),
        None => Err(Error::other(format!("{} not declared", key))),
    }
}

fn check_allow(ctx: &Context, _cond: &str, args: &str) -> Result<(), Error> {
    check_operations(ctx, true, args)
}

fn check_deny(ctx: &Context, _cond: &str, args: &str) -> Result<(), Error> {
    check_operations(ctx, false, args)
}

fn check_operations(ctx: &Context, allow: bool, args: &str) -> Result<(), Error> {
    let listed: Vec<&str> = args.split(' ').filter(|a| !a.is_empty()).collect();
    if listed.is_empty() {
        return Err(Error::other("no operations allowed"));
    }
    let actions = operations_from_context(ctx);
    if actions.is_empty() {
        if allow {
            return Err(Error::other("no operations in context"));
        }
        return Ok(());
    }
    for action in &actions {
        let listed_here = listed.iter().any(|a| a == action);
        if allow != listed_here {
            return Err(Error::other(format!("{} not allowed", action)));
        }
    }
    Ok(())
}

fn check_error(_ctx: &Context, _cond: &str, args: &str) -> Result<(), Error> {
    Err(Error::other(args.to_owned()))
}

fn check_client_ip_addr(ctx: &Context, _cond: &str, args: &str) -> Result<(), Error> {
    let expected: IpAddr = args
        .parse()
        .map_err(|_| Error::other(format!("cannot parse IP address {:?}", args)))?;
    match client_ip_from_context(ctx) {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(Error::other(format!(
            "client IP address mismatch, got {}",
            actual
        ))),
        None => Err(Error::other("client IP address not found in context")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Clock;
    use std::sync::Arc;
    use time::macros::datetime;

    struct Stopped(OffsetDateTime);

    impl Clock for Stopped {
        fn now(&self) -> OffsetDateTime {
            self.0
        }
    }

    fn epoch_ctx() -> Context {
        Context::background().with_clock(Arc::new(Stopped(datetime!(1900-11-17 19:00:13 UTC))))
    }

    fn check(ctx: &Context, cond: &str) -> Result<(), Error> {
        Checker::new().check_first_party_caveat(ctx, cond)
    }

    #[test]
    fn parse_caveat_splits_on_first_space() {
        assert_eq!(parse_caveat("declared username bob").unwrap(), ("declared", "username bob"));
        assert_eq!(parse_caveat("true").unwrap(), ("true", ""));
        assert!(matches!(parse_caveat(""), Err(Error::CaveatParse(_))));
        assert!(matches!(parse_caveat(" x"), Err(Error::CaveatParse(_))));
    }

    #[test]
    fn time_before() {
        let ctx = epoch_ctx();
        assert!(check(&ctx, "time-before 1900-11-18T19:00:13Z").is_ok());
        // Strictly before: the boundary itself has expired.
        assert!(check(&ctx, "time-before 1900-11-17T19:00:13Z").is_err());
        assert!(check(&ctx, "time-before 1899-01-01T00:00:00Z").is_err());
        assert!(check(&ctx, "time-before yesterday").is_err());
    }

    #[test]
    fn declared() {
        let mut declared = BTreeMap::new();
        declared.insert("username".to_owned(), "bob".to_owned());
        let ctx = context_with_declared(&epoch_ctx(), declared);

        assert!(check(&ctx, "declared username bob").is_ok());
        assert!(check(&ctx, "declared username alice").is_err());
        assert!(check(&ctx, "declared domain example.com").is_err());
        assert!(check(&ctx, "declared username").is_err());
    }

    #[test]
    fn allow_and_deny() {
        let ctx = context_with_operations(&epoch_ctx(), vec!["read".to_owned()]);
        assert!(check(&ctx, "allow read write").is_ok());
        assert!(check(&ctx, "allow write").is_err());
        assert!(check(&ctx, "deny write").is_ok());
        assert!(check(&ctx, "deny read write").is_err());

        // With no operations in context, allow fails and deny passes.
        let empty = epoch_ctx();
        assert!(check(&empty, "allow read").is_err());
        assert!(check(&empty, "deny read").is_ok());
    }

    #[test]
    fn error_always_fails() {
        let err = check(&epoch_ctx(), "error something went wrong").unwrap_err();
        match err {
            Error::CaveatNotSatisfied { reason, .. } => {
                assert_eq!(reason, "something went wrong")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn client_ip() {
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let ctx = context_with_client_ip(&epoch_ctx(), ip);
        assert!(check(&ctx, "client-ip-addr 192.0.2.1").is_ok());
        assert!(check(&ctx, "client-ip-addr 192.0.2.2").is_err());
        assert!(check(&epoch_ctx(), "client-ip-addr 192.0.2.1").is_err());
    }

    #[test]
    fn unrecognized_condition() {
        assert!(matches!(
            check(&epoch_ctx(), "nonsense 1"),
            Err(Error::CaveatNotRecognized(_))
        ));
    }

    #[test]
    fn fallback_catches_unmatched() {
        let mut c = Checker::new();
        c.register_fallback(|_ctx, cond, _args| {
            if cond == "custom" {
                Ok(())
            } else {
                Err(Error::other("unknown"))
            }
        })
        .unwrap();
        assert!(c.check_first_party_caveat(&epoch_ctx(), "custom 1").is_ok());
        assert!(c.check_first_party_caveat(&epoch_ctx(), "other 1").is_err());
        // Exact matches still win over the fallback.
        assert!(c
            .check_first_party_caveat(&epoch_ctx(), "error boom")
            .is_err());
    }

    #[test]
    fn register_rejects_redefinition() {
        let mut c = Checker::new();
        c.namespace_mut().register("testns", "t").unwrap();
        c.register("custom", "testns", |_, _, _| Ok(())).unwrap();
        assert!(c.register("custom", "testns", |_, _, _| Ok(())).is_err());
        assert!(c.register("other", "unknown-ns", |_, _, _| Ok(())).is_err());
        assert!(c.register("has space", "testns", |_, _, _| Ok(())).is_err());
    }

    #[test]
    fn registered_condition_resolves_with_prefix() {
        let mut c = Checker::new();
        c.namespace_mut().register("testns", "t").unwrap();
        c.register("always", "testns", |_, _, _| Ok(())).unwrap();
        assert!(c.check_first_party_caveat(&epoch_ctx(), "t:always").is_ok());
        assert!(c.check_first_party_caveat(&epoch_ctx(), "always").is_err());
    }

    #[test]
    fn caveat_constructors() {
        assert_eq!(
            time_before_caveat(datetime!(1900-11-18 19:00:13 UTC)).condition,
            "time-before 1900-11-18T19:00:13Z"
        );
        assert_eq!(declared_caveat("username", "bob").condition, "declared username bob");
        assert_eq!(allow_caveat(&["read", "write"]).condition, "allow read write");
        assert_eq!(deny_caveat(&["write"]).condition, "deny write");
        assert!(allow_caveat(&[]).condition.starts_with("error "));
        assert!(declared_caveat("bad key", "x").condition.starts_with("error "));
    }

    #[test]
    fn infer_declared() {
        let ns = Checker::new().namespace().clone();
        let conds = vec![
            "declared username bob".to_owned(),
            "declared domain example.com".to_owned(),
            "true 1".to_owned(),
            "declared username bob".to_owned(),
        ];
        let declared = infer_declared_from_conditions(&ns, &conds).unwrap();
        assert_eq!(declared.get("username").map(String::as_str), Some("bob"));
        assert_eq!(declared.get("domain").map(String::as_str), Some("example.com"));

        let conflicting = vec![
            "declared username bob".to_owned(),
            "declared username alice".to_owned(),
        ];
        assert_eq!(
            infer_declared_from_conditions(&ns, &conflicting),
            Err(Error::DeclaredInconsistent {
                key: "username".to_owned()
            })
        );
    }
}
