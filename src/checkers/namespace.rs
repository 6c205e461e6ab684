//! caveat namespaces
//!
//! A namespace maps the URIs that identify caveat vocabularies to the short
//! prefixes a service uses on the wire. A caveat authored against URI `u`
//! resolves on a given service by prepending that service's prefix for `u`
//! (colon-joined); the standard vocabulary registers the empty prefix so
//! standard conditions stay bare. A caveat in a namespace the service has
//! never registered resolves to an `error` condition, so it fails closed
//! rather than being silently ignored.

use std::collections::BTreeMap;

use super::{error_caveat, Caveat};
use crate::error::Error;

/// URI of the standard caveat vocabulary (`time-before`, `declared`, ...)
pub const STD_NAMESPACE: &str = "std";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Namespace {
    uri_to_prefix: BTreeMap<String, String>,
}

impl Namespace {
    pub fn new() -> Self {
        Namespace::default()
    }

    /// Registers `uri` under `prefix`. Re-registering a URI with a different
    /// prefix is an error; registering it again with the same prefix is a
    /// no-op.
    pub fn register(&mut self, uri: &str, prefix: &str) -> Result<(), Error> {
        if !valid_uri(uri) {
            return Err(Error::other(format!("invalid namespace URI {:?}", uri)));
        }
        if !valid_prefix(prefix) {
            return Err(Error::other(format!(
                "invalid caveat condition prefix {:?}",
                prefix
            )));
        }
        match self.uri_to_prefix.get(uri) {
            Some(existing) if existing != prefix => Err(Error::other(format!(
                "namespace {:?} already registered with prefix {:?}",
                uri, existing
            ))),
            _ => {
                self.uri_to_prefix.insert(uri.to_owned(), prefix.to_owned());
                Ok(())
            }
        }
    }

    /// the prefix registered for `uri`, if any
    pub fn resolve(&self, uri: &str) -> Option<&str> {
        self.uri_to_prefix.get(uri).map(String::as_str)
    }

    /// Resolves a first party caveat to the condition string that will be
    /// attached to a macaroon. Third party caveats are passed through
    /// unchanged; their condition is resolved by the discharger, not here.
    pub fn resolve_caveat(&self, cav: &Caveat) -> Caveat {
        if !cav.location.is_empty() {
            return cav.clone();
        }
        match self.resolve(&cav.namespace) {
            Some(prefix) => Caveat {
                condition: join_prefix(prefix, &cav.condition),
                namespace: cav.namespace.clone(),
                location: String::new(),
            },
            None => {
                let err = error_caveat(format!(
                    "caveat {:?} in unregistered namespace {:?}",
                    cav.condition, cav.namespace
                ));
                Caveat {
                    condition: err.condition,
                    namespace: cav.namespace.clone(),
                    location: String::new(),
                }
            }
        }
    }
}

pub(crate) fn join_prefix(prefix: &str, condition: &str) -> String {
    if prefix.is_empty() {
        condition.to_owned()
    } else {
        format!("{}:{}", prefix, condition)
    }
}

fn valid_uri(uri: &str) -> bool {
    !uri.is_empty() && !uri.chars().any(char::is_whitespace)
}

fn valid_prefix(prefix: &str) -> bool {
    !prefix.contains(|c: char| c.is_whitespace() || c == ':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve() {
        let mut ns = Namespace::new();
        ns.register(STD_NAMESPACE, "").unwrap();
        ns.register("testns", "t").unwrap();

        assert_eq!(ns.resolve(STD_NAMESPACE), Some(""));
        assert_eq!(ns.resolve("testns"), Some("t"));
        assert_eq!(ns.resolve("other"), None);

        // Same prefix again is fine, a different one is not.
        ns.register("testns", "t").unwrap();
        assert!(ns.register("testns", "u").is_err());
    }

    #[test]
    fn rejects_invalid_names() {
        let mut ns = Namespace::new();
        assert!(ns.register("", "x").is_err());
        assert!(ns.register("has space", "x").is_err());
        assert!(ns.register("ok", "pre fix").is_err());
        assert!(ns.register("ok", "pre:fix").is_err());
    }

    #[test]
    fn resolve_caveat_applies_prefix() {
        let mut ns = Namespace::new();
        ns.register(STD_NAMESPACE, "").unwrap();
        ns.register("testns", "t").unwrap();

        let std_cav = Caveat {
            condition: "time-before 2030-01-01T00:00:00Z".to_owned(),
            namespace: STD_NAMESPACE.to_owned(),
            location: String::new(),
        };
        assert_eq!(
            ns.resolve_caveat(&std_cav).condition,
            "time-before 2030-01-01T00:00:00Z"
        );

        let test_cav = Caveat {
            condition: "something x".to_owned(),
            namespace: "testns".to_owned(),
            location: String::new(),
        };
        assert_eq!(ns.resolve_caveat(&test_cav).condition, "t:something x");
    }

    #[test]
    fn unknown_namespace_fails_closed() {
        let ns = Namespace::new();
        let cav = Caveat {
            condition: "anything".to_owned(),
            namespace: "nowhere".to_owned(),
            location: String::new(),
        };
        let resolved = ns.resolve_caveat(&cav);
        assert!(resolved.condition.starts_with("error "));
        assert!(resolved.condition.contains("unregistered namespace"));
    }

    #[test]
    fn third_party_caveats_pass_through() {
        let mut ns = Namespace::new();
        ns.register(STD_NAMESPACE, "").unwrap();
        let cav = Caveat {
            condition: "is-authenticated-user".to_owned(),
            namespace: String::new(),
            location: "ids".to_owned(),
        };
        assert_eq!(ns.resolve_caveat(&cav), cav);
    }
}
