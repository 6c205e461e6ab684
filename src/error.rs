//! error types
//!
//! Errors fall into three classes at the authorization boundary:
//!
//! * [`VerificationError`]: a single presented macaroon failed verification.
//!   The offending macaroon is demoted to "not used"; authorization may still
//!   succeed through other macaroons or end in a discharge-required response.
//! * [`DischargeRequiredError`]: control flow, not failure. It names the
//!   operations that remain unauthorized and the caveats that would authorize
//!   them; callers turn it into a freshly minted macaroon.
//! * everything else is fatal and propagates unchanged.

use thiserror::Error;

use crate::checker::Op;
use crate::checkers::Caveat;

/// the global error type for the bakery
#[derive(Error, Clone, Debug, PartialEq)]
pub enum Error {
    #[error("item not found")]
    NotFound,
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    DischargeRequired(#[from] DischargeRequiredError),
    #[error("permission denied")]
    PermissionDenied,
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("cannot parse caveat {0:?}")]
    CaveatParse(String),
    #[error("caveat {0:?} not recognized")]
    CaveatNotRecognized(String),
    #[error("caveat {condition:?} not satisfied: {reason}")]
    CaveatNotSatisfied { condition: String, reason: String },
    #[error("conflicting declarations for {key:?}")]
    DeclaredInconsistent { key: String },
    #[error("discharge caveats form a cycle at {0:?}")]
    DischargeCycle(String),
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wraps an arbitrary message, for collaborator implementations
    /// that have no more precise variant to return.
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// A verification error on a presented macaroon is recoverable:
    /// the macaroon is set aside and authorization continues without it.
    pub fn is_verification_error(&self) -> bool {
        matches!(self, Error::Verification(_))
    }

    pub fn is_discharge_required(&self) -> bool {
        matches!(self, Error::DischargeRequired(_))
    }

    /// Whether a caveat-check failure only disqualifies the macaroon
    /// being checked, as opposed to aborting the whole authorization.
    /// Unparseable conditions, declaration conflicts and cancellation
    /// are fatal; an unsatisfied or unrecognized condition is not.
    pub(crate) fn is_recoverable_caveat_failure(&self) -> bool {
        matches!(
            self,
            Error::CaveatNotSatisfied { .. }
                | Error::CaveatNotRecognized(_)
                | Error::Verification(_)
        )
    }
}

/// recoverable failure of a presented macaroon
#[derive(Error, Clone, Debug, PartialEq)]
pub enum VerificationError {
    #[error("signature mismatch after caveat verification")]
    InvalidSignature,
    #[error("no macaroons in slice")]
    EmptySlice,
    #[error("macaroon root key not found in storage")]
    RootKeyNotFound,
    #[error("macaroon id has unknown version {0}")]
    UnknownIdVersion(u32),
    #[error("cannot decode macaroon id: {0}")]
    InvalidId(String),
    #[error("cannot find discharge macaroon for caveat {0:?}")]
    DischargeNotFound(String),
    #[error("discharge macaroon {0:?} was not used")]
    UnusedDischarge(String),
    #[error("first party caveat condition is not valid utf-8")]
    InvalidCondition,
}

/// structured response naming the discharges that would authorize
/// the pending operations; surfaced to the caller, never fatal
#[derive(Error, Clone, Debug, PartialEq)]
#[error("discharge required")]
pub struct DischargeRequiredError {
    /// the operations that remain unauthorized
    pub ops: Vec<Op>,
    /// the caveats a newly minted macaroon must carry
    pub caveats: Vec<Caveat>,
    /// true iff the response asks for authentication only (ops == [LoginOp])
    pub for_authentication: bool,
}

/// errors related to wire encodings and cryptographic sealing
#[derive(Error, Clone, Debug, PartialEq)]
pub enum FormatError {
    #[error("unknown format version {0}")]
    UnknownVersion(u32),
    #[error("invalid key size {0}")]
    InvalidKeySize(usize),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("could not serialize: {0}")]
    Serialization(String),
    #[error("could not deserialize: {0}")]
    Deserialization(String),
    #[error("cannot decode base64: {0}")]
    Base64(String),
    #[error("cannot seal payload: {0}")]
    Encryption(String),
    #[error("cannot unseal payload: {0}")]
    Decryption(String),
}

impl From<base64::DecodeError> for FormatError {
    fn from(e: base64::DecodeError) -> Self {
        FormatError::Base64(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Format(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_format_strings() {
        assert_eq!(
            format!("{}", Error::CaveatParse("bad".to_owned())),
            "cannot parse caveat \"bad\""
        );
        assert_eq!(
            format!("{}", Error::Verification(VerificationError::RootKeyNotFound)),
            "macaroon root key not found in storage"
        );
        assert_eq!(
            format!(
                "{}",
                DischargeRequiredError {
                    ops: vec![],
                    caveats: vec![],
                    for_authentication: false,
                }
            ),
            "discharge required"
        );
    }

    #[test]
    fn verification_errors_are_recoverable() {
        let err = Error::from(VerificationError::InvalidSignature);
        assert!(err.is_verification_error());
        assert!(!Error::PermissionDenied.is_verification_error());
        assert!(!Error::Cancelled.is_recoverable_caveat_failure());
    }
}
