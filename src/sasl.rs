//! Pluggable SASL authentication.
//!
//! The connection engine only drives the frame exchange; the decision is
//! delegated to an [`Authenticator`], so credential checks can be swapped
//! without touching the protocol state machine.

use std::collections::HashMap;

/// Mechanism name for anonymous access.
pub const ANONYMOUS: &str = "ANONYMOUS";
/// Mechanism name for username and password.
pub const PLAIN: &str = "PLAIN";

/// Result of an authentication attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaslVerdict {
    /// The peer may proceed to open the connection.
    Accept,
    /// The peer is refused.
    Reject,
}

/// Decides whether a SASL exchange succeeds.
pub trait Authenticator: Send + Sync + 'static {
    /// Mechanisms advertised to the peer, in preference order.
    fn mechanisms(&self) -> Vec<String>;

    /// Judge the peer's chosen mechanism and initial response.
    fn authenticate(&self, mechanism: &str, initial_response: Option<&[u8]>) -> SaslVerdict;
}

/// Accepts every peer using the `ANONYMOUS` mechanism.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnonymousAuthenticator;

impl Authenticator for AnonymousAuthenticator {
    fn mechanisms(&self) -> Vec<String> { vec![ANONYMOUS.to_owned()] }

    fn authenticate(&self, mechanism: &str, _initial_response: Option<&[u8]>) -> SaslVerdict {
        if mechanism == ANONYMOUS {
            SaslVerdict::Accept
        } else {
            SaslVerdict::Reject
        }
    }
}

/// Verifies `PLAIN` credentials against a fixed table.
///
/// # Examples
///
/// ```
/// use amqpframe::sasl::{Authenticator, PlainAuthenticator, SaslVerdict};
///
/// let auth = PlainAuthenticator::default().with_user("guest", "secret");
/// assert_eq!(auth.authenticate("PLAIN", Some(&b"\0guest\0secret"[..])), SaslVerdict::Accept);
/// assert_eq!(auth.authenticate("PLAIN", Some(&b"\0guest\0wrong"[..])), SaslVerdict::Reject);
/// ```
#[derive(Clone, Debug, Default)]
pub struct PlainAuthenticator {
    users: HashMap<String, String>,
}

impl PlainAuthenticator {
    /// Add a user.
    #[must_use]
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

/// Split a `PLAIN` response (`authzid NUL authcid NUL passwd`).
fn parse_plain(response: &[u8]) -> Option<(&str, &str)> {
    let mut parts = response.split(|b| *b == 0);
    let _authzid = parts.next()?;
    let user = std::str::from_utf8(parts.next()?).ok()?;
    let password = std::str::from_utf8(parts.next()?).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((user, password))
}

impl Authenticator for PlainAuthenticator {
    fn mechanisms(&self) -> Vec<String> { vec![PLAIN.to_owned()] }

    fn authenticate(&self, mechanism: &str, initial_response: Option<&[u8]>) -> SaslVerdict {
        if mechanism != PLAIN {
            return SaslVerdict::Reject;
        }
        match initial_response.and_then(parse_plain) {
            Some((user, password)) if self.users.get(user).is_some_and(|p| p == password) => {
                SaslVerdict::Accept
            }
            _ => SaslVerdict::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ANONYMOUS, SaslVerdict::Accept)]
    #[case(PLAIN, SaslVerdict::Reject)]
    fn anonymous_only_accepts_its_mechanism(#[case] mechanism: &str, #[case] expected: SaslVerdict) {
        assert_eq!(AnonymousAuthenticator.authenticate(mechanism, None), expected);
    }

    #[rstest]
    #[case(Some(&b"\0guest\0secret"[..]), SaslVerdict::Accept)]
    #[case(Some(&b"admin\0guest\0secret"[..]), SaslVerdict::Accept)]
    #[case(Some(&b"\0guest\0nope"[..]), SaslVerdict::Reject)]
    #[case(Some(&b"\0nobody\0secret"[..]), SaslVerdict::Reject)]
    #[case(Some(&b"guest"[..]), SaslVerdict::Reject)]
    #[case(None, SaslVerdict::Reject)]
    fn plain_checks_credentials(#[case] response: Option<&[u8]>, #[case] expected: SaslVerdict) {
        let auth = PlainAuthenticator::default().with_user("guest", "secret");
        assert_eq!(auth.authenticate(PLAIN, response), expected);
    }
}
