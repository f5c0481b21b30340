use crate::error::{ProxyError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hyper::header::HeaderValue;
use std::sync::Arc;

/// Decides whether a present `Proxy-Authorization` value grants access.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, header: &[u8]) -> bool;
}

/// One fixed username/password pair checked against `Basic` credentials.
pub struct BasicCredential {
    username: Vec<u8>,
    password: Vec<u8>,
}

impl BasicCredential {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.as_bytes().to_vec(),
            password: password.as_bytes().to_vec(),
        }
    }
}

impl CredentialVerifier for BasicCredential {
    fn verify(&self, header: &[u8]) -> bool {
        let Some((username, password)) = decode_basic(header) else {
            return false;
        };
        // Both comparisons run so timing does not reveal which part differed.
        let username_ok = constant_time_eq::constant_time_eq(&username, &self.username);
        let password_ok = constant_time_eq::constant_time_eq(&password, &self.password);
        username_ok & password_ok
    }
}

/// Splits `Basic <base64(user:pass)>` into its two parts. Anything
/// malformed yields `None`.
fn decode_basic(header: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let header = header.trim_ascii();
    let split = header.iter().position(u8::is_ascii_whitespace)?;
    let (scheme, encoded) = header.split_at(split);
    if !scheme.eq_ignore_ascii_case(b"basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim_ascii()).ok()?;
    let colon = decoded.iter().position(|&b| b == b':')?;
    let (username, rest) = decoded.split_at(colon);
    Some((username.to_vec(), rest[1..].to_vec()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Missing,
    Rejected,
    Granted,
}

#[derive(Clone)]
pub struct CredentialGate {
    verifier: Arc<dyn CredentialVerifier>,
    challenge: HeaderValue,
}

impl CredentialGate {
    pub fn new(verifier: Arc<dyn CredentialVerifier>, realm: &str) -> Result<Self> {
        let challenge = HeaderValue::from_str(&format!("Basic realm=\"{}\"", realm))
            .map_err(|e| ProxyError::Configuration(format!("invalid realm {:?}: {}", realm, e)))?;
        Ok(Self {
            verifier,
            challenge,
        })
    }

    pub fn authorize(&self, header: Option<&[u8]>) -> bool {
        self.decide(header) == AuthDecision::Granted
    }

    pub fn decide(&self, header: Option<&[u8]>) -> AuthDecision {
        match header {
            None => AuthDecision::Missing,
            Some(value) if self.verifier.verify(value) => AuthDecision::Granted,
            Some(_) => AuthDecision::Rejected,
        }
    }

    /// `Proxy-Authenticate` value sent with 407 responses.
    pub fn challenge(&self) -> &HeaderValue {
        &self.challenge
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> CredentialGate {
        CredentialGate::new(Arc::new(BasicCredential::new("abc", "abc")), "Proxy Server").unwrap()
    }

    fn basic(credentials: &str) -> Vec<u8> {
        format!("Basic {}", STANDARD.encode(credentials)).into_bytes()
    }

    #[test]
    fn absent_header_is_missing() {
        assert_eq!(gate().decide(None), AuthDecision::Missing);
        assert!(!gate().authorize(None));
    }

    #[test]
    fn correct_credentials_are_granted() {
        assert_eq!(gate().decide(Some(&basic("abc:abc"))), AuthDecision::Granted);
    }

    #[test]
    fn wrong_credentials_are_rejected() {
        let gate = gate();
        assert_eq!(gate.decide(Some(&basic("abc:abd"))), AuthDecision::Rejected);
        assert_eq!(gate.decide(Some(&basic("abd:abc"))), AuthDecision::Rejected);
        assert_eq!(gate.decide(Some(&basic("abc"))), AuthDecision::Rejected);
    }

    #[test]
    fn password_may_contain_colons() {
        let gate = CredentialGate::new(Arc::new(BasicCredential::new("u", "p:w:d")), "r").unwrap();
        assert!(gate.authorize(Some(&basic("u:p:w:d"))));
    }

    #[test]
    fn malformed_headers_are_rejected_not_errors() {
        let gate = gate();
        for header in [
            &b""[..],
            b"Basic",
            b"Basic !!!not-base64!!!",
            b"Bearer YWJjOmFiYw==",
            b"YWJjOmFiYw==",
            b"Basic \xff\xfe",
        ] {
            assert_eq!(gate.decide(Some(header)), AuthDecision::Rejected);
        }
    }

    #[test]
    fn scheme_is_case_insensitive() {
        assert!(gate().authorize(Some(b"basic YWJjOmFiYw==")));
        assert!(gate().authorize(Some(b"  BASIC   YWJjOmFiYw==  ")));
    }

    #[test]
    fn challenge_names_realm() {
        assert_eq!(gate().challenge(), "Basic realm=\"Proxy Server\"");
    }

    #[test]
    fn realm_with_control_characters_is_a_config_error() {
        let result = CredentialGate::new(Arc::new(BasicCredential::new("a", "b")), "bad\nrealm");
        assert!(matches!(result, Err(ProxyError::Configuration(_))));
    }
}
