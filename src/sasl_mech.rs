//! SASL mechanism selection and the one mechanism the `sasl` crate doesn't
//! provide.
//!
//! `sasl::client::mechanisms` covers SCRAM-SHA-1 and PLAIN; DIGEST-MD5 is
//! implemented here by hand against the same `sasl::client::Mechanism`
//! trait, so [`crate::negotiation`] can treat all three uniformly as
//! `Box<dyn Mechanism + Send>`.

use std::collections::HashSet;
use std::fmt::Write as _;

use digest::Digest;
use md5::Md5;
use rand::RngCore;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::Sha1 as ScramSha1;
use sasl::common::Credentials;

use crate::error::AuthError;

/// Mechanism names this crate supports, in the strict precedence order
/// required at negotiation time.
const PRECEDENCE: [&str; 3] = ["SCRAM-SHA-1", "DIGEST-MD5", "PLAIN"];

/// Pick the best mechanism both we and the server support, by strict
/// precedence `SCRAM-SHA-1 > DIGEST-MD5 > PLAIN`.
pub fn select(
    advertised: &HashSet<String>,
    creds: &Credentials,
    service_host: &str,
) -> Result<Box<dyn Mechanism + Send>, AuthError> {
    for name in PRECEDENCE {
        if !advertised.contains(name) {
            continue;
        }
        let mechanism: Box<dyn Mechanism + Send> = match name {
            "SCRAM-SHA-1" => Box::new(
                Scram::<ScramSha1>::from_credentials(creds.clone())
                    .map_err(AuthError::Local)?,
            ),
            "DIGEST-MD5" => Box::new(DigestMd5::from_credentials(creds.clone(), service_host)),
            "PLAIN" => Box::new(Plain::from_credentials(creds.clone()).map_err(AuthError::Local)?),
            _ => unreachable!(),
        };
        return Ok(mechanism);
    }
    Err(AuthError::NoMechanism)
}

/// RFC 2831 DIGEST-MD5, restricted to `qop=auth` (no integrity/confidentiality
/// layer, which XMPP never negotiates over this mechanism in practice).
pub struct DigestMd5 {
    username: String,
    password: String,
    cnonce: String,
    nc: u32,
    realm: String,
    digest_uri: String,
}

impl DigestMd5 {
    fn from_credentials(creds: Credentials, service_host: &str) -> Self {
        let mut cnonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cnonce_bytes);
        let cnonce = hex(&cnonce_bytes);
        Self {
            username: creds.username.clone().unwrap_or_default(),
            password: creds.password.clone().unwrap_or_default(),
            cnonce,
            nc: 1,
            realm: String::new(),
            digest_uri: format!("xmpp/{service_host}"),
        }
    }

    fn h(s: &[u8]) -> [u8; 16] {
        Md5::digest(s).into()
    }

    /// `HMAC-style` digest-response as defined by RFC 2831 §2.1.2.1.
    fn compute_response(&self, nonce: &str, qop: &str) -> String {
        let a1_start = Self::h(format!("{}:{}:{}", self.username, self.realm, self.password).as_bytes());
        let mut a1 = Vec::from(a1_start);
        a1.extend_from_slice(format!(":{}:{}", nonce, self.cnonce).as_bytes());
        let ha1 = hex(&Self::h(&a1));

        let a2 = format!("AUTHENTICATE:{}", self.digest_uri);
        let ha2 = hex(&Self::h(a2.as_bytes()));

        let kd = format!(
            "{}:{}:{:08x}:{}:{}:{}",
            ha1, nonce, self.nc, self.cnonce, qop, ha2
        );
        hex(&Self::h(kd.as_bytes()))
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn parse_directives(challenge: &[u8]) -> Vec<(String, String)> {
    let s = String::from_utf8_lossy(challenge);
    let mut out = Vec::new();
    for part in s.split(',') {
        if let Some((k, v)) = part.split_once('=') {
            let v = v.trim().trim_matches('"');
            out.push((k.trim().to_owned(), v.to_owned()));
        }
    }
    out
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &str {
        "DIGEST-MD5"
    }

    fn initial(&mut self) -> Vec<u8> {
        // DIGEST-MD5 has no initial response; the first challenge carries
        // the nonce.
        Vec::new()
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, String> {
        let directives = parse_directives(challenge);
        // A `rspauth` directive means the server is confirming our previous
        // response; nothing further to send but an empty final response.
        if directives.iter().any(|(k, _)| k == "rspauth") {
            return Ok(Vec::new());
        }

        let nonce = directives
            .iter()
            .find(|(k, _)| k == "nonce")
            .map(|(_, v)| v.clone())
            .ok_or_else(|| "DIGEST-MD5 challenge missing nonce".to_owned())?;
        if let Some((_, realm)) = directives.iter().find(|(k, _)| k == "realm") {
            self.realm = realm.clone();
        }
        let qop = directives
            .iter()
            .find(|(k, _)| k == "qop")
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| "auth".to_owned());

        let response = self.compute_response(&nonce, "auth");
        let out = format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={:08x},qop={},\
             digest-uri=\"{}\",response={},charset=utf-8",
            self.username, self.realm, nonce, self.cnonce, self.nc, qop, self.digest_uri, response
        );
        self.nc += 1;
        Ok(out.into_bytes())
    }

    fn success(&mut self, _data: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_prefers_scram_over_digest_over_plain() {
        let advertised: HashSet<String> = ["PLAIN", "DIGEST-MD5", "SCRAM-SHA-1"]
            .into_iter()
            .map(String::from)
            .collect();
        let creds = Credentials::default()
            .with_username("u")
            .with_password("p");
        let chosen = select(&advertised, &creds, "example.org").unwrap();
        assert_eq!(chosen.name(), "SCRAM-SHA-1");
    }

    #[test]
    fn falls_back_to_digest_md5_when_scram_unavailable() {
        let advertised: HashSet<String> = ["PLAIN", "DIGEST-MD5"]
            .into_iter()
            .map(String::from)
            .collect();
        let creds = Credentials::default()
            .with_username("u")
            .with_password("p");
        let chosen = select(&advertised, &creds, "example.org").unwrap();
        assert_eq!(chosen.name(), "DIGEST-MD5");
    }

    #[test]
    fn no_supported_mechanism_is_an_error() {
        let advertised: HashSet<String> = ["GSSAPI"].into_iter().map(String::from).collect();
        let creds = Credentials::default();
        assert!(matches!(
            select(&advertised, &creds, "example.org"),
            Err(AuthError::NoMechanism)
        ));
    }

    #[test]
    fn digest_md5_response_contains_expected_directives() {
        let mut mech = DigestMd5::from_credentials(
            Credentials::default().with_username("u").with_password("p"),
            "example.org",
        );
        let challenge = br#"realm="example.org",nonce="abcdef",qop="auth",charset=utf-8"#;
        let response = mech.response(challenge).unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("username=\"u\""));
        assert!(text.contains("nonce=\"abcdef\""));
        assert!(text.contains("response="));
    }
}
