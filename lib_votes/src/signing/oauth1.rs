//! # OAuth 1.0a Signer
//!
//! Builds the `Authorization` header for a request from the loaded
//! [`Credentials`]. The signature covers the method, the normalized base URL
//! and every query, body and `oauth_*` parameter, and is computed with
//! HMAC-SHA1 keyed by the consumer and token secrets.

use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::distr::Alphanumeric;
use rand::Rng;
use reqwest::Method;
use sha1::Sha1;
use thiserror::Error;
use url::Url;

use crate::configs::credentials::Credentials;

type HmacSha1 = Hmac<Sha1>;

/// RFC 3986 unreserved characters stay literal; everything else is encoded.
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const SIGNATURE_METHOD: &str = "HMAC-SHA1";
const OAUTH_VERSION: &str = "1.0";
const NONCE_LEN: usize = 32;

/// Errors raised while signing a request.
#[derive(Debug, Error)]
pub enum SignError {
    /// The target URL cannot be reduced to a base string URI.
    #[error("Cannot sign URL without a host: {0}")]
    InvalidUrl(String),

    /// The HMAC key was rejected.
    #[error("Signing key rejected: {0}")]
    Key(String),
}

/// The per-request nonce and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthStamp {
    /// Random string unique to this request.
    pub nonce: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
}

impl OAuthStamp {
    /// A fixed stamp, for reproducible signatures.
    pub fn new(nonce: impl Into<String>, timestamp: i64) -> Self {
        Self {
            nonce: nonce.into(),
            timestamp,
        }
    }

    /// A fresh random nonce and the current time.
    pub fn generate() -> Self {
        let nonce: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        Self {
            nonce,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Signs requests on behalf of one set of credentials.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    credentials: Arc<Credentials>,
}

impl RequestSigner {
    /// Creates a signer that shares the given credentials.
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self { credentials }
    }

    /// `Authorization` header value with a freshly generated nonce and timestamp.
    pub fn authorization(
        &self,
        method: &Method,
        url: &Url,
        params: &[(String, String)],
    ) -> Result<String, SignError> {
        self.authorization_with(method, url, params, &OAuthStamp::generate())
    }

    /// `Authorization` header value for a caller-supplied stamp.
    ///
    /// `params` are the body parameters; query parameters are taken from `url`.
    pub fn authorization_with(
        &self,
        method: &Method,
        url: &Url,
        params: &[(String, String)],
        stamp: &OAuthStamp,
    ) -> Result<String, SignError> {
        let mut oauth = self.oauth_params(stamp);

        let mut all: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        all.extend(params.iter().cloned());
        all.extend(oauth.iter().cloned());

        let base = signature_base_string(method, url, &all)?;
        let signature = self.sign(&base)?;
        log::trace!("OAuth base string: {}", base);

        oauth.push(("oauth_signature".to_string(), signature));
        oauth.sort();

        let fields: Vec<String> = oauth
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
            .collect();
        Ok(format!("OAuth {}", fields.join(", ")))
    }

    fn oauth_params(&self, stamp: &OAuthStamp) -> Vec<(String, String)> {
        vec![
            ("oauth_consumer_key".to_string(), self.credentials.consumer_key.clone()),
            ("oauth_nonce".to_string(), stamp.nonce.clone()),
            ("oauth_signature_method".to_string(), SIGNATURE_METHOD.to_string()),
            ("oauth_timestamp".to_string(), stamp.timestamp.to_string()),
            ("oauth_token".to_string(), self.credentials.access_token.clone()),
            ("oauth_version".to_string(), OAUTH_VERSION.to_string()),
        ]
    }

    fn sign(&self, base: &str) -> Result<String, SignError> {
        let key = format!(
            "{}&{}",
            encode(&self.credentials.consumer_secret),
            encode(&self.credentials.access_secret)
        );
        let mut mac =
            HmacSha1::new_from_slice(key.as_bytes()).map_err(|e| SignError::Key(e.to_string()))?;
        mac.update(base.as_bytes());
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }
}

/// Percent-encodes `value` with the OAuth (RFC 3986) rules.
pub fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE_SET).to_string()
}

/// The scheme, host, non-default port and path of `url`, lowercasing the
/// scheme and host.
pub fn base_string_uri(url: &Url) -> Result<String, SignError> {
    let host = url
        .host_str()
        .ok_or_else(|| SignError::InvalidUrl(url.to_string()))?;
    let mut uri = format!(
        "{}://{}",
        url.scheme().to_ascii_lowercase(),
        host.to_ascii_lowercase()
    );
    // `Url::port` is `None` for the scheme's default port.
    if let Some(port) = url.port() {
        uri.push_str(&format!(":{}", port));
    }
    uri.push_str(url.path());
    Ok(uri)
}

/// `METHOD&encoded-uri&encoded-params` over the complete parameter set.
pub fn signature_base_string(
    method: &Method,
    url: &Url,
    params: &[(String, String)],
) -> Result<String, SignError> {
    let mut encoded: Vec<(String, String)> =
        params.iter().map(|(k, v)| (encode(k), encode(v))).collect();
    encoded.sort();

    let normalized = encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    Ok(format!(
        "{}&{}&{}",
        method.as_str().to_ascii_uppercase(),
        encode(&base_string_uri(url)?),
        encode(&normalized)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Published Twitter developer documentation example ("Creating a signature").
    fn reference_signer() -> RequestSigner {
        RequestSigner::new(Arc::new(Credentials::new(
            "xvz1evFS4wEEPTGEFPHBog",
            "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw",
            "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb",
            "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE",
        )))
    }

    fn reference_stamp() -> OAuthStamp {
        OAuthStamp::new("kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg", 1318622958)
    }

    fn reference_params() -> Vec<(String, String)> {
        vec![(
            "status".to_string(),
            "Hello Ladies + Gentlemen, a signed OAuth request!".to_string(),
        )]
    }

    fn reference_url() -> Url {
        Url::parse("https://api.twitter.com/1.1/statuses/update.json?include_entities=true").unwrap()
    }

    #[test]
    fn test_encode_keeps_unreserved_only() {
        assert_eq!(encode("Ladies + Gentlemen"), "Ladies%20%2B%20Gentlemen");
        assert_eq!(encode("a-b.c_d~e"), "a-b.c_d~e");
        assert_eq!(encode("cat,dog"), "cat%2Cdog");
        assert_eq!(encode("☃"), "%E2%98%83");
    }

    #[test]
    fn test_base_string_uri_normalizes() {
        let url = Url::parse("HTTP://Example.COM:80/r%20v/X?id=123").unwrap();
        assert_eq!(base_string_uri(&url).unwrap(), "http://example.com/r%20v/X");

        let url = Url::parse("https://www.example.net:8080/?q=1").unwrap();
        assert_eq!(base_string_uri(&url).unwrap(), "https://www.example.net:8080/");
    }

    #[test]
    fn test_signature_base_string_matches_reference() {
        let signer = reference_signer();
        let url = reference_url();
        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        params.extend(reference_params());
        params.extend(signer.oauth_params(&reference_stamp()));

        let base = signature_base_string(&Method::POST, &url, &params).unwrap();
        assert_eq!(
            base,
            "POST&https%3A%2F%2Fapi.twitter.com%2F1.1%2Fstatuses%2Fupdate.json&include_entities%3Dtrue%26oauth_consumer_key%3Dxvz1evFS4wEEPTGEFPHBog%26oauth_nonce%3DkYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg%26oauth_signature_method%3DHMAC-SHA1%26oauth_timestamp%3D1318622958%26oauth_token%3D370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb%26oauth_version%3D1.0%26status%3DHello%2520Ladies%2520%252B%2520Gentlemen%252C%2520a%2520signed%2520OAuth%2520request%2521"
        );
    }

    #[test]
    fn test_authorization_golden_vector() {
        let header = reference_signer()
            .authorization_with(&Method::POST, &reference_url(), &reference_params(), &reference_stamp())
            .unwrap();

        assert_eq!(
            header,
            "OAuth oauth_consumer_key=\"xvz1evFS4wEEPTGEFPHBog\", \
             oauth_nonce=\"kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg\", \
             oauth_signature=\"hCtSmYh%2BiHYCEqBWrE7C7hYmtUk%3D\", \
             oauth_signature_method=\"HMAC-SHA1\", \
             oauth_timestamp=\"1318622958\", \
             oauth_token=\"370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb\", \
             oauth_version=\"1.0\""
        );
    }

    #[test]
    fn test_filter_request_signature() {
        let signer = RequestSigner::new(Arc::new(Credentials::new("ck", "cs", "at", "as")));
        let url = Url::parse("https://stream.twitter.com/1.1/statuses/filter.json").unwrap();
        let params = vec![("track".to_string(), "cat,dog".to_string())];
        let header = signer
            .authorization_with(&Method::POST, &url, &params, &OAuthStamp::new("nonce123", 1700000000))
            .unwrap();

        assert!(header.contains("oauth_signature=\"QFxFqqgN3EoLnwqje7biQTdiWJU%3D\""));
    }

    #[test]
    fn test_signing_is_deterministic_for_fixed_stamp() {
        let signer = reference_signer();
        let first = signer
            .authorization_with(&Method::POST, &reference_url(), &reference_params(), &reference_stamp())
            .unwrap();
        let second = signer
            .authorization_with(&Method::POST, &reference_url(), &reference_params(), &reference_stamp())
            .unwrap();
        assert_eq!(first, second);

        let other = signer
            .authorization_with(
                &Method::POST,
                &reference_url(),
                &reference_params(),
                &OAuthStamp::new("another-nonce", 1318622958),
            )
            .unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn test_generated_stamp_shape() {
        let stamp = OAuthStamp::generate();
        assert_eq!(stamp.nonce.len(), NONCE_LEN);
        assert!(stamp.nonce.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(stamp.timestamp > 1_600_000_000);
        assert_ne!(stamp.nonce, OAuthStamp::generate().nonce);
    }
}
