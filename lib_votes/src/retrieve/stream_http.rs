//! # Streaming HTTP Dialer
//!
//! Sends the signed `statuses/filter` request and hands back the response
//! body as a stream of chunks. The body is never collected: it stays open for
//! as long as the endpoint keeps sending.

use std::io;
use std::time::Duration;

use futures_util::stream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use url::Url;

use crate::connections::stream_conn::{ConnectionError, Dialer, DIAL_TIMEOUT};
use crate::core::decoder::ByteStream;
use crate::core::options::Vocabulary;
use crate::signing::oauth1::{RequestSigner, SignError};

/// The public filter endpoint.
pub const DEFAULT_STREAM_URL: &str = "https://stream.twitter.com/1.1/statuses/filter.json";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const USER_AGENT: &str = concat!("twittervotes/", env!("CARGO_PKG_VERSION"));
// Enough of an error body to explain a rejection in the logs.
const ERROR_BODY_LIMIT: usize = 512;

/// A fully signed request, ready to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    url: Url,
    form: Vec<(String, String)>,
    authorization: String,
}

impl StreamRequest {
    /// Assembles a request from already signed parts.
    pub fn new(url: Url, form: Vec<(String, String)>, authorization: String) -> Self {
        Self {
            url,
            form,
            authorization,
        }
    }

    /// A signed POST to `endpoint` tracking every term in `vocabulary`.
    pub fn filter(endpoint: &Url, vocabulary: &Vocabulary, signer: &RequestSigner) -> Result<Self, SignError> {
        let form = vec![("track".to_string(), vocabulary.track_param())];
        let authorization = signer.authorization(&Method::POST, endpoint, &form)?;
        Ok(Self::new(endpoint.clone(), form, authorization))
    }

    /// Target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Form parameters, in order.
    pub fn form(&self) -> &[(String, String)] {
        &self.form
    }

    /// The `Authorization` header value.
    pub fn authorization(&self) -> &str {
        &self.authorization
    }

    /// The form parameters encoded as a request body.
    pub fn encoded_body(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.form.iter())
            .finish()
    }
}

/// Opens stream requests with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpStreamDialer {
    client: reqwest::Client,
}

impl HttpStreamDialer {
    /// A dialer with TCP keep-alive and a bounded connect phase.
    pub fn new() -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .tcp_keepalive(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Dialer for HttpStreamDialer {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, ConnectionError> {
        let response = self
            .client
            .post(request.url().clone())
            .header(AUTHORIZATION, request.authorization())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(request.encoded_body())
            .send()
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectionError::HttpStatus {
                status: status.as_u16(),
                body: body.trim().chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }
        log::debug!("Stream endpoint answered {}", status);

        // Yield chunks until the body ends; a read error ends it too.
        let body = stream::unfold(Some(response), |state| async move {
            let mut response = state?;
            match response.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(response))),
                Ok(None) => None,
                Err(e) => Some((Err(io::Error::other(e)), None)),
            }
        });
        Ok(Box::pin(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::credentials::Credentials;
    use std::sync::Arc;

    fn signer() -> RequestSigner {
        RequestSigner::new(Arc::new(Credentials::new("ck", "cs", "at", "as")))
    }

    #[test]
    fn test_filter_request_tracks_vocabulary() {
        let endpoint = Url::parse(DEFAULT_STREAM_URL).unwrap();
        let vocabulary = Vocabulary::from_polls([vec!["cat".to_string(), "hot dog".to_string()]]);
        let request = StreamRequest::filter(&endpoint, &vocabulary, &signer()).unwrap();

        assert_eq!(request.url(), &endpoint);
        assert_eq!(request.form(), [("track".to_string(), "cat,hot dog".to_string())]);
        assert_eq!(request.encoded_body(), "track=cat%2Chot+dog");
        assert!(request.authorization().starts_with("OAuth "));
        assert!(request.authorization().contains("oauth_signature=\""));
    }

    #[test]
    fn test_each_filter_request_gets_a_fresh_nonce() {
        let endpoint = Url::parse(DEFAULT_STREAM_URL).unwrap();
        let vocabulary = Vocabulary::from_polls([vec!["cat".to_string()]]);
        let first = StreamRequest::filter(&endpoint, &vocabulary, &signer()).unwrap();
        let second = StreamRequest::filter(&endpoint, &vocabulary, &signer()).unwrap();
        assert_ne!(first.authorization(), second.authorization());
    }

    #[test]
    fn test_dialer_builds() {
        assert!(HttpStreamDialer::new().is_ok());
    }
}
