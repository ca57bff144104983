//! # Stream Decoder
//!
//! The filter endpoint answers with a body that never ends: JSON objects
//! separated by `\r\n`, interleaved with blank keep-alive lines. The decoder
//! pulls chunks as they arrive, buffers only the record currently being
//! assembled and yields one [`Message`] at a time.
//!
//! Any failure ends decoding. Errors are classified so a supervisor can tell a
//! closed or broken connection from a record that will never parse.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use thiserror::Error;

/// Upper bound for a single record, in bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// The feed sends a keep-alive at least every 30 seconds; three missed ones
/// mean the connection is dead.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(90);

/// Failure while reading or decoding the body.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The body ended cleanly between records.
    #[error("stream closed by remote host")]
    Closed,

    /// The body ended in the middle of a record.
    #[error("stream ended inside a record ({0} bytes pending)")]
    Truncated(usize),

    /// A record is not valid JSON or not an object.
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A record grew past the configured limit.
    #[error("record exceeds {0} bytes")]
    Oversized(usize),

    /// Nothing arrived for longer than the stall timeout.
    #[error("no data for {0:?}")]
    Stalled(Duration),

    /// The underlying read failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection was closed locally.
    #[error("connection closed locally")]
    Cancelled,
}

impl DecodeError {
    /// Whether opening a new connection could get the stream going again.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DecodeError::Cancelled)
    }
}

/// One decoded status from the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Message {
    /// The (possibly truncated) status text.
    #[serde(default)]
    pub text: String,
    /// Present for statuses longer than the legacy limit.
    #[serde(default)]
    pub extended_tweet: Option<ExtendedTweet>,
}

/// The untruncated form of a long status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExtendedTweet {
    /// The full status text.
    #[serde(default)]
    pub full_text: String,
}

impl Message {
    /// The text to match against: the full text when the feed provides one.
    pub fn body(&self) -> &str {
        match &self.extended_tweet {
            Some(extended) if !extended.full_text.is_empty() => &extended.full_text,
            _ => &self.text,
        }
    }
}

/// Something that yields body chunks until it ends.
pub trait ChunkSource: Send {
    /// The next chunk, `None` at end of body.
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Bytes>, DecodeError>> + Send;
}

/// A boxed byte stream, as produced by dialers.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

impl ChunkSource for ByteStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, DecodeError> {
        match self.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(DecodeError::Transport(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Decodes records from a [`ChunkSource`] one at a time.
pub struct StreamDecoder<S> {
    source: S,
    buffer: BytesMut,
    max_message_bytes: usize,
    stall_timeout: Duration,
}

impl<S: ChunkSource> StreamDecoder<S> {
    /// A decoder with the default size limit and stall timeout.
    pub fn new(source: S) -> Self {
        Self {
            source,
            buffer: BytesMut::with_capacity(8 * 1024),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    /// Overrides the per-record size limit.
    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    /// Overrides the stall timeout.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Gives the source back, e.g. to release the connection.
    pub fn into_inner(self) -> S {
        self.source
    }

    /// Waits for and decodes the next record.
    pub async fn next_message(&mut self) -> Result<Message, DecodeError> {
        loop {
            if let Some(message) = self.try_decode()? {
                return Ok(message);
            }
            // Only the unfinished tail counts against the limit.
            if self.buffer.len() > self.max_message_bytes {
                return Err(DecodeError::Oversized(self.max_message_bytes));
            }

            let chunk = tokio::time::timeout(self.stall_timeout, self.source.next_chunk())
                .await
                .map_err(|_| DecodeError::Stalled(self.stall_timeout))??;

            match chunk {
                Some(bytes) => self.buffer.extend_from_slice(&bytes),
                None if self.buffer.is_empty() => return Err(DecodeError::Closed),
                None => return Err(DecodeError::Truncated(self.buffer.len())),
            }
        }
    }

    /// Decodes one record from the buffer if a complete one is present.
    fn try_decode(&mut self) -> Result<Option<Message>, DecodeError> {
        // Keep-alive newlines and separators.
        match self.buffer.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => self.buffer.advance(start),
            None => {
                self.buffer.clear();
                return Ok(None);
            }
        }

        let (result, consumed) = {
            let mut records = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Message>();
            let result = records.next();
            (result, records.byte_offset())
        };

        match result {
            Some(Ok(message)) => {
                self.buffer.advance(consumed);
                Ok(Some(message))
            }
            Some(Err(e)) if e.is_eof() || error_at_end(&self.buffer, &e) => Ok(None),
            Some(Err(e)) => Err(DecodeError::Malformed(e)),
            None => Ok(None),
        }
    }
}

/// True when `error` points at the last buffered byte. A number cut after
/// `-`, `.` or `e` fails as a syntax error there, yet more bytes may
/// complete it.
fn error_at_end(buffer: &[u8], error: &serde_json::Error) -> bool {
    let line_start = match error.line() {
        0 | 1 => 0,
        line => buffer
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .nth(line - 2)
            .map_or(buffer.len(), |(i, _)| i + 1),
    };
    line_start + error.column() >= buffer.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn source(chunks: &[&str]) -> ByteStream {
        let items: Vec<Result<Bytes, std::io::Error>> = chunks
            .iter()
            .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
            .collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn test_decodes_records_split_across_chunks() {
        let mut decoder = StreamDecoder::new(source(&[
            "{\"text\":\"first ",
            "one\"}\r\n{\"te",
            "xt\":\"second\"}\r\n",
        ]));

        assert_eq!(decoder.next_message().await.unwrap().text, "first one");
        assert_eq!(decoder.next_message().await.unwrap().text, "second");
        assert!(matches!(decoder.next_message().await, Err(DecodeError::Closed)));
    }

    #[tokio::test]
    async fn test_numbers_split_mid_token_wait_for_the_rest() {
        for chunks in [
            ["{\"text\":\"x\",\"lat\":-", "73.5}\r\n"],
            ["{\"text\":\"x\",\"lat\":73.", "5}\r\n"],
            ["{\"text\":\"x\",\"lat\":7e", "3}\r\n"],
            ["{\"text\":\"x\",\"lat\":7e-", "3}\r\n"],
        ] {
            let mut decoder = StreamDecoder::new(source(&chunks));
            assert_eq!(decoder.next_message().await.unwrap().text, "x", "chunks {:?}", chunks);
            assert!(matches!(decoder.next_message().await, Err(DecodeError::Closed)));
        }
    }

    #[tokio::test]
    async fn test_body_ending_mid_number_is_truncated() {
        let mut decoder = StreamDecoder::new(source(&["{\"text\":\"x\",\"lat\":-"]));
        assert!(matches!(decoder.next_message().await, Err(DecodeError::Truncated(19))));
    }

    #[tokio::test]
    async fn test_split_number_after_a_newline_waits_for_the_rest() {
        let mut decoder = StreamDecoder::new(source(&["{\"text\":\"a\"}\n{\"text\":\"b\",\"n\":1.", "5}"]));
        assert_eq!(decoder.next_message().await.unwrap().text, "a");
        assert_eq!(decoder.next_message().await.unwrap().text, "b");
    }

    #[tokio::test]
    async fn test_skips_keepalive_lines() {
        let mut decoder = StreamDecoder::new(source(&["\r\n", "\r\n\r\n", "{\"text\":\"hi\"}", "\r\n"]));
        assert_eq!(decoder.next_message().await.unwrap().text, "hi");
        assert!(matches!(decoder.next_message().await, Err(DecodeError::Closed)));
    }

    #[tokio::test]
    async fn test_several_records_in_one_chunk() {
        let mut decoder = StreamDecoder::new(source(&["{\"text\":\"a\"}{\"text\":\"b\"}\n{\"text\":\"c\"}"]));
        for expected in ["a", "b", "c"] {
            assert_eq!(decoder.next_message().await.unwrap().text, expected);
        }
    }

    #[tokio::test]
    async fn test_records_without_text_decode_empty() {
        let mut decoder = StreamDecoder::new(source(&["{\"limit\":{\"track\":12}}\r\n"]));
        let message = decoder.next_message().await.unwrap();
        assert_eq!(message.body(), "");
    }

    #[tokio::test]
    async fn test_extended_text_wins() {
        let mut decoder = StreamDecoder::new(source(&[
            "{\"text\":\"short…\",\"extended_tweet\":{\"full_text\":\"short and then the rest\"}}",
        ]));
        assert_eq!(decoder.next_message().await.unwrap().body(), "short and then the rest");
    }

    #[tokio::test]
    async fn test_garbage_after_record_is_malformed() {
        let mut decoder = StreamDecoder::new(source(&["{\"text\":\"ok\"}\r\n", "<html>oops</html>"]));
        assert_eq!(decoder.next_message().await.unwrap().text, "ok");
        let err = decoder.next_message().await.unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_non_object_record_is_malformed() {
        let mut decoder = StreamDecoder::new(source(&["\"just a string\"\r\n"]));
        assert!(matches!(decoder.next_message().await, Err(DecodeError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_body_ending_mid_record_is_truncated() {
        let mut decoder = StreamDecoder::new(source(&["{\"text\":\"never fin"]));
        assert!(matches!(decoder.next_message().await, Err(DecodeError::Truncated(18))));
    }

    #[tokio::test]
    async fn test_oversized_record_is_rejected() {
        let long = format!("{{\"text\":\"{}", "x".repeat(64));
        let mut decoder = StreamDecoder::new(source(&[long.as_str(), "more"])).with_max_message_bytes(32);
        assert!(matches!(decoder.next_message().await, Err(DecodeError::Oversized(32))));
    }

    #[tokio::test]
    async fn test_limit_applies_per_record_not_per_chunk() {
        let records = "{\"text\":\"a\"}\r\n".repeat(5);
        let mut decoder = StreamDecoder::new(source(&[records.as_str()])).with_max_message_bytes(32);
        for _ in 0..5 {
            assert_eq!(decoder.next_message().await.unwrap().text, "a");
        }
        assert!(matches!(decoder.next_message().await, Err(DecodeError::Closed)));
    }

    #[tokio::test]
    async fn test_transport_error_is_reported() {
        let items: Vec<Result<Bytes, std::io::Error>> = vec![Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ))];
        let body: ByteStream = Box::pin(stream::iter(items));
        let mut decoder = StreamDecoder::new(body);
        assert!(matches!(decoder.next_message().await, Err(DecodeError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_body_stalls() {
        let body: ByteStream = Box::pin(stream::pending());
        let mut decoder = StreamDecoder::new(body).with_stall_timeout(Duration::from_secs(5));
        assert!(matches!(decoder.next_message().await, Err(DecodeError::Stalled(_))));
    }

    #[test]
    fn test_cancelled_is_not_recoverable() {
        assert!(!DecodeError::Cancelled.is_recoverable());
        assert!(DecodeError::Closed.is_recoverable());
    }
}
