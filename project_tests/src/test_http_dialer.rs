//! # HTTP Dialer Integration Tests
//!
//! Runs the `reqwest` based dialer against a throwaway HTTP/1.1 server on
//! loopback that answers with a chunked, never-ending body, the way the
//! filter endpoint does. The server hands back the raw request it received
//! so the tests can check the wire format.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use url::Url;

use lib_votes::core::decoder::DecodeError;
use lib_votes::{
    vote_channel, ConnectionError, ConnectionManager, Credentials, HttpStreamDialer, ReconnectPolicy,
    RequestSigner, SessionEnd, SessionState, StaticOptions, StreamConfig, StreamRequest, TwitterStreamIngestor,
};

/// How the fake endpoint answers.
#[derive(Clone)]
enum Reply {
    /// 200 with these chunks, then the terminating chunk.
    Stream(Vec<&'static str>),
    /// 200 with these chunks, then silence with the socket open.
    Hold(Vec<&'static str>),
    /// An error status with a short body.
    Status(u16, &'static str),
    /// Accept the connection and never answer.
    Mute,
}

struct FakeEndpoint {
    url: Url,
    request: oneshot::Receiver<String>,
}

async fn serve(reply: Reply) -> Result<FakeEndpoint> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = Url::parse(&format!("http://{}/1.1/statuses/filter.json", listener.local_addr()?))?;
    let (request_tx, request_rx) = oneshot::channel();

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        if let Ok(raw) = read_request(&mut socket).await {
            let _ = request_tx.send(raw);
        }
        let _ = respond(&mut socket, reply).await;
    });

    Ok(FakeEndpoint {
        url,
        request: request_rx,
    })
}

// Reads the head and a Content-Length body.
async fn read_request(socket: &mut TcpStream) -> Result<String> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&raw).to_string();
        if let Some(head_end) = text.find("\r\n\r\n") {
            let content_length = text[..head_end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if raw.len() >= head_end + 4 + content_length {
                break;
            }
        }
    }
    Ok(String::from_utf8_lossy(&raw).to_string())
}

async fn respond(socket: &mut TcpStream, reply: Reply) -> Result<()> {
    let (chunks, hold) = match reply {
        Reply::Stream(chunks) => (chunks, false),
        Reply::Hold(chunks) => (chunks, true),
        Reply::Status(status, body) => {
            let response = format!(
                "HTTP/1.1 {} Error\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await?;
            return Ok(());
        }
        Reply::Mute => {
            std::future::pending::<()>().await;
            return Ok(());
        }
    };

    socket
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await?;
    for chunk in chunks {
        socket
            .write_all(format!("{:x}\r\n{}\r\n", chunk.len(), chunk).as_bytes())
            .await?;
        socket.flush().await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if hold {
        // Keep the socket open until the client goes away.
        let mut sink = [0u8; 64];
        while socket.read(&mut sink).await.unwrap_or(0) > 0 {}
    } else {
        socket.write_all(b"0\r\n\r\n").await?;
    }
    Ok(())
}

fn signer() -> RequestSigner {
    RequestSigner::new(Arc::new(Credentials::new("ck", "cs", "at", "as")))
}

type HttpIngestor = TwitterStreamIngestor<StaticOptions, HttpStreamDialer>;

fn http_ingestor(url: Url, options: &[&str]) -> (Arc<HttpIngestor>, tokio::sync::mpsc::Receiver<lib_votes::Vote>) {
    let mut config = StreamConfig::new(url);
    config.reconnect = ReconnectPolicy::never();
    let shutdown = CancellationToken::new();
    let (emitter, votes) = vote_channel(16, shutdown.clone());
    let ingestor = TwitterStreamIngestor::new(
        config,
        StaticOptions::new(options.iter().copied()),
        signer(),
        Arc::new(ConnectionManager::new(HttpStreamDialer::new().unwrap())),
        emitter,
        shutdown,
    );
    (Arc::new(ingestor), votes)
}

#[tokio::test]
async fn test_session_posts_signed_form_and_decodes_chunked_records() {
    let endpoint = serve(Reply::Stream(vec![
        "\r\n",
        "{\"text\":\"Team cat\"}\r\n{\"te",
        "xt\":\"no pets here\"}\r\n",
        "{\"text\":\"a DOG\"}\r\n",
    ]))
    .await
    .unwrap();
    let (ingestor, mut votes) = http_ingestor(endpoint.url.clone(), &["cat", "dog"]);

    let outcome = ingestor.run_session().await;
    assert_eq!(outcome.messages, 3);
    assert!(matches!(outcome.end, SessionEnd::StreamEnded(DecodeError::Closed)));

    let mut got = Vec::new();
    while let Ok(vote) = votes.try_recv() {
        got.push(vote.option);
    }
    assert_eq!(got, ["cat", "dog"]);

    let raw = endpoint.request.await.unwrap();
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let head_lower = head.to_lowercase();
    assert!(head.starts_with("POST /1.1/statuses/filter.json HTTP/1.1"));
    assert!(head_lower.contains("content-type: application/x-www-form-urlencoded"));
    assert!(head_lower.contains("authorization: oauth "));
    assert!(head.contains("oauth_consumer_key=\"ck\""));
    assert!(head.contains("oauth_signature_method=\"HMAC-SHA1\""));
    assert!(head.contains("oauth_signature=\""));
    assert_eq!(body, "track=cat%2Cdog");
}

#[tokio::test]
async fn test_error_status_fails_the_dial() {
    let endpoint = serve(Reply::Status(401, "Unauthorized")).await.unwrap();
    let manager = ConnectionManager::new(HttpStreamDialer::new().unwrap());
    let request = StreamRequest::new(
        endpoint.url.clone(),
        vec![("track".to_string(), "cat".to_string())],
        "OAuth test".to_string(),
    );

    let err = manager.dial(&request).await.err().unwrap();
    assert!(matches!(&err, ConnectionError::HttpStatus { status: 401, body } if body == "Unauthorized"));
    assert!(err.is_auth_failure());
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_silent_endpoint_times_out() {
    let endpoint = serve(Reply::Mute).await.unwrap();
    let manager =
        ConnectionManager::new(HttpStreamDialer::new().unwrap()).with_dial_timeout(Duration::from_millis(300));
    let request = StreamRequest::new(endpoint.url.clone(), vec![], "OAuth test".to_string());

    let err = manager.dial(&request).await.err().unwrap();
    assert!(matches!(err, ConnectionError::Timeout(_)));
}

#[tokio::test]
async fn test_close_unblocks_a_live_http_read() {
    let endpoint = serve(Reply::Hold(vec!["{\"text\":\"cat\"}\r\n", "\r\n"])).await.unwrap();
    let (ingestor, mut votes) = http_ingestor(endpoint.url.clone(), &["cat"]);

    let session = tokio::spawn({
        let ingestor = Arc::clone(&ingestor);
        async move { ingestor.run_session().await }
    });
    assert_eq!(votes.recv().await.unwrap().option, "cat");
    assert_eq!(ingestor.state(), SessionState::Streaming);

    ingestor.connections().close().await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
    assert!(matches!(outcome.end, SessionEnd::StreamEnded(DecodeError::Cancelled)));
    assert_eq!(outcome.votes, 1);
}
