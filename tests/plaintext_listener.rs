//! Plaintext listener: redirects, unknown hosts, challenges, the trigger.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use hostgate::security::TrustOracle;
use hostgate::site::{HandlerChain, TextHandler};

mod common;
use common::{client, Script, SiteSpec, TestServer};

const HOSTS: &[&str] = &["a.test", "www.a.test"];

fn site() -> SiteSpec {
    SiteSpec::new(HOSTS, HandlerChain::new().with(TextHandler::new("hello"))).with_email("ops@a.test")
}

#[tokio::test]
async fn test_redirects_to_https_without_trailing_slash() {
    let ts = TestServer::start(vec![site()], TrustOracle::new(), Script::default()).await;

    let res = client(HOSTS)
        .get(ts.http_url("a.test", "/x/?q=1"))
        .send()
        .await
        .expect("plaintext listener unreachable");

    assert_eq!(res.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        res.headers()["location"],
        format!("https://a.test:{}/x?q=1", ts.https_addr.port()).as_str()
    );
    assert_eq!(res.headers()["strict-transport-security"], "max-age=86400");

    ts.stop().await;
}

#[tokio::test]
async fn test_unknown_host_gets_no_response() {
    let ts = TestServer::start(vec![site()], TrustOracle::new(), Script::default()).await;

    let mut stream = TcpStream::connect(ts.http_addr).await.unwrap();
    stream
        .write_all(b"GET /.well-known/acme-challenge/abc HTTP/1.1\r\nHost: nobody.test\r\n\r\n")
        .await
        .unwrap();
    let mut received = Vec::new();
    let _ = stream.read_to_end(&mut received).await;
    assert!(received.is_empty(), "expected a bare close, got {:?}", String::from_utf8_lossy(&received));

    ts.stop().await;
}

#[tokio::test]
async fn test_challenge_without_pending_token_is_not_found() {
    let ts = TestServer::start(vec![site()], TrustOracle::new(), Script::default()).await;
    let client = client(HOSTS);

    let res = client
        .get(ts.http_url("a.test", "/.well-known/acme-challenge/whatever"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(ts.http_url("a.test", "/.well-known/acme-challenge/whatever"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

    ts.stop().await;
}

#[tokio::test]
async fn test_untrusted_trigger_redirects_and_never_renews() {
    let trust = TrustOracle::resolved("203.0.113.77");
    let ts = TestServer::start(vec![site()], trust, Script::default()).await;
    let before = ts.server.registry().get("a.test").unwrap().certified_key();

    let res = client(HOSTS)
        .get(ts.http_url("a.test", "/update_certificate"))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(ts.journal.accounts(), 0);
    assert!(Arc::ptr_eq(
        &before,
        &ts.server.registry().get("a.test").unwrap().certified_key()
    ));

    ts.stop().await;
}

#[tokio::test]
async fn test_trusted_trigger_renews_and_serves_challenges() {
    let trust = TrustOracle::resolved("127.0.0.1");
    let ts = TestServer::start(vec![site()], trust, Script::default()).await;
    let before = ts.server.registry().get("a.test").unwrap().certified_key();
    let files_before = common::read_pair(&ts.sites[0]);
    let client = client(HOSTS);

    let res = client
        .get(ts.http_url("www.a.test", "/update_certificate"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Both hostnames were validated over the plaintext listener while pending.
    let validations = ts.journal.validations();
    assert_eq!(validations.len(), 2);
    assert!(validations.iter().all(|v| v.passed()), "{validations:?}");
    assert_eq!(validations[0].hostname, "a.test");
    assert_eq!(validations[1].hostname, "www.a.test");

    // Once the session is over the tokens are gone.
    for validation in &validations {
        let path = format!("/.well-known/acme-challenge/{}", validation.token);
        let res = client.get(ts.http_url(&validation.hostname, &path)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    let after = ts.server.registry().get("a.test").unwrap().certified_key();
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(Arc::ptr_eq(
        &after,
        &ts.server.registry().get("www.a.test").unwrap().certified_key()
    ));
    assert_ne!(files_before, common::read_pair(&ts.sites[0]));

    ts.stop().await;
}

#[tokio::test]
async fn test_failed_trigger_reports_the_error() {
    let trust = TrustOracle::resolved("127.0.0.1");
    let script = Script {
        fail_finalize: true,
        ..Script::default()
    };
    let ts = TestServer::start(vec![site()], trust, script).await;
    let files_before = common::read_pair(&ts.sites[0]);

    let res = client(HOSTS)
        .get(ts.http_url("a.test", "/update_certificate"))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(res.headers()["content-type"], "text/plain; charset=utf-8");
    let body = res.text().await.unwrap();
    assert!(body.contains("finalize"), "{body}");
    assert_eq!(files_before, common::read_pair(&ts.sites[0]));

    ts.stop().await;
}

#[tokio::test]
async fn test_trigger_completes_after_the_peer_hangs_up() {
    let trust = TrustOracle::resolved("127.0.0.1");
    let script = Script {
        validation_delay: Duration::from_millis(300),
        ..Script::default()
    };
    let ts = TestServer::start(vec![site()], trust, script).await;
    let before = ts.server.registry().get("a.test").unwrap().certified_key();
    let files_before = common::read_pair(&ts.sites[0]);

    let mut stream = TcpStream::connect(ts.http_addr).await.unwrap();
    stream
        .write_all(b"GET /update_certificate HTTP/1.1\r\nHost: a.test\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(stream);

    tokio::time::timeout(Duration::from_secs(10), async {
        while Arc::ptr_eq(&before, &ts.server.registry().get("a.test").unwrap().certified_key()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("renewal was abandoned with the connection");

    let validations = ts.journal.validations();
    assert_eq!(validations.len(), 2);
    assert!(validations.iter().all(|v| v.passed()), "{validations:?}");
    assert_ne!(files_before, common::read_pair(&ts.sites[0]));
    assert!(ts.server.registry().get("a.test").unwrap().pending_challenge().is_none());

    ts.stop().await;
}
