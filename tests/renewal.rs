//! Renewal through the server facade and the background scheduler.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;

use hostgate::acme::{RenewalError, RenewalScheduler};
use hostgate::config::RenewalConfig;
use hostgate::lifecycle::Shutdown;
use hostgate::security::TrustOracle;
use hostgate::site::{HandlerChain, TextHandler};

mod common;
use common::{client, Script, SiteSpec, TestServer};

const HOSTS: &[&str] = &["a.test", "www.a.test"];

fn sites() -> Vec<SiteSpec> {
    vec![
        SiteSpec::new(HOSTS, HandlerChain::new().with(TextHandler::new("a"))).with_email("ops@a.test"),
        SiteSpec::new(&["quiet.test"], HandlerChain::new().with(TextHandler::new("quiet"))),
    ]
}

#[tokio::test]
async fn test_renew_swaps_certificate_and_keeps_serving() {
    let ts = TestServer::start(sites(), TrustOracle::new(), Script::default()).await;
    let before = ts.server.registry().get("a.test").unwrap().certified_key();
    let files_before = common::read_pair(&ts.sites[0]);

    ts.server.renew("www.a.test").await.unwrap();

    let after = ts.server.registry().get("a.test").unwrap().certified_key();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(ts.journal.accounts(), 1);
    assert_ne!(files_before, common::read_pair(&ts.sites[0]));

    // Issued certificate lands on disk as leaf followed by the chain.
    let (_, cert_pem) = common::read_pair(&ts.sites[0]);
    assert_eq!(cert_pem.matches("BEGIN CERTIFICATE").count(), 2);
    assert!(ts.server.registry().get("a.test").unwrap().pending_challenge().is_none());

    let res = client(HOSTS).get(ts.https_url("a.test", "/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "a");

    ts.stop().await;
}

#[tokio::test]
async fn test_failed_renewal_changes_nothing() {
    let script = Script {
        fail_finalize: true,
        ..Script::default()
    };
    let ts = TestServer::start(sites(), TrustOracle::new(), script).await;
    let before = ts.server.registry().get("a.test").unwrap().certified_key();
    let files_before = common::read_pair(&ts.sites[0]);

    let err = ts.server.renew("a.test").await.unwrap_err();
    assert!(matches!(err, RenewalError::Finalize(_)), "{err}");
    assert_eq!(err.stage(), "finalize");

    let site = ts.server.registry().get("a.test").unwrap();
    assert!(Arc::ptr_eq(&before, &site.certified_key()));
    assert!(site.pending_challenge().is_none());
    assert_eq!(files_before, common::read_pair(&ts.sites[0]));

    // No temp files left behind.
    let leftovers: Vec<_> = std::fs::read_dir(ts.dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");

    ts.stop().await;
}

#[tokio::test]
async fn test_renew_without_contact_or_owner_is_a_no_op() {
    let ts = TestServer::start(sites(), TrustOracle::new(), Script::default()).await;
    let before = ts.server.registry().get("quiet.test").unwrap().certified_key();

    ts.server.renew("quiet.test").await.unwrap();
    ts.server.renew("nobody.test").await.unwrap();

    assert_eq!(ts.journal.accounts(), 0);
    assert!(Arc::ptr_eq(
        &before,
        &ts.server.registry().get("quiet.test").unwrap().certified_key()
    ));

    ts.stop().await;
}

#[tokio::test]
async fn test_concurrent_renewals_of_one_site_are_serialized() {
    let ts = TestServer::start(sites(), TrustOracle::new(), Script::default()).await;

    let (first, second) = tokio::join!(ts.server.renew("a.test"), ts.server.renew("www.a.test"));
    first.unwrap();
    second.unwrap();

    assert_eq!(ts.journal.accounts(), 2);
    assert_eq!(ts.journal.max_active_orders.load(Ordering::SeqCst), 1);
    // Every validation of both sessions saw its own token.
    let validations = ts.journal.validations();
    assert_eq!(validations.len(), 4);
    assert!(validations.iter().all(|v| v.passed()), "{validations:?}");

    ts.stop().await;
}

#[tokio::test]
async fn test_scheduler_renews_expiring_certificates() {
    let ts = TestServer::start(sites(), TrustOracle::new(), Script::default()).await;
    let before = ts.server.registry().get("a.test").unwrap().certified_key();

    // Any certificate expires within this window.
    let config = RenewalConfig {
        enabled: true,
        check_interval_secs: 3600,
        renew_before_days: 1_000_000,
    };
    let shutdown = Shutdown::new();
    let scheduler = RenewalScheduler::new(
        ts.server.certificate_manager(),
        ts.server.registry().clone(),
        &config,
    );
    let task = tokio::spawn(scheduler.run(shutdown.clone()));

    tokio::time::timeout(Duration::from_secs(10), async {
        while Arc::ptr_eq(&before, &ts.server.registry().get("a.test").unwrap().certified_key()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("scheduler never renewed");

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("scheduler did not stop")
        .unwrap();

    // The site without a contact is checked but left alone.
    assert_eq!(ts.journal.accounts(), 1);

    ts.stop().await;
}
