//! End-to-end: concurrent callers racing a stale access token coalesce onto a single upstream
//! refresh POST instead of each firing their own (spec §8 scenario 4).

mod support;

use std::sync::Arc;
use std::time::Duration;

use spotify_skip_tracker::clock::SystemClock;
use spotify_skip_tracker::credentials::CredentialStore;
use spotify_skip_tracker::token_manager::TokenManager;
use spotify_skip_tracker::token_store::TokenStore;

use support::{CannedResponse, MockServer};

#[tokio::test]
async fn concurrent_refreshes_coalesce_onto_one_upstream_call() {
    let server = MockServer::start(vec![CannedResponse::json(
        200,
        r#"{"access_token":"new-access","refresh_token":"new-refresh","expires_in":3600}"#,
    )
    // Hold the response open long enough that every concurrent caller below has definitely
    // already asked to join the in-flight refresh before any of them could see a result.
    .with_delay(Duration::from_millis(200))])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let credentials = Arc::new(CredentialStore::new());
    credentials.set("client-id".into(), "client-secret".into()).unwrap();

    let manager = Arc::new(
        TokenManager::new(TokenStore::new(dir.path()), credentials, Arc::new(SystemClock))
            .with_token_endpoint(server.url("/api/token")),
    );
    manager
        .set("stale-access".into(), Some("refresh-token".into()), 3600)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.refresh().await }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(server.request_count(), 1, "8 concurrent refreshes should hit the upstream once");
    assert_eq!(manager.get().await.as_deref(), Some("new-access"));
}
