use std::sync::Arc;
use std::time::Duration;

use parley_api::chat::TypingRegistry;
use parley_api::limit::SendRateLimiter;
use parley_api::storage::BlobStore;
use parley_api::{AppState, AppStateInner};
use parley_db::Database;
use tempfile::TempDir;

pub async fn test_state() -> (TempDir, AppState) {
    test_state_with_limit(50).await
}

pub async fn test_state_with_limit(max_sends_per_minute: u32) -> (TempDir, AppState) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open(&dir.path().join("parley.db")).expect("open db");
    let blobs = BlobStore::new(dir.path().join("blobs"))
        .await
        .expect("blob store");

    let state = Arc::new(AppStateInner {
        db,
        blobs,
        jwt_secret: "test-secret".to_string(),
        limiter: SendRateLimiter::new(max_sends_per_minute, Duration::from_secs(60)),
        typing: TypingRegistry::new(),
    });

    (dir, state)
}
