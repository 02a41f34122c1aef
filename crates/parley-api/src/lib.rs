pub mod chat;
pub mod files;
pub mod identity;
pub mod limit;
pub mod membership;
pub mod middleware;
pub mod router;
pub mod storage;

use std::sync::Arc;

use parley_db::Database;

use crate::chat::TypingRegistry;
use crate::limit::SendRateLimiter;
use crate::storage::BlobStore;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub blobs: BlobStore,
    pub jwt_secret: String,
    pub limiter: SendRateLimiter,
    pub typing: TypingRegistry,
}
