//! The upstream timeline service.
//!
//! The bridge only needs three things from the social network: log in,
//! fetch the current timeline, and fetch what appeared since the last time
//! we asked. [`FeedSource`] is that seam; [`BlueskyClient`] implements it
//! with atrium and [`InMemoryFeedSource`] backs tests.

mod bluesky;
pub mod memory;
pub mod normalize;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::feed::FeedItem;

pub use bluesky::BlueskyClient;
pub use memory::InMemoryFeedSource;

/// Login credentials for the upstream account.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub handle: String,
    pub app_password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("handle", &self.handle)
            .field("app_password", &"<redacted>")
            .finish()
    }
}

/// The logged-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub did: String,
    pub handle: String,
}

#[async_trait]
pub trait FeedSource: Send + Sync + std::fmt::Debug {
    /// Authenticate. Failure here is fatal at startup.
    async fn login(&self, credentials: &Credentials) -> Result<Profile>;

    /// Fetch the whole current timeline, newest first. Does not affect what
    /// [`FeedSource::fetch_new_since_last_sync`] reports next.
    async fn fetch_snapshot(&self) -> Result<Vec<FeedItem>>;

    /// Fetch entries that appeared since the previous call, oldest first.
    async fn fetch_new_since_last_sync(&self) -> Result<Vec<FeedItem>>;
}
