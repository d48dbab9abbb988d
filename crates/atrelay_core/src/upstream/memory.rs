//! In-memory feed source for tests and local runs without network access.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Credentials, FeedSource, Profile};
use crate::error::{CoreError, Result};
use crate::feed::FeedItem;

#[derive(Debug, Default)]
pub struct InMemoryFeedSource {
    /// Current timeline, newest first
    timeline: Mutex<Vec<FeedItem>>,
    /// Entries pushed since the last incremental fetch, oldest first
    pending: Mutex<Vec<FeedItem>>,
    fail_next: AtomicBool,
}

impl InMemoryFeedSource {
    /// Start with a timeline given newest first, as the service delivers it.
    pub fn new(timeline: Vec<FeedItem>) -> Self {
        Self {
            timeline: Mutex::new(timeline),
            ..Default::default()
        }
    }

    /// Publish a new entry: it tops the timeline and is returned by the
    /// next incremental fetch.
    pub fn push(&self, item: FeedItem) {
        self.timeline.lock().insert(0, item.clone());
        self.pending.lock().push(item);
    }

    /// Make the next fetch of either kind fail.
    pub fn fail_next_fetch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CoreError::upstream_request(operation, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl FeedSource for InMemoryFeedSource {
    async fn login(&self, credentials: &Credentials) -> Result<Profile> {
        if credentials.app_password.is_empty() {
            return Err(CoreError::LoginFailed {
                handle: credentials.handle.clone(),
                cause: "empty password".to_string(),
            });
        }
        Ok(Profile {
            did: format!("did:plc:{}", credentials.handle.replace('.', "")),
            handle: credentials.handle.clone(),
        })
    }

    async fn fetch_snapshot(&self) -> Result<Vec<FeedItem>> {
        self.check_failure("fetch_snapshot")?;
        Ok(self.timeline.lock().clone())
    }

    async fn fetch_new_since_last_sync(&self) -> Result<Vec<FeedItem>> {
        self.check_failure("fetch_new_since_last_sync")?;
        Ok(std::mem::take(&mut *self.pending.lock()))
    }
}
