//! Bluesky timeline client on top of atrium's `AtpAgent`.

use std::collections::HashSet;

use async_trait::async_trait;
use atrium_api::agent::store::MemorySessionStore;
use atrium_api::agent::AtpAgent;
use atrium_api::app::bsky::feed::get_timeline;
use atrium_xrpc_client::reqwest::ReqwestClient;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Credentials, FeedSource, Profile};
use crate::error::{CoreError, Result};
use crate::feed::FeedItem;

const GET_TIMELINE: &str = "app.bsky.feed.getTimeline";
const REVERSE_CHRONOLOGICAL: &str = "reverse-chronological";

type Agent = AtpAgent<MemorySessionStore, ReqwestClient>;

/// Reverse-chronological home timeline of one account.
///
/// The agent keeps the session and refreshes expired access tokens on its
/// own, so callers only ever see a logged-in client or an error.
pub struct BlueskyClient {
    service: String,
    timeline_limit: u8,
    agent: Agent,
    /// Entry keys of the page the last incremental fetch saw. `None` until
    /// the first fetch of either kind seeds it; full snapshots never move it.
    seen: Mutex<Option<HashSet<String>>>,
}

impl std::fmt::Debug for BlueskyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlueskyClient")
            .field("service", &self.service)
            .field("timeline_limit", &self.timeline_limit)
            .finish_non_exhaustive()
    }
}

impl BlueskyClient {
    pub fn new(service: impl Into<String>, timeline_limit: u8) -> Self {
        let service = service.into().trim_end_matches('/').to_string();
        Self {
            agent: AtpAgent::new(ReqwestClient::new(&service), MemorySessionStore::default()),
            service,
            timeline_limit: timeline_limit.clamp(1, 100),
            seen: Mutex::new(None),
        }
    }

    /// One timeline page, newest first.
    async fn fetch_timeline(&self) -> Result<Vec<FeedItem>> {
        if self.agent.get_session().await.is_none() {
            return Err(CoreError::NotLoggedIn {
                service: self.service.clone(),
            });
        }

        let params = get_timeline::ParametersData {
            algorithm: Some(REVERSE_CHRONOLOGICAL.to_string()),
            cursor: None,
            limit: self.timeline_limit.try_into().ok(),
        };
        let output = self
            .agent
            .api
            .app
            .bsky
            .feed
            .get_timeline(params.into())
            .await
            .map_err(|e| CoreError::upstream_request(GET_TIMELINE, e))?;

        debug!(
            "fetched {} timeline entries (cursor: {:?})",
            output.data.feed.len(),
            output.data.cursor
        );
        Ok(output.data.feed.into_iter().map(FeedItem::from).collect())
    }
}

#[async_trait]
impl FeedSource for BlueskyClient {
    async fn login(&self, credentials: &Credentials) -> Result<Profile> {
        let session = self
            .agent
            .login(&credentials.handle, &credentials.app_password)
            .await
            .map_err(|e| CoreError::LoginFailed {
                handle: credentials.handle.clone(),
                cause: e.to_string(),
            })?;

        let profile = Profile {
            did: session.data.did.to_string(),
            handle: session.data.handle.to_string(),
        };
        info!("logged in to {} as {}", self.service, profile.handle);
        Ok(profile)
    }

    async fn fetch_snapshot(&self) -> Result<Vec<FeedItem>> {
        let items = self.fetch_timeline().await?;
        let mut seen = self.seen.lock();
        if seen.is_none() {
            *seen = Some(items.iter().map(FeedItem::key).collect());
        }
        drop(seen);
        Ok(items)
    }

    async fn fetch_new_since_last_sync(&self) -> Result<Vec<FeedItem>> {
        let items = self.fetch_timeline().await?;
        let mut fresh = unseen_entries(&mut self.seen.lock(), items);

        if fresh.len() >= usize::from(self.timeline_limit) {
            warn!(
                "all {} fetched entries are new; older unseen entries were skipped",
                fresh.len()
            );
        }
        fresh.reverse();
        Ok(fresh)
    }
}

/// Entries of `page` missing from `seen`, in page order, then remember
/// `page` as seen. The first page ever fetched only seeds the set.
fn unseen_entries(seen: &mut Option<HashSet<String>>, page: Vec<FeedItem>) -> Vec<FeedItem> {
    let keys: HashSet<String> = page.iter().map(FeedItem::key).collect();
    let fresh = match seen.as_ref() {
        Some(seen) => page
            .into_iter()
            .filter(|item| !seen.contains(&item.key()))
            .collect(),
        None => Vec::new(),
    };
    *seen = Some(keys);
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::author::Author;
    use crate::feed::Post;
    use chrono::Utc;

    fn item(n: u32) -> FeedItem {
        FeedItem::original(Post {
            cid: format!("cid{n}"),
            uri: format!("at://did:plc:a/app.bsky.feed.post/{n}"),
            author: Author::new("did:plc:a", "a.bsky.social", None),
            created_at: Utc::now(),
            text: format!("post {n}"),
            facets: Vec::new(),
            embed: None,
            reply: None,
        })
    }

    fn texts(items: &[FeedItem]) -> Vec<&str> {
        items.iter().map(|i| i.post.text.as_str()).collect()
    }

    #[test]
    fn test_limit_clamped() {
        assert_eq!(BlueskyClient::new("https://x", 0).timeline_limit, 1);
        assert_eq!(BlueskyClient::new("https://x", 200).timeline_limit, 100);
    }

    #[test]
    fn test_service_trailing_slash_trimmed() {
        let client = BlueskyClient::new("https://bsky.social/", 50);
        assert_eq!(client.service, "https://bsky.social");
    }

    #[tokio::test]
    async fn test_fetch_before_login() {
        let client = BlueskyClient::new("https://bsky.social", 50);
        let err = client.fetch_snapshot().await.unwrap_err();
        assert!(matches!(err, CoreError::NotLoggedIn { .. }));
        assert!(client.seen.lock().is_none());
    }

    #[test]
    fn test_first_page_only_seeds() {
        let mut seen = None;
        assert!(unseen_entries(&mut seen, vec![item(2), item(1)]).is_empty());
        assert_eq!(seen.as_ref().map(HashSet::len), Some(2));
    }

    #[test]
    fn test_unseen_entries_in_page_order() {
        let mut seen = None;
        unseen_entries(&mut seen, vec![item(2), item(1)]);
        let fresh = unseen_entries(&mut seen, vec![item(4), item(3), item(2), item(1)]);
        assert_eq!(texts(&fresh), vec!["post 4", "post 3"]);
        assert!(unseen_entries(&mut seen, vec![item(4), item(3), item(2)]).is_empty());
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = Credentials {
            handle: "me.bsky.social".into(),
            app_password: "hunter2".into(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("me.bsky.social"));
        assert!(!shown.contains("hunter2"));
    }
}
