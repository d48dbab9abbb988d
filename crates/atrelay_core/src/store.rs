//! Shared, periodically refreshed timeline.
//!
//! The store hands out immutable [`FeedSnapshot`]s. Refresh and sync build a
//! new snapshot and swap it in under a short write lock, so readers always
//! see either the previous or the next complete snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::Result;
use crate::feed::FeedItem;
use crate::upstream::FeedSource;

/// Identity of the post at a display position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRef {
    pub cid: String,
    pub uri: String,
}

/// Timeline as of the last full refresh, with its 1-based position index.
#[derive(Debug, Default)]
pub struct NumberedFeed {
    items: Vec<Arc<FeedItem>>,
    index: HashMap<usize, PostRef>,
}

impl NumberedFeed {
    fn new(items: Vec<FeedItem>) -> Self {
        let items: Vec<Arc<FeedItem>> = items.into_iter().map(Arc::new).collect();
        let index = items
            .iter()
            .enumerate()
            .map(|(offset, item)| {
                (
                    offset + 1,
                    PostRef {
                        cid: item.post.cid.clone(),
                        uri: item.post.uri.clone(),
                    },
                )
            })
            .collect();
        Self { items, index }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn position(&self, n: usize) -> Option<&PostRef> {
        self.index.get(&n)
    }
}

#[derive(Debug, Default)]
pub struct FeedSnapshot {
    numbered: Arc<NumberedFeed>,
    /// Entries delivered by incremental sync since the last refresh, oldest first
    appended: Vec<Arc<FeedItem>>,
}

impl FeedSnapshot {
    pub fn numbered(&self) -> &NumberedFeed {
        &self.numbered
    }

    pub fn appended(&self) -> &[Arc<FeedItem>] {
        &self.appended
    }

    pub fn is_empty(&self) -> bool {
        self.numbered.is_empty() && self.appended.is_empty()
    }

    /// Entry at display position `n` (1-based, feed order).
    pub fn find(&self, n: usize) -> Option<Arc<FeedItem>> {
        let post_ref = self.numbered.position(n)?;
        self.numbered
            .items
            .get(n - 1)
            .filter(|item| item.post.cid == post_ref.cid && item.post.uri == post_ref.uri)
            .cloned()
    }

    /// 1-based page of numbered entries.
    pub fn page(&self, page: usize, page_size: usize) -> Vec<(usize, Arc<FeedItem>)> {
        if page == 0 || page_size == 0 {
            return Vec::new();
        }
        let start = (page - 1).saturating_mul(page_size);
        self.numbered
            .items
            .iter()
            .enumerate()
            .skip(start)
            .take(page_size)
            .map(|(offset, item)| (offset + 1, Arc::clone(item)))
            .collect()
    }

    /// Everything a newly joined client should be shown, oldest first. An
    /// entry both synced and picked up by a later refresh appears once.
    pub fn history(&self) -> Vec<Arc<FeedItem>> {
        let numbered: HashSet<String> = self.numbered.items.iter().map(|i| i.key()).collect();
        let mut items: Vec<Arc<FeedItem>> = self
            .numbered
            .items
            .iter()
            .chain(
                self.appended
                    .iter()
                    .filter(|item| !numbered.contains(&item.key())),
            )
            .cloned()
            .collect();
        items.sort_by_key(|item| item.timestamp());
        items
    }
}

pub struct FeedStore {
    source: Arc<dyn FeedSource>,
    snapshot: RwLock<Arc<FeedSnapshot>>,
    retained_appended: usize,
}

impl std::fmt::Debug for FeedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("FeedStore")
            .field("source", &self.source)
            .field("numbered", &snapshot.numbered.len())
            .field("appended", &snapshot.appended.len())
            .finish()
    }
}

impl FeedStore {
    pub fn new(source: Arc<dyn FeedSource>, retained_appended: usize) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(FeedSnapshot::default())),
            retained_appended,
        }
    }

    /// Current snapshot. Cheap; hold on to it for a consistent view.
    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Replace the whole timeline and rebuild the position index.
    /// Returns the number of entries now numbered.
    pub async fn refresh(&self) -> Result<usize> {
        let items = self.source.fetch_snapshot().await?;
        let numbered = Arc::new(NumberedFeed::new(items));
        let count = numbered.len();

        *self.snapshot.write() = Arc::new(FeedSnapshot {
            numbered,
            appended: Vec::new(),
        });
        info!("timeline refreshed: {} entries", count);
        Ok(count)
    }

    /// Fetch entries that appeared since the last sync, oldest first. The
    /// position index is left as it is.
    pub async fn sync(&self) -> Result<Vec<Arc<FeedItem>>> {
        let fresh: Vec<Arc<FeedItem>> = self
            .source
            .fetch_new_since_last_sync()
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();
        if fresh.is_empty() {
            return Ok(fresh);
        }

        let mut guard = self.snapshot.write();
        let mut appended = guard.appended.clone();
        appended.extend(fresh.iter().cloned());
        if appended.len() > self.retained_appended {
            let excess = appended.len() - self.retained_appended;
            appended.drain(..excess);
        }
        *guard = Arc::new(FeedSnapshot {
            numbered: Arc::clone(&guard.numbered),
            appended,
        });
        drop(guard);

        debug!("sync found {} new entries", fresh.len());
        Ok(fresh)
    }
}
