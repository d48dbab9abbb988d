//! Listener, session registry and the periodic timeline sync.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atrelay_core::config::{BridgeConfig, SyncConfig};
use atrelay_core::{FeedStore, RenderedPost};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};
use crate::session::{Session, SessionEvent, SessionSettings};

/// Deliveries buffered per session before new posts are dropped for it.
pub const SESSION_QUEUE_LEN: usize = 256;

/// State shared by the accept loop, the sync loop and the shutdown path.
pub struct ServerContext {
    settings: Arc<SessionSettings>,
    store: Arc<FeedStore>,
    clients: DashMap<u64, mpsc::Sender<SessionEvent>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("settings", &self.settings)
            .field("clients", &self.clients.len())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ServerContext {
    pub fn new(settings: SessionSettings, store: Arc<FeedStore>) -> Self {
        Self {
            settings: Arc::new(settings),
            store,
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<FeedStore> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<SessionSettings> {
        &self.settings
    }

    /// Token that fires when shutdown starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Begin graceful shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn register(&self) -> (u64, mpsc::Receiver<SessionEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_LEN);
        self.clients.insert(id, tx);
        (id, rx)
    }

    fn unregister(&self, id: u64) {
        self.clients.remove(&id);
    }

    /// Queue a post for every connected session. Returns how many sessions
    /// accepted it.
    pub fn broadcast(&self, post: Arc<RenderedPost>) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for entry in self.clients.iter() {
            match entry.value().try_send(SessionEvent::Post(Arc::clone(&post))) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(session = *entry.key(), "delivery queue full, dropping post")
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }
        for id in closed {
            debug!(session = id, "unregistering closed session");
            self.clients.remove(&id);
        }
        delivered
    }
}

/// Bound IRC listener, ready to serve.
pub struct BridgeServer {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    sync: SyncConfig,
    grace: Duration,
}

impl BridgeServer {
    pub async fn bind(ctx: Arc<ServerContext>, config: &BridgeConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.irc.host, config.irc.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|cause| ServerError::Bind {
                addr: addr.clone(),
                cause,
            })?;

        Ok(Self {
            ctx,
            listener,
            sync: config.sync.clone(),
            grace: Duration::from_secs(config.shutdown.grace_secs),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Accept connections until shutdown, then stop the sync loop and close
    /// every session within the grace period.
    pub async fn serve(self) -> Result<()> {
        let BridgeServer {
            ctx,
            listener,
            sync,
            grace,
        } = self;
        let local = listener
            .local_addr()
            .map_err(|cause| ServerError::Bind {
                addr: "listener".to_string(),
                cause,
            })?;
        info!("IRC bridge running on {}", local);

        let shutdown = ctx.shutdown_token();
        let close_sessions = CancellationToken::new();
        let tracker = TaskTracker::new();
        let sync_task = tokio::spawn(sync_loop(ctx.clone(), sync, shutdown.clone()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        spawn_session(&ctx, &tracker, stream, peer, close_sessions.clone());
                    }
                    Err(cause) => {
                        warn!("{}", ServerError::Accept { local, cause });
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        drop(listener);
        info!("shutting down, {} connections open", ctx.client_count());
        tracker.close();

        let graceful = async {
            if let Err(e) = sync_task.await {
                warn!("sync task ended abnormally: {}", e);
            }
            close_sessions.cancel();
            tracker.wait().await;
        };

        match tokio::time::timeout(grace, graceful).await {
            Ok(()) => {
                info!("shutdown complete");
                Ok(())
            }
            Err(_) => Err(ServerError::ShutdownTimeout {
                grace_secs: grace.as_secs(),
            }),
        }
    }
}

fn spawn_session(
    ctx: &Arc<ServerContext>,
    tracker: &TaskTracker,
    stream: TcpStream,
    peer: SocketAddr,
    close: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, "set_nodelay failed: {}", e);
    }
    let (id, events) = ctx.register();
    let session = Session::new(peer, ctx.settings.clone(), ctx.store.clone());
    let ctx = ctx.clone();

    info!(%peer, session = id, "new connection");
    tracker.spawn(async move {
        if let Err(e) = session.run(stream, events, close).await {
            warn!(%peer, session = id, "session ended with error: {}", e);
        }
        ctx.unregister(id);
    });
}

/// Wait between sync attempts. Each consecutive failure doubles it, up to
/// a cap; a success drops it back to the base interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Backoff {
    interval: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(config: &SyncConfig) -> Self {
        let interval = Duration::from_secs(config.interval_secs.max(1));
        Self {
            interval,
            max: Duration::from_secs(config.max_backoff_secs).max(interval),
            current: interval,
        }
    }

    fn delay(&self) -> Duration {
        self.current
    }

    fn reset(&mut self) {
        self.current = self.interval;
    }

    fn fail(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.max);
        self.current
    }
}

/// Poll for new posts and fan them out, backing off while the upstream
/// keeps failing.
async fn sync_loop(ctx: Arc<ServerContext>, config: SyncConfig, shutdown: CancellationToken) {
    let mut backoff = Backoff::new(&config);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(backoff.delay()) => {}
        }

        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = ctx.store.sync() => result,
        };

        match result {
            Ok(fresh) => {
                backoff.reset();
                if fresh.is_empty() {
                    continue;
                }
                let mut sent = 0;
                for item in &fresh {
                    let post = RenderedPost::from_item(item);
                    if post.is_empty() {
                        continue;
                    }
                    ctx.broadcast(Arc::new(post));
                    sent += 1;
                }
                info!(
                    "synced {} new entries, {} shown to {} clients",
                    fresh.len(),
                    sent,
                    ctx.client_count()
                );
            }
            Err(e) => {
                let delay = backoff.fail();
                warn!("timeline sync failed: {}, retrying in {}s", e, delay.as_secs());
            }
        }
    }

    info!("sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrelay_core::{Author, FeedItem, InMemoryFeedSource, Post};
    use chrono::Utc;

    fn context() -> Arc<ServerContext> {
        context_with(Arc::new(InMemoryFeedSource::new(Vec::new())))
    }

    fn context_with(source: Arc<InMemoryFeedSource>) -> Arc<ServerContext> {
        let store = Arc::new(FeedStore::new(source, 10));
        let settings = SessionSettings::from_config(&BridgeConfig::default(), "me.bsky.social");
        Arc::new(ServerContext::new(settings, store))
    }

    fn item(n: u32) -> FeedItem {
        let author = Author::new("did:plc:x", "x.bsky.social", None);
        FeedItem::original(Post {
            cid: format!("c{n}"),
            uri: format!("at://did:plc:x/app.bsky.feed.post/{n}"),
            author,
            created_at: Utc::now(),
            text: format!("hi {n}"),
            facets: Vec::new(),
            embed: None,
            reply: None,
        })
    }

    fn rendered() -> Arc<RenderedPost> {
        Arc::new(RenderedPost::from_item(&item(1)))
    }

    fn sync_config(interval_secs: u64, max_backoff_secs: u64) -> SyncConfig {
        SyncConfig {
            interval_secs,
            max_backoff_secs,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(&sync_config(5, 30));
        assert_eq!(backoff.delay(), Duration::from_secs(5));
        assert_eq!(backoff.fail(), Duration::from_secs(10));
        assert_eq!(backoff.fail(), Duration::from_secs(20));
        assert_eq!(backoff.fail(), Duration::from_secs(30));
        assert_eq!(backoff.fail(), Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_cap_never_below_interval() {
        let mut backoff = Backoff::new(&sync_config(0, 0));
        assert_eq!(backoff.delay(), Duration::from_secs(1));
        assert_eq!(backoff.fail(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_registered_sessions() {
        let ctx = context();
        let (_a, mut rx_a) = ctx.register();
        let (_b, mut rx_b) = ctx.register();

        assert_eq!(ctx.broadcast(rendered()), 2);
        assert!(matches!(rx_a.recv().await, Some(SessionEvent::Post(_))));
        assert!(matches!(rx_b.recv().await, Some(SessionEvent::Post(_))));
    }

    #[tokio::test]
    async fn test_broadcast_drops_closed_sessions() {
        let ctx = context();
        let (_a, rx_a) = ctx.register();
        let (_b, _rx_b) = ctx.register();
        drop(rx_a);

        assert_eq!(ctx.broadcast(rendered()), 1);
        assert_eq!(ctx.client_count(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_post_but_keeps_session() {
        let ctx = context();
        let (_a, _rx_a) = ctx.register();
        for _ in 0..SESSION_QUEUE_LEN {
            ctx.broadcast(rendered());
        }
        assert_eq!(ctx.broadcast(rendered()), 0);
        assert_eq!(ctx.client_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_loop_recovers_after_failure() {
        let source = Arc::new(InMemoryFeedSource::new(Vec::new()));
        let ctx = context_with(source.clone());
        let (_id, mut rx) = ctx.register();

        source.fail_next_fetch();
        source.push(item(7));

        let started = tokio::time::Instant::now();
        let handle = tokio::spawn(sync_loop(
            ctx.clone(),
            sync_config(1, 60),
            ctx.shutdown_token(),
        ));

        // first attempt after 1s fails, the retry waits 2s more
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap();
        let Some(SessionEvent::Post(post)) = event else {
            panic!("expected a post, got {event:?}");
        };
        assert_eq!(post.lines, vec!["hi 7".to_string()]);
        assert!(started.elapsed() >= Duration::from_secs(3));

        // still polling after the recovery
        source.push(item(8));
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(SessionEvent::Post(_))));

        ctx.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_loop_stops_on_shutdown() {
        let ctx = context();
        let token = ctx.shutdown_token();
        let handle = tokio::spawn(sync_loop(ctx.clone(), SyncConfig::default(), token));
        ctx.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
