//! One IRC client connection.
//!
//! A [`Session`] owns the protocol state for its client (registration,
//! negotiated capabilities) and the identity maps that decide which authors
//! this client has already seen join the channel. Protocol handling only
//! queues lines in an outbox; [`Session::run`] drives the socket.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use atrelay_core::config::BridgeConfig;
use atrelay_core::render::{render, NO_TEXT};
use atrelay_core::{Author, FeedItem, FeedStore, RenderedPost};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::IrcLineCodec;
use crate::commands::{BangCommand, HELP};
use crate::message::{format_tags, numeric, split_text, time_tag, Message, MAX_TEXT_BYTES};

const NAMES_PER_LINE: usize = 20;
const SUMMARY_CHARS: usize = 80;
const MESSAGE_TAGS: &str = "message-tags";

/// Presentation settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub server_name: String,
    pub channel: String,
    pub topic: String,
    /// Handle of the bridged account, used as the host of the client's own JOIN
    pub account_handle: String,
    pub page_size: usize,
}

impl SessionSettings {
    pub fn from_config(config: &BridgeConfig, account_handle: impl Into<String>) -> Self {
        Self {
            server_name: config.irc.server_name.clone(),
            channel: config.irc.channel.clone(),
            topic: config.irc.topic.clone(),
            account_handle: account_handle.into(),
            page_size: config.sync.page_size,
        }
    }
}

/// Pushed to a session from the server.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A post found by the periodic sync, rendered once for everyone
    Post(Arc<RenderedPost>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Session {
    peer: SocketAddr,
    settings: Arc<SessionSettings>,
    store: Arc<FeedStore>,
    /// Fires when the connection is being torn down
    close: CancellationToken,

    nick: Option<String>,
    got_user: bool,
    registered: bool,
    joined: bool,
    cap_negotiating: bool,
    message_tags: bool,

    authors_by_nick: HashMap<String, Author>,
    nick_by_handle: HashMap<String, String>,
    joined_nicks: HashSet<String>,
    /// Announcement order of `joined_nicks`
    join_order: Vec<String>,
    /// Entries already shown by the history replay
    replayed: HashSet<String>,

    outbox: Vec<String>,
}

impl Session {
    pub fn new(peer: SocketAddr, settings: Arc<SessionSettings>, store: Arc<FeedStore>) -> Self {
        Self {
            peer,
            settings,
            store,
            close: CancellationToken::new(),
            nick: None,
            got_user: false,
            registered: false,
            joined: false,
            cap_negotiating: false,
            message_tags: false,
            authors_by_nick: HashMap::new(),
            nick_by_handle: HashMap::new(),
            joined_nicks: HashSet::new(),
            join_order: Vec::new(),
            replayed: HashSet::new(),
            outbox: Vec::new(),
        }
    }

    pub fn nick(&self) -> Option<&str> {
        self.nick.as_deref()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Nick the client knows a handle by, once that author has joined.
    pub fn nick_for_handle(&self, handle: &str) -> Option<&str> {
        self.nick_by_handle.get(handle).map(String::as_str)
    }

    /// Lines queued for the client since the last call.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outbox)
    }

    pub fn greet(&mut self) {
        let channel = self.settings.channel.clone();
        self.send(format!(
            "NOTICE * :Welcome to the Bluesky IRC Bridge, JOIN {channel}"
        ));
    }

    /// Drive the connection until the client quits, the socket closes, or
    /// `shutdown` fires.
    pub async fn run<S>(
        mut self,
        stream: S,
        mut events: mpsc::Receiver<SessionEvent>,
        shutdown: CancellationToken,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.close = shutdown.clone();
        let mut framed = Framed::new(stream, IrcLineCodec::new());
        self.greet();
        self.flush(&mut framed).await?;

        loop {
            let flow = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.send("ERROR :Server shutting down".to_string());
                    Flow::Quit
                }
                frame = framed.next() => match frame {
                    Some(Ok(line)) => {
                        debug!(peer = %self.peer, "<- {}", line);
                        self.handle_line(&line).await
                    }
                    Some(Err(e)) => {
                        warn!(peer = %self.peer, "connection lost: {}", e);
                        Flow::Quit
                    }
                    None => Flow::Quit,
                },
                Some(event) = events.recv() => {
                    match event {
                        SessionEvent::Post(post) => self.deliver(&post),
                    }
                    Flow::Continue
                }
            };

            if let Err(e) = self.flush(&mut framed).await {
                warn!(peer = %self.peer, "write failed: {}", e);
                break;
            }
            if flow == Flow::Quit {
                break;
            }
        }

        info!(peer = %self.peer, "connection closed");
        let _ = framed.close().await;
        Ok(())
    }

    async fn flush<S>(&mut self, framed: &mut Framed<S, IrcLineCodec>) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.outbox.is_empty() {
            return Ok(());
        }
        for line in self.outbox.drain(..) {
            debug!(peer = %self.peer, "-> {}", line);
            framed.feed(line).await?;
        }
        framed.flush().await
    }

    /// Handle one client line. Malformed and unsupported lines are ignored.
    pub async fn handle_line(&mut self, line: &str) -> Flow {
        let Some(msg) = Message::parse(line) else {
            return Flow::Continue;
        };

        match msg.command.as_str() {
            "CAP" => self.handle_cap(&msg),
            "PING" => match msg.param(0) {
                Some(token) if !token.contains(' ') => self.send(format!("PONG {token}")),
                Some(token) => self.send(format!("PONG :{token}")),
                None => self.send("PONG :".to_string()),
            },
            "NICK" => {
                if let Some(nick) = msg.param(0).filter(|n| !n.is_empty()) {
                    self.set_nick(nick.to_string());
                }
            }
            "USER" => {
                self.got_user = true;
                if self.nick.is_some() {
                    self.finish_registration();
                }
            }
            "JOIN" => {
                if self.registered && !self.joined && msg.param(0) == Some(self.channel()) {
                    self.join_channel();
                }
            }
            "PRIVMSG" => {
                if self.joined && msg.param(0) == Some(self.channel()) {
                    if let Some(text) = msg.param(1) {
                        self.handle_channel_text(text).await;
                    }
                }
            }
            "QUIT" => {
                self.send("ERROR :Closing link".to_string());
                return Flow::Quit;
            }
            "WHO" => {
                if let Some(target) = msg.param(0) {
                    self.handle_who(target);
                }
            }
            "WHOIS" => {
                if let Some(target) = msg.params.last() {
                    let target = target.clone();
                    self.handle_whois(&target);
                }
            }
            "NAMES" => {
                if let Some(target) = msg.param(0) {
                    if target == self.channel() {
                        self.send_names();
                    }
                }
            }
            "MODE" => {
                if let Some(target) = msg.param(0) {
                    let target = target.to_string();
                    self.handle_mode(&target);
                }
            }
            other => debug!(peer = %self.peer, "ignoring {}", other),
        }
        Flow::Continue
    }

    /// Deliver a post found by the periodic sync.
    pub fn deliver(&mut self, post: &RenderedPost) {
        if !self.joined {
            return;
        }
        if self.replayed.remove(&post.key) {
            return;
        }
        self.write_post(post);
    }

    fn channel(&self) -> &str {
        &self.settings.channel
    }

    fn own_nick(&self) -> &str {
        self.nick.as_deref().unwrap_or("*")
    }

    fn send(&mut self, line: String) {
        self.outbox.push(line);
    }

    fn send_numeric(&mut self, code: &str, rest: &str) {
        let line = format!(
            ":{} {} {} {}",
            self.settings.server_name,
            code,
            self.own_nick(),
            rest
        );
        self.send(line);
    }

    /// Say something in the channel as the client itself.
    fn send_channel(&mut self, text: &str) {
        let Some(nick) = self.nick.clone() else {
            return;
        };
        let channel = self.settings.channel.clone();
        for piece in split_text(text, MAX_TEXT_BYTES) {
            self.send(format!(":{nick}!~self@local PRIVMSG {channel} :{piece}"));
        }
    }

    fn set_nick(&mut self, nick: String) {
        let old = self.nick.replace(nick.clone());
        info!(peer = %self.peer, "nick change: {:?} -> {}", old, nick);

        if self.registered {
            if let Some(old) = old.filter(|old| *old != nick) {
                self.send(format!(":{old}!~self@local NICK :{nick}"));
            }
        } else if self.got_user {
            self.finish_registration();
        }
    }

    /// Welcome the client, join the channel and replay history. Runs once.
    fn finish_registration(&mut self) {
        if self.registered {
            return;
        }
        self.registered = true;

        let nick = self.own_nick().to_string();
        let server = self.settings.server_name.clone();
        self.send_numeric(
            numeric::RPL_WELCOME,
            &format!(":Welcome to the Bluesky IRC Bridge, {nick}"),
        );
        self.send_numeric(numeric::RPL_YOURHOST, ":Running ATRelay IRC Bridge");
        self.send_numeric(numeric::RPL_CREATED, ":This server was created just now");
        self.send_numeric(numeric::RPL_MYINFO, &format!("{server} 1.0 o o"));

        info!(peer = %self.peer, "{} registered, joining {}", nick, self.channel());
        self.join_channel();
    }

    fn join_channel(&mut self) {
        self.joined = true;
        let nick = self.own_nick().to_string();
        let channel = self.settings.channel.clone();
        let host = self.settings.account_handle.clone();
        let topic = self.settings.topic.clone();

        self.send(format!(":{nick}!~@{host} JOIN {channel}"));
        self.send_numeric(numeric::RPL_TOPIC, &format!("{channel} :{topic}"));
        self.send_names();
        self.replay_history();
    }

    fn replay_history(&mut self) {
        let history = self.store.snapshot().history();
        if history.is_empty() {
            self.send_channel("No posts.");
            return;
        }
        for item in history {
            let post = RenderedPost::from_item(&item);
            self.replayed.insert(post.key.clone());
            self.write_post(&post);
        }
    }

    /// Send a post's lines as its author, announcing the author first if
    /// this client hasn't seen them yet.
    fn write_post(&mut self, post: &RenderedPost) {
        if post.is_empty() {
            return;
        }
        self.ensure_author_joined(&post.author);

        let prefix = format!(
            ":{}!~@{} PRIVMSG {} :",
            post.author.nick, post.author.handle, self.settings.channel
        );
        let tags = self
            .message_tags
            .then(|| format!("@{} ", format_tags(&[("time", time_tag(post.at))])));

        for line in &post.lines {
            for piece in split_text(line, MAX_TEXT_BYTES) {
                let mut out = String::with_capacity(prefix.len() + piece.len() + 40);
                if let Some(tags) = &tags {
                    out.push_str(tags);
                }
                out.push_str(&prefix);
                out.push_str(piece);
                self.outbox.push(out);
            }
        }
    }

    fn ensure_author_joined(&mut self, author: &Author) {
        if self.joined_nicks.contains(&author.nick) {
            // first author to claim a nick keeps it
            self.nick_by_handle
                .entry(author.handle.clone())
                .or_insert_with(|| author.nick.clone());
            return;
        }

        let channel = self.settings.channel.clone();
        self.send(format!(
            ":{}!~@{} JOIN {}",
            author.nick, author.handle, channel
        ));
        self.joined_nicks.insert(author.nick.clone());
        self.join_order.push(author.nick.clone());
        self.authors_by_nick
            .insert(author.nick.clone(), author.clone());
        self.nick_by_handle
            .insert(author.handle.clone(), author.nick.clone());
    }

    fn handle_cap(&mut self, msg: &Message) {
        let sub = msg.param(0).map(str::to_ascii_uppercase);
        match sub.as_deref() {
            Some("LS") => {
                self.cap_negotiating = true;
                self.send(format!("CAP * LS :{MESSAGE_TAGS}"));
            }
            Some("REQ") => {
                let Some(requested) = msg.param(1) else {
                    return;
                };
                let caps: Vec<&str> = requested.split_whitespace().collect();
                let supported = !caps.is_empty()
                    && caps.iter().all(|c| c.eq_ignore_ascii_case(MESSAGE_TAGS));
                if supported {
                    self.message_tags = true;
                    self.send(format!("CAP * ACK :{MESSAGE_TAGS}"));
                } else {
                    self.send(format!("CAP * NAK :{requested}"));
                }
            }
            Some("LIST") => {
                let enabled = if self.message_tags { MESSAGE_TAGS } else { "" };
                self.send(format!("CAP * LIST :{enabled}"));
            }
            Some("END") => {
                if self.cap_negotiating {
                    debug!(peer = %self.peer, "capability negotiation finished");
                }
                self.cap_negotiating = false;
            }
            _ => {}
        }
    }

    fn handle_who(&mut self, target: &str) {
        if target != self.channel() {
            return;
        }
        let channel = self.settings.channel.clone();
        let server = self.settings.server_name.clone();
        let rows: Vec<String> = self
            .join_order
            .iter()
            .filter_map(|nick| self.authors_by_nick.get(nick))
            .map(|author| {
                format!(
                    "{channel} ~ {} {server} {} H :0 {}",
                    author.handle,
                    author.nick,
                    author.real_name()
                )
            })
            .collect();
        for row in rows {
            self.send_numeric(numeric::RPL_WHOREPLY, &row);
        }
        self.send_numeric(numeric::RPL_ENDOFWHO, &format!("{channel} :End of WHO list"));
    }

    fn handle_whois(&mut self, nick: &str) {
        let Some(author) = self.authors_by_nick.get(nick).cloned() else {
            self.send_numeric(numeric::ERR_NOSUCHNICK, &format!("{nick} :No such nick"));
            return;
        };

        let channel = self.settings.channel.clone();
        self.send_numeric(
            numeric::RPL_WHOISUSER,
            &format!("{nick} ~ {} * :{}", author.handle, author.real_name()),
        );
        self.send_numeric(numeric::RPL_WHOISCHANNELS, &format!("{nick} :{channel}"));
        self.send_numeric(
            numeric::RPL_WHOISSPECIAL,
            &format!("{nick} :Bluesky ID: {}", author.did),
        );
        self.send_numeric(
            numeric::RPL_WHOISSPECIAL,
            &format!("{nick} :Handle: @{}", author.handle),
        );
        if let Some(display_name) = &author.display_name {
            self.send_numeric(
                numeric::RPL_WHOISSPECIAL,
                &format!("{nick} :Display Name: {display_name}"),
            );
        }
        self.send_numeric(numeric::RPL_ENDOFWHOIS, &format!("{nick} :End of WHOIS list"));
    }

    fn send_names(&mut self) {
        let channel = self.settings.channel.clone();
        let mut names: Vec<String> = Vec::with_capacity(self.join_order.len() + 1);
        if let Some(nick) = &self.nick {
            names.push(nick.clone());
        }
        names.extend(self.join_order.iter().cloned());

        for chunk in names.chunks(NAMES_PER_LINE) {
            self.send_numeric(
                numeric::RPL_NAMREPLY,
                &format!("= {channel} :{}", chunk.join(" ")),
            );
        }
        self.send_numeric(
            numeric::RPL_ENDOFNAMES,
            &format!("{channel} :End of NAMES list"),
        );
    }

    fn handle_mode(&mut self, target: &str) {
        if target == self.channel() {
            let rest = format!("{target} +nt");
            self.send_numeric(numeric::RPL_CHANNELMODEIS, &rest);
        } else if Some(target) == self.nick.as_deref() {
            self.send_numeric(numeric::RPL_UMODEIS, "+");
        }
    }

    async fn handle_channel_text(&mut self, text: &str) {
        let Some(command) = BangCommand::parse(text) else {
            return;
        };
        debug!(peer = %self.peer, "command {:?}", command);

        match command {
            BangCommand::Echo(text) => self.send_channel(&text),
            BangCommand::Page(page) => self.send_page(page),
            BangCommand::Post(n) => self.send_post_detail(n),
            BangCommand::Refresh => {
                let result = tokio::select! {
                    biased;
                    _ = self.close.cancelled() => {
                        debug!(peer = %self.peer, "refresh abandoned, connection closing");
                        return;
                    }
                    result = self.store.refresh() => result,
                };
                match result {
                    Ok(count) => self.send_channel(&format!("Refreshed timeline: {count} posts.")),
                    Err(e) => warn!(peer = %self.peer, "refresh failed: {}", e),
                }
            }
            BangCommand::Help => self.send_channel(HELP),
        }
    }

    fn send_page(&mut self, page: usize) {
        let entries = self.store.snapshot().page(page, self.settings.page_size);
        if entries.is_empty() {
            self.send_channel(&format!("No posts on page {page}."));
            return;
        }
        for (n, item) in entries {
            self.send_channel(&format!("#{n} {}", summarize(&item)));
        }
    }

    fn send_post_detail(&mut self, n: usize) {
        let Some(item) = self.store.snapshot().find(n) else {
            self.send_channel(&format!("No post found for #{n}"));
            return;
        };

        self.send_channel(&format!(
            "#{n} @{} at {}",
            item.post.author.handle,
            item.post.created_at.format("%Y-%m-%d %H:%M UTC")
        ));
        let lines = render(&item);
        if lines.is_empty() {
            self.send_channel("(reply, not shown)");
        }
        for line in lines {
            self.send_channel(&line);
        }
    }
}

/// One-line listing entry: who posted and the start of the text.
fn summarize(item: &FeedItem) -> String {
    let first = item
        .post
        .text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(NO_TEXT);
    let mut summary: String = first.chars().take(SUMMARY_CHARS).collect();
    if first.chars().count() > SUMMARY_CHARS {
        summary.push('…');
    }

    match &item.reason {
        Some(reason) => format!(
            "@{} (↻ @{}): {summary}",
            item.post.author.handle, reason.by.handle
        ),
        None => format!("@{}: {summary}", item.post.author.handle),
    }
}
