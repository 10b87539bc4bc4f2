// toybox-core/src/tasks/chat_poller.rs
//
// Background task that finds the live stream, scrapes the chat session out
// of the popout page and keeps polling for new chat actions.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::chat::ChatIngest;
use crate::commands::Dispatcher;
use crate::Error;

static VIDEO_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("video id pattern is valid"));
static CANONICAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<link rel="canonical" href="https://www\.youtube\.com/watch\?v=([A-Za-z0-9_-]{11})""#)
        .expect("canonical pattern is valid")
});
static API_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""INNERTUBE_API_KEY":"([^"]+)""#).expect("api key pattern is valid"));
static CLIENT_VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""INNERTUBE_CLIENT_VERSION":"([^"]+)""#).expect("client version pattern is valid")
});
static CONTINUATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""continuation":"([^"]+)""#).expect("continuation pattern is valid"));
static INITIAL_DATA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)(?:window\["ytInitialData"\]|ytInitialData)\s*=\s*(\{.*?\});\s*</script>"#)
        .expect("initial data pattern is valid")
});

const DEFAULT_BASE_URL: &str = "https://www.youtube.com";
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Video id, watch/short/live URL, channel URL or `@handle`.
    pub target: String,
    pub base_url: String,
    /// Wait between polls when the server does not suggest one.
    pub poll_interval: Duration,
    /// Wait between attempts to find a live stream.
    pub discovery_retry: Duration,
    /// Wait after a failed request.
    pub error_backoff: Duration,
}

impl PollerConfig {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: Duration::from_secs(2),
            discovery_retry: Duration::from_secs(10),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// What the user pointed us at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    Video(String),
    /// Path of a channel page, e.g. `/@someone` or `/channel/UC...`.
    Channel(String),
}

pub fn parse_target(raw: &str) -> Option<StreamTarget> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if VIDEO_ID_RE.is_match(raw) {
        return Some(StreamTarget::Video(raw.to_string()));
    }
    if raw.starts_with('@') {
        return Some(StreamTarget::Channel(format!("/{raw}")));
    }

    let with_scheme = if raw.contains("://") { raw.to_string() } else { format!("https://{raw}") };
    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str().unwrap_or_default();

    if host.ends_with("youtu.be") {
        let id = url.path().trim_start_matches('/');
        return VIDEO_ID_RE.is_match(id).then(|| StreamTarget::Video(id.to_string()));
    }
    if let Some((_, v)) = url.query_pairs().find(|(k, _)| k == "v") {
        return VIDEO_ID_RE.is_match(&v).then(|| StreamTarget::Video(v.to_string()));
    }
    let segments: Vec<&str> = url.path_segments().map(|s| s.filter(|p| !p.is_empty()).collect()).unwrap_or_default();
    match segments.as_slice() {
        ["live", id] if VIDEO_ID_RE.is_match(id) => Some(StreamTarget::Video(id.to_string())),
        [handle, ..] if handle.starts_with('@') => Some(StreamTarget::Channel(format!("/{handle}"))),
        ["channel", id, ..] | ["c", id, ..] | ["user", id, ..] => {
            Some(StreamTarget::Channel(format!("/{}/{}", segments[0], id)))
        }
        _ => None,
    }
}

/// Video id of the live stream a channel's `/live` page redirects to.
pub fn extract_live_video_id(html: &str) -> Option<String> {
    CANONICAL_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub api_key: String,
    pub client_version: String,
    pub continuation: String,
}

pub fn extract_chat_session(html: &str) -> Option<ChatSession> {
    let grab = |re: &Regex| re.captures(html).and_then(|c| c.get(1)).map(|m| m.as_str().to_string());
    Some(ChatSession {
        api_key: grab(&API_KEY_RE)?,
        client_version: grab(&CLIENT_VERSION_RE).unwrap_or_else(|| "2.20240101.00.00".to_string()),
        continuation: grab(&CONTINUATION_RE)?,
    })
}

pub fn extract_initial_data(html: &str) -> Option<Value> {
    let raw = INITIAL_DATA_RE.captures(html)?.get(1)?.as_str();
    serde_json::from_str(raw).ok()
}

/// Next continuation token and the suggested wait before using it.
pub fn next_continuation(payload: &Value) -> Option<(String, Option<Duration>)> {
    let cont = payload.pointer("/continuationContents/liveChatContinuation/continuations/0")?;
    ["invalidationContinuationData", "timedContinuationData", "reloadContinuationData"]
        .iter()
        .find_map(|kind| cont.get(*kind))
        .and_then(|data| {
            let token = data.get("continuation")?.as_str()?.to_string();
            let wait = data.get("timeoutMs").and_then(Value::as_u64).map(Duration::from_millis);
            Some((token, wait))
        })
}

struct ChatPoller {
    client: reqwest::Client,
    config: PollerConfig,
    ingest: ChatIngest,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Starts polling `config.target` and dispatching its chat until
/// `shutdown_rx` flips to true.
pub fn spawn_chat_poller(
    config: PollerConfig,
    ingest: ChatIngest,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, Error> {
    let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
    let mut poller = ChatPoller { client, config, ingest, dispatcher, shutdown_rx };
    Ok(tokio::spawn(async move {
        poller.run().await;
        info!("Chat poller stopped");
    }))
}

impl ChatPoller {
    fn stopped(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Sleeps for `dur`; returns false if shutdown was requested meanwhile.
    async fn pause(&mut self, dur: Duration) -> bool {
        tokio::select! {
            _ = sleep(dur) => !self.stopped(),
            changed = self.shutdown_rx.changed() => changed.is_ok() && !*self.shutdown_rx.borrow(),
        }
    }

    async fn run(&mut self) {
        let Some(target) = parse_target(&self.config.target) else {
            error!("Chat poller: cannot make sense of target '{}'", self.config.target);
            return;
        };

        while !self.stopped() {
            let Some(video_id) = self.discover(&target).await else {
                return;
            };
            info!("Chat poller: following live chat of {}", video_id);
            self.ingest.set_default_stream_id(Some(video_id.clone()));

            match self.open_session(&video_id).await {
                Ok(session) => self.poll(session).await,
                Err(e) => {
                    warn!("Chat poller: could not open chat for {} => {}", video_id, e);
                    if !self.pause(self.config.error_backoff).await {
                        return;
                    }
                }
            }
            // A channel target looks for the next stream once this one ends.
            if matches!(target, StreamTarget::Video(_)) {
                return;
            }
        }
    }

    /// Resolves the target to a video id, retrying until one is live.
    async fn discover(&mut self, target: &StreamTarget) -> Option<String> {
        let path = match target {
            StreamTarget::Video(id) => return Some(id.clone()),
            StreamTarget::Channel(path) => path.clone(),
        };
        let url = format!("{}{}/live", self.config.base_url, path);
        loop {
            if self.stopped() {
                return None;
            }
            match self.fetch_text(&url).await {
                Ok(html) => {
                    if let Some(id) = extract_live_video_id(&html) {
                        return Some(id);
                    }
                    debug!("Chat poller: {} is not live yet", path);
                }
                Err(e) => warn!("Chat poller: live lookup for {} failed => {}", path, e),
            }
            if !self.pause(self.config.discovery_retry).await {
                return None;
            }
        }
    }

    async fn open_session(&mut self, video_id: &str) -> Result<ChatSession, Error> {
        let url = format!("{}/live_chat?is_popout=1&v={}", self.config.base_url, video_id);
        let html = self.fetch_text(&url).await?;
        let session = extract_chat_session(&html)
            .ok_or_else(|| Error::Platform(format!("no chat session on the page for {video_id}")))?;
        // Backlog shown on open is only remembered, never dispatched.
        if let Some(initial) = extract_initial_data(&html) {
            let backlog = self.ingest.handle_raw_payload(&initial);
            debug!("Chat poller: skipped {} backlog message(s)", backlog.len());
        }
        Ok(session)
    }

    async fn poll(&mut self, mut session: ChatSession) {
        let url = format!(
            "{}/youtubei/v1/live_chat/get_live_chat?key={}",
            self.config.base_url, session.api_key
        );
        loop {
            if self.stopped() {
                return;
            }
            let body = json!({
                "context": { "client": { "clientName": "WEB", "clientVersion": session.client_version } },
                "continuation": session.continuation,
            });
            let payload = match self.fetch_json(&url, &body).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("Chat poller: poll failed => {}", e);
                    if !self.pause(self.config.error_backoff).await {
                        return;
                    }
                    continue;
                }
            };

            let messages = self.ingest.handle_raw_payload(&payload);
            if !messages.is_empty() {
                self.dispatcher.on_chat_batch(&messages).await;
            }

            let Some((next, wait)) = next_continuation(&payload) else {
                info!("Chat poller: chat ended");
                return;
            };
            session.continuation = next;
            let wait = wait.unwrap_or(self.config.poll_interval);
            if !self.pause(wait).await {
                return;
            }
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String, Error> {
        let resp = self
            .client
            .get(url)
            .header("Accept-Language", "en-US,en;q=0.9")
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.text().await?)
    }

    async fn fetch_json(&self, url: &str, body: &Value) -> Result<Value, Error> {
        let resp = self.client.post(url).json(body).send().await?.error_for_status()?;
        Ok(resp.json::<Value>().await?)
    }
}
