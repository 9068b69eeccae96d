//! Passive network interception over CDP.
//!
//! While the browser paginates a listing, every JSON response that yields an
//! item array through the structural scan is recorded here, together with
//! enough of the originating request (URL, method, body, headers) to replay
//! it later without the browser. The tap never mutates page behavior; it
//! only observes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
    GetRequestPostDataParams, GetResponseBodyParams, RequestId, ResourceType,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::infer::{self, PaginationHints};

/// A replayable request whose response produced listing items.
#[derive(Debug, Clone)]
pub struct CapturedEndpoint {
    pub url: String,
    pub method: String,
    pub post_data: Option<String>,
    /// Request headers as sent by the browser, used verbatim on replay.
    pub headers: Value,
    /// Hints inferred from the response that established this endpoint.
    pub hints: PaginationHints,
    /// Item count of the establishing response, the best page-size guess.
    pub item_count: usize,
}

/// One captured batch of items, consumed passively by UI strategies.
#[derive(Debug, Clone)]
pub struct CapturedBatch {
    pub items: Vec<Value>,
    pub hints: PaginationHints,
    pub url: String,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    url: String,
    method: String,
    /// The wire only flags body presence; the body itself is a separate
    /// CDP fetch at finish time.
    has_post_data: bool,
    headers: Value,
    mime: Option<String>,
}

/// Shared tap state. Pure with respect to the browser: bodies enter through
/// [`InterceptState::ingest_body`], whether from CDP events or from tests.
#[derive(Debug, Default)]
pub struct InterceptState {
    pending: HashMap<String, PendingRequest>,
    endpoints: Vec<CapturedEndpoint>,
    batches: Vec<CapturedBatch>,
    bodies_seen: usize,
    dump_dir: Option<PathBuf>,
}

impl InterceptState {
    fn request_sent(&mut self, id: String, req: PendingRequest) {
        self.pending.insert(id, req);
    }

    fn response_received(&mut self, id: &str, mime: &str) {
        if let Some(p) = self.pending.get_mut(id) {
            p.mime = Some(mime.to_ascii_lowercase());
        }
    }

    fn take_json_request(&mut self, id: &str) -> Option<PendingRequest> {
        let wants = self
            .pending
            .get(id)
            .and_then(|p| p.mime.as_deref())
            .is_some_and(|m| m.contains("json"));
        if wants {
            self.pending.remove(id)
        } else {
            self.pending.remove(id);
            None
        }
    }

    /// Feed a response body through the structural scan. Registers a new
    /// endpoint on the first item-bearing payload per (method, URL) pair and
    /// queues the items for passive pickup.
    pub fn ingest_body(
        &mut self,
        url: &str,
        method: &str,
        post_data: Option<&str>,
        headers: &Value,
        body: &str,
    ) {
        self.bodies_seen += 1;
        self.dump(body);
        let Ok(parsed) = serde_json::from_str::<Value>(body) else {
            trace!(url, "non-json body skipped");
            return;
        };
        let Some((items, hints)) = infer::find_items(&parsed) else {
            return;
        };
        debug!(url, method, count = items.len(), "item-bearing response captured");
        let known = self
            .endpoints
            .iter()
            .any(|e| e.method == method && e.url == url);
        if !known {
            self.endpoints.push(CapturedEndpoint {
                url: url.to_string(),
                method: method.to_string(),
                post_data: post_data.map(str::to_string),
                headers: headers.clone(),
                hints: hints.clone(),
                item_count: items.len(),
            });
        }
        self.batches.push(CapturedBatch {
            items,
            hints,
            url: url.to_string(),
        });
    }

    fn dump(&mut self, body: &str) {
        let Some(dir) = &self.dump_dir else { return };
        let path = dir.join(format!("body-{:04}.json", self.bodies_seen));
        if let Err(e) = std::fs::write(&path, body) {
            warn!(path = %path.display(), error = %e, "dump write failed");
        }
    }
}

/// Live handle over the tap. Dropping it stops the event task.
pub struct TapHandle {
    state: Arc<Mutex<InterceptState>>,
    task: tokio::task::JoinHandle<()>,
}

impl TapHandle {
    /// Attach a tap to a page. Enables the Network domain and spawns the
    /// event task that resolves bodies for finished JSON responses.
    pub async fn attach(page: &Page, dump_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &dump_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating dump dir {}", dir.display()))?;
        }
        page.execute(EnableParams::default())
            .await
            .context("enabling Network domain")?;

        let state = Arc::new(Mutex::new(InterceptState {
            dump_dir,
            ..Default::default()
        }));

        let mut sent = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .context("subscribing to requestWillBeSent")?;
        let mut received = page
            .event_listener::<EventResponseReceived>()
            .await
            .context("subscribing to responseReceived")?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .context("subscribing to loadingFinished")?;

        let task_state = Arc::clone(&state);
        let task_page = page.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = sent.next() => {
                        let Some(ev) = ev else { break };
                        if !is_data_request(ev.r#type.as_ref()) {
                            continue;
                        }
                        let req = PendingRequest {
                            url: ev.request.url.clone(),
                            method: ev.request.method.clone(),
                            has_post_data: ev.request.has_post_data.unwrap_or(false),
                            headers: ev.request.headers.inner().clone(),
                            mime: None,
                        };
                        lock(&task_state).request_sent(ev.request_id.inner().clone(), req);
                    }
                    ev = received.next() => {
                        let Some(ev) = ev else { break };
                        lock(&task_state)
                            .response_received(ev.request_id.inner(), &ev.response.mime_type);
                    }
                    ev = finished.next() => {
                        let Some(ev) = ev else { break };
                        let req = lock(&task_state).take_json_request(ev.request_id.inner());
                        let Some(req) = req else { continue };
                        match fetch_body(&task_page, &ev.request_id).await {
                            Ok(body) => {
                                let post_data = if req.has_post_data {
                                    fetch_post_data(&task_page, &ev.request_id).await.ok()
                                } else {
                                    None
                                };
                                lock(&task_state).ingest_body(
                                    &req.url,
                                    &req.method,
                                    post_data.as_deref(),
                                    &req.headers,
                                    &body,
                                );
                            }
                            // Bodies for evicted responses are gone; that is
                            // routine, not an error worth surfacing.
                            Err(e) => trace!(url = req.url, error = %e, "body unavailable"),
                        }
                    }
                }
            }
        });

        Ok(Self { state, task })
    }

    /// Drain batches captured since the last call.
    pub fn drain_batches(&self) -> Vec<CapturedBatch> {
        std::mem::take(&mut lock(&self.state).batches)
    }

    /// Snapshot of the endpoints established so far.
    pub fn endpoints(&self) -> Vec<CapturedEndpoint> {
        lock(&self.state).endpoints.clone()
    }

    /// Total JSON bodies examined, item-bearing or not.
    pub fn bodies_seen(&self) -> usize {
        lock(&self.state).bodies_seen
    }
}

impl Drop for TapHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock(state: &Arc<Mutex<InterceptState>>) -> std::sync::MutexGuard<'_, InterceptState> {
    // Holders never panic while locked, so poisoning cannot occur in
    // practice; recover rather than cascade.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn is_data_request(kind: Option<&ResourceType>) -> bool {
    matches!(kind, Some(ResourceType::Xhr | ResourceType::Fetch))
}

async fn fetch_post_data(page: &Page, id: &RequestId) -> Result<String> {
    let resp = page
        .execute(GetRequestPostDataParams::new(id.clone()))
        .await
        .context("Network.getRequestPostData")?;
    Ok(resp.post_data.clone())
}

async fn fetch_body(page: &Page, id: &RequestId) -> Result<String> {
    let resp = page
        .execute(GetResponseBodyParams::new(id.clone()))
        .await
        .context("Network.getResponseBody")?;
    if resp.base64_encoded {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(resp.body.as_bytes())
            .context("decoding base64 body")?;
        String::from_utf8(raw).context("response body is not UTF-8")
    } else {
        Ok(resp.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers() -> Value {
        json!({"Accept": "application/json"})
    }

    #[test]
    fn ingest_registers_endpoint_once() {
        let mut state = InterceptState::default();
        let body = json!({"data": {"cards": [{"title": "A"}], "limit": 12}}).to_string();
        state.ingest_body("https://x.test/pl/results?page=1", "GET", None, &headers(), &body);
        state.ingest_body("https://x.test/pl/results?page=1", "GET", None, &headers(), &body);
        assert_eq!(state.endpoints.len(), 1);
        assert_eq!(state.batches.len(), 2);
        assert_eq!(state.bodies_seen, 2);
    }

    #[test]
    fn ingest_tracks_distinct_urls() {
        let mut state = InterceptState::default();
        let body = json!({"cards": [{"title": "A"}]}).to_string();
        state.ingest_body("https://x.test/a", "GET", None, &headers(), &body);
        state.ingest_body("https://x.test/b", "GET", None, &headers(), &body);
        assert_eq!(state.endpoints.len(), 2);
    }

    #[test]
    fn itemless_bodies_are_counted_but_not_kept() {
        let mut state = InterceptState::default();
        state.ingest_body("https://x.test/ping", "GET", None, &headers(), r#"{"ok":true}"#);
        state.ingest_body("https://x.test/bad", "GET", None, &headers(), "<html>");
        assert!(state.endpoints.is_empty());
        assert!(state.batches.is_empty());
        assert_eq!(state.bodies_seen, 2);
    }

    #[test]
    fn post_endpoint_keeps_body_and_headers() {
        let mut state = InterceptState::default();
        let body = json!({"data": {"items": [{"title": "A"}]}}).to_string();
        state.ingest_body(
            "https://x.test/graphql",
            "POST",
            Some(r#"{"variables":{"page":1}}"#),
            &headers(),
            &body,
        );
        let ep = &state.endpoints[0];
        assert_eq!(ep.method, "POST");
        assert_eq!(ep.post_data.as_deref(), Some(r#"{"variables":{"page":1}}"#));
        assert_eq!(ep.headers["Accept"], "application/json");
        assert_eq!(ep.item_count, 1);
    }

    #[test]
    fn non_json_mime_requests_are_dropped() {
        let mut state = InterceptState::default();
        state.request_sent(
            "r1".into(),
            PendingRequest {
                url: "https://x.test/app.css".into(),
                method: "GET".into(),
                has_post_data: false,
                headers: headers(),
                mime: None,
            },
        );
        state.response_received("r1", "text/css");
        assert!(state.take_json_request("r1").is_none());
        assert!(state.pending.is_empty());
    }

    #[test]
    fn json_mime_requests_survive_to_finish() {
        let mut state = InterceptState::default();
        state.request_sent(
            "r1".into(),
            PendingRequest {
                url: "https://x.test/pl/results".into(),
                method: "POST".into(),
                has_post_data: true,
                headers: headers(),
                mime: None,
            },
        );
        state.response_received("r1", "application/json; charset=utf-8");
        let req = state.take_json_request("r1").expect("kept");
        assert_eq!(req.url, "https://x.test/pl/results");
        assert!(req.has_post_data);
    }

    #[test]
    fn dump_writes_bodies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = InterceptState {
            dump_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        state.ingest_body("https://x.test/a", "GET", None, &headers(), r#"{"ok":true}"#);
        let dumped = std::fs::read_to_string(dir.path().join("body-0001.json")).expect("dumped");
        assert_eq!(dumped, r#"{"ok":true}"#);
    }
}
