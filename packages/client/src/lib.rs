//! HTTP + SSE client for a locally running opencode server.
//!
//! The server exposes a small REST surface for session management and a
//! single `/event` stream shared by every session. [`OpenCodeClient`]
//! wraps both: session calls are plain request/response, and
//! [`OpenCodeClient::send_message`] turns the shared stream into a
//! per-prompt [`MessageStream`] of normalized [`MessageEvent`]s.

pub mod events;
mod follow;
mod sse;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{Stream, StreamExt};
use opengui_error::HostError;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

pub use events::MessageEvent;

use events::decode_event;
use follow::PromptFollower;
use sse::SseAccumulator;

const STREAM_CHANNEL_SIZE: usize = 64;

/// A chat session as reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub time: SessionTime,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

#[derive(Debug, Clone)]
pub struct OpenCodeClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenCodeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn create_session(&self) -> Result<Session, HostError> {
        let response = self
            .http
            .post(format!("{}/session", self.base_url))
            .send()
            .await
            .map_err(|err| HostError::SessionCreate {
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(HostError::SessionCreate {
                message: format!("server returned {}", response.status()),
            });
        }
        response.json().await.map_err(|err| HostError::SessionCreate {
            message: err.to_string(),
        })
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, HostError> {
        let response = self
            .http
            .get(format!("{}/session/{session_id}", self.base_url))
            .send()
            .await
            .map_err(HostError::transport)?;
        if !response.status().is_success() {
            return Err(HostError::transport(format!(
                "session lookup returned {}",
                response.status()
            )));
        }
        response.json().await.map_err(HostError::transport)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, HostError> {
        let response = self
            .http
            .get(format!("{}/session", self.base_url))
            .send()
            .await
            .map_err(HostError::transport)?;
        if !response.status().is_success() {
            return Err(HostError::transport(format!(
                "session list returned {}",
                response.status()
            )));
        }
        response.json().await.map_err(HostError::transport)
    }

    /// Send a prompt and stream the assistant's reply.
    ///
    /// Returns immediately; the subscription to `/event` is established
    /// before the prompt is dispatched so no reply events are lost. The
    /// stream ends after exactly one terminal event, or silently when
    /// cancelled through [`MessageStream::cancel_handle`].
    pub fn send_message(&self, session_id: &str, content: &str) -> MessageStream {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let cancel = StreamCancel::new();
        tokio::spawn(run_message_stream(
            self.http.clone(),
            self.base_url.clone(),
            session_id.to_string(),
            content.to_string(),
            tx,
            cancel.clone(),
        ));
        MessageStream {
            events: ReceiverStream::new(rx),
            cancel,
        }
    }
}

/// Cooperative cancellation for one in-flight prompt. Cloning shares the
/// flag; cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct StreamCancel(Arc<AtomicBool>);

impl StreamCancel {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The reply to one prompt, as an ordered stream of [`MessageEvent`]s.
pub struct MessageStream {
    events: ReceiverStream<MessageEvent>,
    cancel: StreamCancel,
}

impl MessageStream {
    pub fn cancel_handle(&self) -> StreamCancel {
        self.cancel.clone()
    }

    pub async fn next(&mut self) -> Option<MessageEvent> {
        self.events.next().await
    }
}

impl Stream for MessageStream {
    type Item = MessageEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

async fn run_message_stream(
    http: reqwest::Client,
    base_url: String,
    session_id: String,
    content: String,
    tx: mpsc::Sender<MessageEvent>,
    cancel: StreamCancel,
) {
    if let Err(err) = pump_events(&http, &base_url, &session_id, &content, &tx, &cancel).await {
        if !cancel.is_cancelled() {
            let _ = tx
                .send(MessageEvent::Error {
                    message: err.to_string(),
                })
                .await;
        }
    }
}

async fn pump_events(
    http: &reqwest::Client,
    base_url: &str,
    session_id: &str,
    content: &str,
    tx: &mpsc::Sender<MessageEvent>,
    cancel: &StreamCancel,
) -> Result<(), HostError> {
    // Subscribe before dispatching so the reply's first events cannot
    // race past us.
    let response = http
        .get(format!("{base_url}/event"))
        .send()
        .await
        .map_err(HostError::stream)?;
    if !response.status().is_success() {
        return Err(HostError::stream(format!(
            "event stream returned {}",
            response.status()
        )));
    }
    let mut body = response.bytes_stream();

    let mut follower = PromptFollower::new(session_id.to_string(), epoch_millis());
    let mut accumulator = SseAccumulator::new();

    let (notice_tx, mut notice_rx) = oneshot::channel();
    let prompt_http = http.clone();
    let prompt_url = format!("{base_url}/session/{session_id}/prompt");
    let prompt_body = serde_json::json!({
        "parts": [{ "type": "text", "text": content }],
    });
    tokio::spawn(async move {
        let outcome = match prompt_http.post(prompt_url).json(&prompt_body).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(HostError::transport(format!(
                "prompt dispatch returned {}",
                response.status()
            ))),
            Err(err) => Err(HostError::transport(err)),
        };
        let _ = notice_tx.send(outcome);
    });
    let mut prompt_settled = false;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        tokio::select! {
            chunk = body.next() => {
                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(err)) => return Err(HostError::stream(err)),
                    None => {
                        return Err(HostError::stream(
                            "event stream closed before the reply completed",
                        ))
                    }
                };
                for payload in accumulator.push(&bytes) {
                    let Some(event) = decode_event(&payload) else {
                        tracing::trace!(payload, "dropping undecodable event payload");
                        continue;
                    };
                    for message in follower.apply(&event) {
                        let terminal = message.is_terminal();
                        if tx.send(message).await.is_err() {
                            // Receiver dropped; nobody is listening.
                            return Ok(());
                        }
                        if terminal {
                            return Ok(());
                        }
                    }
                }
            }
            outcome = &mut notice_rx, if !prompt_settled => {
                prompt_settled = true;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(_) => {
                        return Err(HostError::transport("prompt dispatch task dropped"));
                    }
                }
            }
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    //! Canned [`MessageStream`]s for exercising consumers without a
    //! running server.

    use std::time::Duration;

    use super::*;

    /// A stream that yields `events` in order and then ends.
    pub fn scripted_stream(events: Vec<MessageEvent>) -> MessageStream {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.try_send(event);
        }
        MessageStream {
            events: ReceiverStream::new(rx),
            cancel: StreamCancel::new(),
        }
    }

    /// A stream that yields `prefix` and then stays open until its
    /// cancel handle fires.
    pub fn stalled_stream(prefix: Vec<MessageEvent>) -> MessageStream {
        let (tx, rx) = mpsc::channel(prefix.len() + 1);
        let cancel = StreamCancel::new();
        let watcher = cancel.clone();
        tokio::spawn(async move {
            for event in prefix {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            while !watcher.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        MessageStream {
            events: ReceiverStream::new(rx),
            cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> MessageEvent {
        MessageEvent::ContentDelta {
            message_id: "msg_1".to_string(),
            delta: text.to_string(),
        }
    }

    #[tokio::test]
    async fn scripted_stream_yields_in_order_then_ends() {
        let mut stream = test_utils::scripted_stream(vec![
            delta("a"),
            delta("b"),
            MessageEvent::ContentComplete {
                message_id: "msg_1".to_string(),
                content: "ab".to_string(),
            },
        ]);
        assert_eq!(stream.next().await, Some(delta("a")));
        assert_eq!(stream.next().await, Some(delta("b")));
        assert!(matches!(
            stream.next().await,
            Some(MessageEvent::ContentComplete { .. })
        ));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn cancel_ends_a_stalled_stream_without_a_terminal() {
        let mut stream = test_utils::stalled_stream(vec![delta("partial")]);
        let handle = stream.cancel_handle();
        assert_eq!(stream.next().await, Some(delta("partial")));
        handle.cancel();
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn cancel_handle_is_shared_across_clones() {
        let cancel = StreamCancel::new();
        let clone = cancel.clone();
        assert!(!clone.is_cancelled());
        cancel.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn base_url_is_normalized() {
        let client = OpenCodeClient::new("http://127.0.0.1:47412/");
        assert_eq!(client.base_url(), "http://127.0.0.1:47412");
    }
}
