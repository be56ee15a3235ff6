//! Turns the per-prompt event stream into panel updates.
//!
//! The panel renders whole snapshots, so every delta republishes the
//! full accumulated content under one response id. A reconciler is done
//! after exactly one terminal update (`StreamComplete` or
//! `StreamError`), whether that came from the stream or from a cancel.

use opengui_client::{MessageEvent, StreamCancel};

use crate::messages::PanelUpdate;

pub struct StreamReconciler {
    id: String,
    buffer: String,
    done: bool,
    cancel: StreamCancel,
}

impl StreamReconciler {
    pub fn new(id: String, cancel: StreamCancel) -> Self {
        Self {
            id,
            buffer: String::new(),
            done: false,
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn apply(&mut self, event: MessageEvent) -> Option<PanelUpdate> {
        if self.done {
            return None;
        }
        match event {
            MessageEvent::ContentDelta { delta, .. } => {
                self.buffer.push_str(&delta);
                Some(PanelUpdate::MessageUpdate {
                    id: self.id.clone(),
                    content: self.buffer.clone(),
                })
            }
            MessageEvent::ToolCall { tool, .. } => {
                // Tool activity shows up inline in the transcript.
                if !self.buffer.is_empty() && !self.buffer.ends_with('\n') {
                    self.buffer.push('\n');
                }
                self.buffer.push_str(&format!("[tool: {tool}]\n"));
                Some(PanelUpdate::MessageUpdate {
                    id: self.id.clone(),
                    content: self.buffer.clone(),
                })
            }
            MessageEvent::ContentComplete { .. } => {
                self.done = true;
                Some(PanelUpdate::StreamComplete {
                    id: self.id.clone(),
                })
            }
            MessageEvent::Error { message } => {
                self.done = true;
                Some(PanelUpdate::StreamError {
                    id: self.id.clone(),
                    error: message,
                })
            }
        }
    }

    /// Stop the underlying stream and synthesize completion so the panel
    /// leaves its streaming state. Idempotent.
    pub fn cancel(&mut self) -> Option<PanelUpdate> {
        self.cancel.cancel();
        if self.done {
            return None;
        }
        self.done = true;
        Some(PanelUpdate::StreamComplete {
            id: self.id.clone(),
        })
    }

    /// The stream ended without a terminal event and without a cancel.
    pub fn finish_interrupted(&mut self) -> Option<PanelUpdate> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(PanelUpdate::StreamError {
            id: self.id.clone(),
            error: "response stream ended unexpectedly".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opengui_client::test_utils;

    fn reconciler() -> StreamReconciler {
        // A scripted stream's handle is a convenient detached cancel flag.
        let stream = test_utils::scripted_stream(Vec::new());
        StreamReconciler::new("msg_1".to_string(), stream.cancel_handle())
    }

    fn delta(text: &str) -> MessageEvent {
        MessageEvent::ContentDelta {
            message_id: "srv_1".to_string(),
            delta: text.to_string(),
        }
    }

    #[tokio::test]
    async fn deltas_republish_the_full_snapshot() {
        let mut reconciler = reconciler();
        let first = reconciler.apply(delta("Hello"));
        let second = reconciler.apply(delta(", world"));

        match first {
            Some(PanelUpdate::MessageUpdate { id, content }) => {
                assert_eq!(id, "msg_1");
                assert_eq!(content, "Hello");
            }
            other => panic!("unexpected update: {other:?}"),
        }
        match second {
            Some(PanelUpdate::MessageUpdate { content, .. }) => {
                assert_eq!(content, "Hello, world");
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_is_terminal() {
        let mut reconciler = reconciler();
        reconciler.apply(delta("done"));
        let update = reconciler.apply(MessageEvent::ContentComplete {
            message_id: "srv_1".to_string(),
            content: "done".to_string(),
        });
        assert!(matches!(update, Some(PanelUpdate::StreamComplete { .. })));
        assert!(reconciler.is_done());
        assert!(reconciler.apply(delta("late")).is_none());
        assert!(reconciler.cancel().is_none());
    }

    #[tokio::test]
    async fn cancel_synthesizes_completion_once() {
        let mut reconciler = reconciler();
        reconciler.apply(delta("partial"));

        let update = reconciler.cancel();
        assert!(matches!(update, Some(PanelUpdate::StreamComplete { .. })));
        assert!(reconciler.cancel().is_none());
        assert!(reconciler.apply(delta("late")).is_none());
        assert!(reconciler.finish_interrupted().is_none());
    }

    #[tokio::test]
    async fn errors_map_to_stream_error() {
        let mut reconciler = reconciler();
        let update = reconciler.apply(MessageEvent::Error {
            message: "provider quota exceeded".to_string(),
        });
        match update {
            Some(PanelUpdate::StreamError { id, error }) => {
                assert_eq!(id, "msg_1");
                assert_eq!(error, "provider quota exceeded");
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupted_stream_surfaces_an_error() {
        let mut reconciler = reconciler();
        reconciler.apply(delta("partial"));
        let update = reconciler.finish_interrupted();
        assert!(matches!(update, Some(PanelUpdate::StreamError { .. })));
    }

    #[tokio::test]
    async fn tool_calls_render_inline() {
        let mut reconciler = reconciler();
        reconciler.apply(delta("Checking"));
        let update = reconciler.apply(MessageEvent::ToolCall {
            message_id: "srv_1".to_string(),
            tool: "read_file".to_string(),
        });
        match update {
            Some(PanelUpdate::MessageUpdate { content, .. }) => {
                assert_eq!(content, "Checking\n[tool: read_file]\n");
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }
}
