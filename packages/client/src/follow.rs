//! Correlates the shared server event stream with a single prompt.
//!
//! The server publishes one firehose of events for every session; a
//! [`PromptFollower`] locks onto the assistant message that answers a
//! particular prompt and reduces its part snapshots to incremental
//! deltas. It is pure state, fed one decoded event at a time.

use std::collections::{HashMap, HashSet};

use crate::events::{MessageEvent, ServerEvent};

/// Server and host clocks may disagree slightly; a message created up to
/// this much before the prompt was dispatched still counts as the reply.
const CLOCK_SKEW_TOLERANCE_MS: i64 = 1_000;

pub(crate) struct PromptFollower {
    session_id: String,
    dispatched_at: i64,
    message_id: Option<String>,
    part_snapshots: HashMap<String, String>,
    tools_seen: HashSet<String>,
    content: String,
    finished: bool,
}

impl PromptFollower {
    pub(crate) fn new(session_id: String, dispatched_at: i64) -> Self {
        Self {
            session_id,
            dispatched_at,
            message_id: None,
            part_snapshots: HashMap::new(),
            tools_seen: HashSet::new(),
            content: String::new(),
            finished: false,
        }
    }

    /// True once a terminal event has been produced; later events are
    /// ignored.
    pub(crate) fn finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn apply(&mut self, event: &ServerEvent) -> Vec<MessageEvent> {
        if self.finished {
            return Vec::new();
        }
        match event {
            ServerEvent::MessageUpdated { info } => {
                if info.session_id != self.session_id || info.role != "assistant" {
                    return Vec::new();
                }
                if self.message_id.is_none() {
                    let created = info.time.created.unwrap_or(i64::MIN);
                    if created >= self.dispatched_at - CLOCK_SKEW_TOLERANCE_MS {
                        self.message_id = Some(info.id.clone());
                    }
                }
                if self.message_id.as_deref() == Some(info.id.as_str()) {
                    if let Some(error) = &info.error {
                        self.finished = true;
                        return vec![MessageEvent::Error {
                            message: error.message(),
                        }];
                    }
                    if info.time.completed.is_some() {
                        self.finished = true;
                        return vec![MessageEvent::ContentComplete {
                            message_id: info.id.clone(),
                            content: self.content.clone(),
                        }];
                    }
                }
                Vec::new()
            }
            ServerEvent::PartUpdated { part } => {
                if part.session_id != self.session_id {
                    return Vec::new();
                }
                let Some(message_id) = self.message_id.as_deref() else {
                    return Vec::new();
                };
                if part.message_id != message_id {
                    return Vec::new();
                }
                match part.part_type.as_str() {
                    "text" => {
                        let text = part.text.as_deref().unwrap_or("");
                        let previous = self.part_snapshots.get(&part.id);
                        // Parts carry the full text so far; emit only what
                        // is new since the last snapshot.
                        let delta = match previous {
                            Some(prev) if text.starts_with(prev.as_str()) => &text[prev.len()..],
                            _ => text,
                        };
                        if delta.is_empty() {
                            return Vec::new();
                        }
                        let delta = delta.to_string();
                        self.content.push_str(&delta);
                        self.part_snapshots.insert(part.id.clone(), text.to_string());
                        vec![MessageEvent::ContentDelta {
                            message_id: part.message_id.clone(),
                            delta,
                        }]
                    }
                    "tool" => {
                        let Some(tool) = part.tool.as_deref() else {
                            return Vec::new();
                        };
                        if !self.tools_seen.insert(part.id.clone()) {
                            return Vec::new();
                        }
                        vec![MessageEvent::ToolCall {
                            message_id: part.message_id.clone(),
                            tool: tool.to_string(),
                        }]
                    }
                    _ => Vec::new(),
                }
            }
            ServerEvent::SessionError {
                session_id,
                message,
            } => {
                // A concurrent session's failure is not ours.
                if session_id.as_deref().is_some_and(|id| id != self.session_id) {
                    return Vec::new();
                }
                self.finished = true;
                vec![MessageEvent::Error {
                    message: message.clone(),
                }]
            }
            ServerEvent::Other { .. } => Vec::new(),
        }
    }
}
