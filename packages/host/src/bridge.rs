//! Panel-facing chat bridge: owns the active session and the in-flight
//! response, and translates [`PanelRequest`]s into client calls.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use opengui_client::{MessageStream, OpenCodeClient, Session};
use opengui_error::HostError;

use crate::messages::{PanelRequest, PanelUpdate};
use crate::reconciler::StreamReconciler;

/// The slice of the opencode client the bridge needs. Seam for tests.
pub trait ChatTransport: Send + Sync + 'static {
    fn create_session(&self) -> impl std::future::Future<Output = Result<Session, HostError>> + Send;
    fn get_session(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<Session, HostError>> + Send;
    fn list_sessions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Session>, HostError>> + Send;
    fn send_message(&self, session_id: &str, content: &str) -> MessageStream;
}

impl ChatTransport for OpenCodeClient {
    async fn create_session(&self) -> Result<Session, HostError> {
        OpenCodeClient::create_session(self).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, HostError> {
        OpenCodeClient::get_session(self, session_id).await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, HostError> {
        OpenCodeClient::list_sessions(self).await
    }

    fn send_message(&self, session_id: &str, content: &str) -> MessageStream {
        OpenCodeClient::send_message(self, session_id, content)
    }
}

pub struct ChatBridge<T> {
    transport: T,
    updates: mpsc::Sender<PanelUpdate>,
    /// Created lazily on the first send.
    session_id: Option<String>,
    active: Option<Arc<Mutex<StreamReconciler>>>,
    next_response_id: u64,
}

impl<T: ChatTransport> ChatBridge<T> {
    pub fn new(transport: T, updates: mpsc::Sender<PanelUpdate>) -> Self {
        Self {
            transport,
            updates,
            session_id: None,
            active: None,
            next_response_id: 0,
        }
    }

    pub async fn handle(&mut self, request: PanelRequest) {
        match request {
            PanelRequest::Ready => {
                self.send_update(PanelUpdate::SessionReady {
                    session_id: self.session_id.clone(),
                })
                .await;
            }
            PanelRequest::SendMessage { content } => {
                self.send_message(content).await;
            }
            PanelRequest::StopGeneration => {
                self.retire_active().await;
            }
            PanelRequest::SwitchSession { session_id } => {
                self.switch_session(session_id).await;
            }
            PanelRequest::ListSessions => {
                let sessions = match self.transport.list_sessions().await {
                    Ok(sessions) => sessions,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to list sessions");
                        Vec::new()
                    }
                };
                self.send_update(PanelUpdate::SessionList { sessions }).await;
            }
        }
    }

    async fn send_message(&mut self, content: String) {
        // One in-flight response at a time; a new send retires the old one.
        self.retire_active().await;

        let session_id = match self.ensure_session().await {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(error = %err, "cannot send message without a session");
                let id = self.next_response_id();
                self.send_update(PanelUpdate::StreamError {
                    id,
                    error: err.to_string(),
                })
                .await;
                return;
            }
        };

        let id = self.next_response_id();
        tracing::debug!(%session_id, response = %id, "dispatching prompt");
        let mut stream = self.transport.send_message(&session_id, &content);
        let reconciler = Arc::new(Mutex::new(StreamReconciler::new(
            id,
            stream.cancel_handle(),
        )));
        self.active = Some(reconciler.clone());

        let updates = self.updates.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let update = reconciler.lock().await.apply(event);
                if let Some(update) = update {
                    if updates.send(update).await.is_err() {
                        return;
                    }
                }
                if reconciler.lock().await.is_done() {
                    return;
                }
            }
            let update = reconciler.lock().await.finish_interrupted();
            if let Some(update) = update {
                let _ = updates.send(update).await;
            }
        });
    }

    async fn switch_session(&mut self, session_id: String) {
        self.retire_active().await;
        match self.transport.get_session(&session_id).await {
            Ok(session) => {
                self.session_id = Some(session.id.clone());
                self.send_update(PanelUpdate::SessionReady {
                    session_id: Some(session.id),
                })
                .await;
            }
            Err(err) => {
                // Keep the current session; tell the panel where it stands.
                tracing::warn!(%session_id, error = %err, "cannot switch to unknown session");
                self.send_update(PanelUpdate::SessionReady {
                    session_id: self.session_id.clone(),
                })
                .await;
            }
        }
    }

    async fn ensure_session(&mut self) -> Result<String, HostError> {
        if let Some(id) = &self.session_id {
            return Ok(id.clone());
        }
        let session = self.transport.create_session().await?;
        tracing::info!(session = %session.id, "created chat session");
        self.session_id = Some(session.id.clone());
        self.send_update(PanelUpdate::SessionReady {
            session_id: Some(session.id.clone()),
        })
        .await;
        Ok(session.id)
    }

    async fn retire_active(&mut self) {
        if let Some(active) = self.active.take() {
            let update = active.lock().await.cancel();
            if let Some(update) = update {
                self.send_update(update).await;
            }
        }
    }

    fn next_response_id(&mut self) -> String {
        self.next_response_id += 1;
        format!("msg_{}", self.next_response_id)
    }

    async fn send_update(&self, update: PanelUpdate) {
        if self.updates.send(update).await.is_err() {
            tracing::warn!("panel update channel closed");
        }
    }
}
