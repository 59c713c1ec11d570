//! Request/response surface of the session manager.
//!
//! Callers hold a cloneable [`SessionHandle`]; every call submits a command
//! carrying a one-shot reply channel and waits for the loop to answer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::shared::addr::ContainerAddr;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session manager is shutting down")]
    ShuttingDown,
}

/// API projection of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    #[serde(rename = "SessionID")]
    pub session_id: String,
    #[serde(rename = "Addr")]
    pub addr: ContainerAddr,
    #[serde(rename = "ExpiresOn")]
    pub expires_on: DateTime<Utc>,
}

pub(crate) enum SessionCommand {
    Match {
        session_id: String,
        session_hash: String,
        reply: oneshot::Sender<Result<ContainerAddr, SessionError>>,
    },
    Delete {
        session_hash: String,
        reply: oneshot::Sender<bool>,
    },
    GetSessions {
        reply: oneshot::Sender<HashMap<String, SessionInfo>>,
    },
}

impl SessionCommand {
    /// Answer a command with the shutdown error. Used while draining.
    pub(crate) fn cancel(self) {
        match self {
            SessionCommand::Match { reply, .. } => {
                let _ = reply.send(Err(SessionError::ShuttingDown));
            }
            SessionCommand::Delete { reply, .. } => {
                let _ = reply.send(false);
            }
            SessionCommand::GetSessions { reply } => {
                let _ = reply.send(HashMap::new());
            }
        }
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

pub(crate) fn channel(capacity: usize) -> (SessionHandle, mpsc::Receiver<SessionCommand>) {
    let (tx, rx) = mpsc::channel(capacity);
    (SessionHandle { tx }, rx)
}

impl SessionHandle {
    /// Resolve the instance bound to this session, leasing a fresh one if
    /// needed. Blocks until an instance is available or shutdown begins.
    pub async fn match_container(
        &self,
        session_id: String,
        session_hash: String,
    ) -> Result<ContainerAddr, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Match {
                session_id,
                session_hash,
                reply,
            })
            .await
            .map_err(|_| SessionError::ShuttingDown)?;
        rx.await.map_err(|_| SessionError::ShuttingDown)?
    }

    /// Remove a session and release its instance. Returns whether the
    /// session existed.
    pub async fn delete(&self, session_hash: String) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Delete {
                session_hash,
                reply,
            })
            .await
            .map_err(|_| SessionError::ShuttingDown)?;
        rx.await.map_err(|_| SessionError::ShuttingDown)
    }

    /// Read-only snapshot of all live sessions, keyed by session hash.
    pub async fn sessions(&self) -> Result<HashMap<String, SessionInfo>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::GetSessions { reply })
            .await
            .map_err(|_| SessionError::ShuttingDown)?;
        rx.await.map_err(|_| SessionError::ShuttingDown)
    }
}
