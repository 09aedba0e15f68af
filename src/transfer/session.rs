use log::info;
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;

use crate::core::protocol::{FileId, Role};
use crate::utils::{Result, ShareError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Announced,
    Distributing,
    Complete,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed)
    }

    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Announced, Distributing)
                | (Announced, Failed)
                | (Distributing, Complete)
                | (Distributing, Failed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Announced => "announced",
            SessionState::Distributing => "distributing",
            SessionState::Complete => "complete",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of one file on this node.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub file_id: FileId,
    pub role: Role,
    pub state: SessionState,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub chunks_served: u64,
}

impl TransferSession {
    pub fn new(file_id: FileId, role: Role, now: Instant) -> Self {
        Self {
            file_id,
            role,
            state: SessionState::Announced,
            created_at: now,
            updated_at: now,
            chunks_served: 0,
        }
    }

    /// Move to `next`. Re-entering the current state is a no-op and returns
    /// `Ok(false)`.
    pub fn transition(&mut self, next: SessionState, now: Instant) -> Result<bool> {
        if self.state == next {
            return Ok(false);
        }
        if self.state.is_terminal() {
            return Err(ShareError::InvalidTransition(format!(
                "{} already ended as {}",
                self.file_id, self.state
            )));
        }
        if !self.state.can_become(next) {
            return Err(ShareError::InvalidTransition(format!(
                "{}: {} -> {}",
                self.file_id, self.state, next
            )));
        }

        info!("Session {} ({}): {} -> {}", self.file_id, self.role, self.state, next);
        self.state = next;
        self.updated_at = now;
        Ok(true)
    }
}

#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<FileId, TransferSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session in `Announced`. A failed session is replaced so the
    /// file can be fetched again; any other existing session is kept and
    /// `false` is returned.
    pub fn announce(&mut self, file_id: &FileId, role: Role, now: Instant) -> bool {
        if let Some(existing) = self.sessions.get(file_id) {
            if existing.state != SessionState::Failed {
                return false;
            }
        }
        self.sessions
            .insert(file_id.clone(), TransferSession::new(file_id.clone(), role, now));
        true
    }

    pub fn transition(
        &mut self,
        file_id: &FileId,
        next: SessionState,
        now: Instant,
    ) -> Result<bool> {
        self.sessions
            .get_mut(file_id)
            .ok_or_else(|| ShareError::FileNotFound(file_id.to_string()))?
            .transition(next, now)
    }

    /// Count a served chunk. The first one moves a freshly announced session
    /// to `Distributing`.
    pub fn mark_served(&mut self, file_id: &FileId, now: Instant) -> Result<()> {
        let session = self
            .sessions
            .get_mut(file_id)
            .ok_or_else(|| ShareError::FileNotFound(file_id.to_string()))?;
        session.chunks_served += 1;
        if session.state == SessionState::Announced {
            session.transition(SessionState::Distributing, now)?;
        }
        Ok(())
    }

    pub fn get(&self, file_id: &FileId) -> Option<&TransferSession> {
        self.sessions.get(file_id)
    }

    pub fn state(&self, file_id: &FileId) -> Option<SessionState> {
        self.sessions.get(file_id).map(|s| s.state)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
