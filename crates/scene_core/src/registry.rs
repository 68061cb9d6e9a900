//! Session registry shared by every session of an orchestrator.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scene_agents::AgentRole;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, CoreResult};
use crate::result::GenerationResult;

/// Session lifecycle status. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Pending,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Pending => 1,
            Self::Running => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A progress log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub stage: String,
    pub role: Option<AgentRole>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// How `modify_agents` changes the agent set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    Add,
    Remove,
}

/// Snapshot of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub prompt: String,
    pub active_agents: BTreeSet<AgentRole>,
    pub dispatched: BTreeSet<AgentRole>,
    pub context_refs: Vec<String>,
    pub progress: Vec<ProgressEntry>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<GenerationResult>,
}

impl Session {
    fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: SessionStatus::Created,
            prompt: String::new(),
            active_agents: BTreeSet::new(),
            dispatched: BTreeSet::new(),
            context_refs: Vec::new(),
            progress: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        }
    }

    fn set_status(&mut self, next: SessionStatus, now: DateTime<Utc>) -> CoreResult<()> {
        if next == self.status {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(CoreError::invalid_transition(self.status, next));
        }
        if next == SessionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }
}

/// Registry of sessions behind one lock.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    clock: Arc<dyn Clock>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Create an empty session and return its id.
    pub fn create(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), self.clock.now());
        self.sessions.lock().insert(id.clone(), session);
        debug!("Created session {}", id);
        id
    }

    /// Move a session to `Pending` with its prompt and agent set.
    ///
    /// With no id a new session is created first.
    pub fn start(
        &self,
        id: Option<&str>,
        prompt: impl Into<String>,
        agents: impl IntoIterator<Item = AgentRole>,
        context_refs: Vec<String>,
    ) -> CoreResult<Session> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.create(),
        };
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| CoreError::SessionNotFound(id.clone()))?;

        if session.status != SessionStatus::Created {
            return Err(CoreError::InvalidState(format!(
                "session {} already {}",
                id, session.status
            )));
        }
        session.set_status(SessionStatus::Pending, now)?;
        session.prompt = prompt.into();
        session.active_agents = agents.into_iter().map(|r| r.stage_role()).collect();
        session.context_refs = context_refs;
        Ok(session.clone())
    }

    pub fn update_status(&self, id: &str, status: SessionStatus, error: Option<String>) -> CoreResult<()> {
        let now = self.clock.now();
        self.with_session(id, |session| {
            session.set_status(status, now)?;
            if error.is_some() {
                session.error = error;
            }
            Ok(())
        })
    }

    pub fn append_progress(
        &self,
        id: &str,
        stage: impl Into<String>,
        role: Option<AgentRole>,
        message: impl Into<String>,
    ) -> CoreResult<()> {
        let entry = ProgressEntry {
            stage: stage.into(),
            role,
            message: message.into(),
            timestamp: self.clock.now(),
        };
        self.with_session(id, |session| {
            session.progress.push(entry);
            Ok(())
        })
    }

    /// Store the final result. A session completes exactly once.
    pub fn complete(&self, id: &str, result: GenerationResult) -> CoreResult<()> {
        let now = self.clock.now();
        self.with_session(id, |session| {
            if session.result.is_some() || session.status.is_terminal() {
                return Err(CoreError::InvalidState(format!("session {} already completed", id)));
            }
            let status = if result.success {
                SessionStatus::Completed
            } else {
                SessionStatus::Failed
            };
            session.set_status(status, now)?;
            if let Some(error) = &result.error {
                session.error = Some(error.to_string());
            }
            session.result = Some(result);
            Ok(())
        })
    }

    /// Add or remove roles that have not been dispatched yet.
    ///
    /// Returns the resulting agent set.
    pub fn modify_agents(
        &self,
        id: &str,
        action: AgentAction,
        roles: &[AgentRole],
    ) -> CoreResult<BTreeSet<AgentRole>> {
        self.with_session(id, |session| {
            if session.status.is_terminal() {
                return Err(CoreError::InvalidState(format!(
                    "session {} is {}",
                    id, session.status
                )));
            }
            for role in roles.iter().map(|r| r.stage_role()) {
                if session.dispatched.contains(&role) {
                    debug!("Ignoring {:?} of dispatched role {} in {}", action, role, id);
                    continue;
                }
                match action {
                    AgentAction::Add => session.active_agents.insert(role),
                    AgentAction::Remove => session.active_agents.remove(&role),
                };
            }
            Ok(session.active_agents.clone())
        })
    }

    /// Mark `role` dispatched if it is still in the agent set.
    ///
    /// Returns `false` when the role was removed before dispatch.
    pub fn claim_dispatch(&self, id: &str, role: AgentRole) -> CoreResult<bool> {
        let role = role.stage_role();
        self.with_session(id, |session| {
            if !session.active_agents.contains(&role) {
                return Ok(false);
            }
            session.dispatched.insert(role);
            Ok(true)
        })
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn get_required(&self, id: &str) -> CoreResult<Session> {
        self.get(id).ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    /// Sessions that are pending or running.
    pub fn list_active(&self) -> Vec<Session> {
        let mut active: Vec<Session> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.status.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        active
    }

    /// Drop terminal sessions that completed more than `ttl` ago.
    pub fn purge_older_than(&self, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| match (s.status.is_terminal(), s.completed_at) {
            (true, Some(done)) => now.signed_duration_since(done) <= ttl,
            _ => true,
        });
        let purged = before - sessions.len();
        if purged > 0 {
            debug!("Purged {} sessions", purged);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn with_session<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> CoreResult<T>) -> CoreResult<T> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
        f(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::recovery::{ErrorContext, ErrorKind};

    fn registry() -> (SessionRegistry, Arc<ManualClock>) {
        let clock = ManualClock::at_minute_start().shared();
        (SessionRegistry::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_status_only_moves_forward() {
        let (registry, _) = registry();
        let session = registry.start(None, "a red cube", AgentRole::default_set(), vec![]).unwrap();
        let id = session.id.as_str();

        registry.update_status(id, SessionStatus::Running, None).unwrap();
        registry.update_status(id, SessionStatus::Running, None).unwrap();
        assert!(registry.update_status(id, SessionStatus::Pending, None).is_err());
        assert!(registry.update_status(id, SessionStatus::Created, None).is_err());

        registry.update_status(id, SessionStatus::Failed, Some("boom".into())).unwrap();
        assert!(registry.update_status(id, SessionStatus::Completed, None).is_err());
        assert!(registry.update_status(id, SessionStatus::Running, None).is_err());

        let session = registry.get(id).unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.error.as_deref(), Some("boom"));
        assert!(session.started_at.is_some());
        assert!(session.completed_at.is_some());
    }

    #[test]
    fn test_start_existing_session() {
        let (registry, _) = registry();
        let id = registry.create();
        let session = registry
            .start(Some(&id), "prompt", [AgentRole::StructureAlt], vec!["ref-1".into()])
            .unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.active_agents.contains(&AgentRole::Structure));
        assert_eq!(session.context_refs, vec!["ref-1".to_string()]);

        assert!(registry.start(Some(&id), "again", [], vec![]).is_err());
        assert!(matches!(
            registry.start(Some("missing"), "p", [], vec![]),
            Err(CoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_complete_once() {
        let (registry, _) = registry();
        let id = registry.start(None, "p", [], vec![]).unwrap().id;
        registry.update_status(&id, SessionStatus::Running, None).unwrap();

        registry.complete(&id, GenerationResult::success(&id, "scene.blend", 1)).unwrap();
        let failure = GenerationResult::failure(
            &id,
            ErrorContext::new(ErrorKind::AgentFailure, AgentRole::Concept, "late"),
            1,
        );
        assert!(registry.complete(&id, failure).is_err());

        let session = registry.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.result.unwrap().success);
    }

    #[test]
    fn test_modify_agents_only_touches_undispatched() {
        let (registry, _) = registry();
        let id = registry.start(None, "p", AgentRole::default_set(), vec![]).unwrap().id;

        assert!(registry.claim_dispatch(&id, AgentRole::Concept).unwrap());
        let agents = registry
            .modify_agents(&id, AgentAction::Remove, &[AgentRole::Concept, AgentRole::Surface])
            .unwrap();
        assert!(agents.contains(&AgentRole::Concept));
        assert!(!agents.contains(&AgentRole::Surface));
        assert!(!registry.claim_dispatch(&id, AgentRole::Surface).unwrap());

        let agents = registry.modify_agents(&id, AgentAction::Add, &[AgentRole::Motion]).unwrap();
        assert!(agents.contains(&AgentRole::Motion));
        assert!(registry.claim_dispatch(&id, AgentRole::Motion).unwrap());
    }

    #[test]
    fn test_list_active_and_purge() {
        let (registry, clock) = registry();
        let running = registry.start(None, "a", [], vec![]).unwrap().id;
        let done = registry.start(None, "b", [], vec![]).unwrap().id;
        let _created = registry.create();
        registry.update_status(&running, SessionStatus::Running, None).unwrap();
        registry.complete(&done, GenerationResult::success(&done, "x", 1)).unwrap();

        let active: Vec<_> = registry.list_active().into_iter().map(|s| s.id).collect();
        assert_eq!(active, vec![running.clone()]);

        clock.advance(Duration::from_secs(30));
        assert_eq!(registry.purge_older_than(Duration::from_secs(60)), 0);
        clock.advance(Duration::from_secs(60));
        assert_eq!(registry.purge_older_than(Duration::from_secs(60)), 1);
        assert!(registry.get(&done).is_none());
        assert!(registry.get(&running).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_session() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.append_progress("nope", "concept", None, "hi"),
            Err(CoreError::SessionNotFound(_))
        ));
    }
}
