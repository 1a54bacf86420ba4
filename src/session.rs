use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TurnError;
use crate::geo::GeoPoint;
use crate::recommendation::CompositeResult;
use crate::settings::SessionSettings;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    InitialRequest,
    FollowUp,
    Response,
    ItineraryUpdate,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub kind: MessageKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Facts carried between turns for prompt building.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionContext {
    pub city_name: Option<String>,
    pub country: Option<String>,
    pub city_id: Option<Uuid>,
    pub summary: Option<String>,
    pub reference_location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: SessionStatus,
    pub current_result: CompositeResult,
    pub history: Vec<Message>,
    pub context: SessionContext,
    pub settings: SessionSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: Uuid, settings: SessionSettings, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: SessionStatus::Active,
            current_result: CompositeResult::default(),
            history: Vec::new(),
            context: SessionContext::default(),
            settings,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Flip an overdue Active session to Expired and return the status.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) -> SessionStatus {
        if self.status == SessionStatus::Active && self.expires_at <= now {
            self.status = SessionStatus::Expired;
            self.updated_at = now;
        }
        self.status
    }

    /// Fails for expired sessions, flipping an overdue Active session to Expired.
    pub fn ensure_active(&mut self, now: DateTime<Utc>) -> Result<(), TurnError> {
        match self.refresh_status(now) {
            SessionStatus::Active => Ok(()),
            SessionStatus::Expired => Err(TurnError::SessionExpired(self.id)),
        }
    }

    /// Explicit end of the conversation. Terminal.
    pub fn end(&mut self) {
        self.status = SessionStatus::Expired;
        self.updated_at = Utc::now();
    }

    pub fn extend(&mut self, ttl: Duration) {
        if self.status == SessionStatus::Active {
            let now = Utc::now();
            self.expires_at = now + ttl;
            self.updated_at = now;
        }
    }

    /// Append to history and return the stored message.
    pub fn push_message(&mut self, role: Role, kind: MessageKind, content: impl Into<String>) -> Message {
        let msg = Message {
            id: Uuid::new_v4(),
            role,
            kind,
            content: content.into(),
            created_at: Utc::now(),
        };
        self.history.push(msg.clone());
        self.updated_at = msg.created_at;
        msg
    }

    /// The last `n` messages, oldest first.
    pub fn recent_history(&self, n: usize) -> &[Message] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(Uuid::new_v4(), SessionSettings::default(), Duration::hours(24))
    }

    #[test]
    fn new_session_is_active_for_a_day() {
        let s = session();
        assert_eq!(s.status, SessionStatus::Active);
        let ttl = s.expires_at - s.created_at;
        assert_eq!(ttl, Duration::hours(24));
    }

    #[test]
    fn overdue_session_expires_on_check() {
        let mut s = session();
        let later = s.expires_at + Duration::seconds(1);
        let err = s.ensure_active(later).unwrap_err();
        assert!(matches!(err, TurnError::SessionExpired(id) if id == s.id));
        assert_eq!(s.status, SessionStatus::Expired);
    }

    #[test]
    fn refresh_reports_without_failing() {
        let mut s = session();
        assert_eq!(s.refresh_status(Utc::now()), SessionStatus::Active);
        let later = s.expires_at + Duration::seconds(1);
        assert_eq!(s.refresh_status(later), SessionStatus::Expired);
        assert_eq!(s.updated_at, later);
    }

    #[test]
    fn expired_is_terminal() {
        let mut s = session();
        s.end();
        s.extend(Duration::hours(24));
        assert_eq!(s.status, SessionStatus::Expired);
        assert!(s.ensure_active(Utc::now()).is_err());
    }

    #[test]
    fn extend_pushes_expiry_forward() {
        let mut s = session();
        s.expires_at = Utc::now() + Duration::minutes(1);
        s.extend(Duration::hours(24));
        assert!(s.expires_at > Utc::now() + Duration::hours(23));
    }

    #[test]
    fn history_is_append_only_in_order() {
        let mut s = session();
        s.push_message(Role::User, MessageKind::InitialRequest, "plan Lisbon");
        s.push_message(Role::Assistant, MessageKind::Response, "done");
        s.push_message(Role::User, MessageKind::FollowUp, "add Aquarium");
        let contents: Vec<_> = s.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["plan Lisbon", "done", "add Aquarium"]);
        assert_eq!(s.recent_history(2).len(), 2);
        assert_eq!(s.recent_history(2)[0].content, "done");
        assert_eq!(s.recent_history(10).len(), 3);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [SessionStatus::Active, SessionStatus::Expired] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("paused"), None);
    }
}
