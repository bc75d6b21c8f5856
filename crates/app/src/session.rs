use std::fmt;

use snafu::{Snafu, ensure};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    email: String,
}

impl Session {
    pub fn new(id: SessionId, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// The part of the email before `@`, used in greetings.
    pub fn display_label(&self) -> &str {
        self.email
            .split_once('@')
            .map_or(self.email.as_str(), |(local, _)| local)
    }
}

/// Who is using the app right now. There is no "maybe" session: callers match
/// on the variant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionContext {
    #[default]
    SignedOut,
    SignedIn(Session),
}

impl SessionContext {
    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::SignedIn(session) => Some(session),
            Self::SignedOut => None,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self, Self::SignedIn(_))
    }
}

/// Source of the current session and its sign-in / sign-out lifecycle.
pub trait SessionProvider: Send + Sync {
    fn current(&self) -> SessionContext;

    /// Yields the new context after every sign-in or sign-out.
    fn watch(&self) -> watch::Receiver<SessionContext>;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("'{email}' is not a usable email address"))]
    InvalidEmail { stage: &'static str, email: String },
}

pub type SessionResult<T> = Result<T, SessionError>;

/// In-process provider. Identity is taken at face value; the session id is a
/// UUID v5 of the normalized email so the same address always maps to the same
/// owner.
pub struct LocalSessionProvider {
    state: watch::Sender<SessionContext>,
}

impl Default for LocalSessionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSessionProvider {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionContext::SignedOut);
        Self { state }
    }

    pub fn sign_in(&self, email: &str) -> SessionResult<Session> {
        let email = email.trim();
        ensure!(
            email
                .split_once('@')
                .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty()),
            InvalidEmailSnafu {
                stage: "session-sign-in-validate",
                email: email.to_string(),
            }
        );

        let session = Session::new(session_id_for_email(email), email);
        let next = SessionContext::SignedIn(session.clone());
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });

        if changed {
            tracing::info!(session_id = %session.id(), "signed in");
        }
        Ok(session)
    }

    /// Returns whether a session was actually ended.
    pub fn sign_out(&self) -> bool {
        let ended = self.state.send_if_modified(|current| {
            if matches!(current, SessionContext::SignedOut) {
                return false;
            }
            *current = SessionContext::SignedOut;
            true
        });

        if ended {
            tracing::info!("signed out");
        }
        ended
    }
}

impl SessionProvider for LocalSessionProvider {
    fn current(&self) -> SessionContext {
        self.state.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<SessionContext> {
        self.state.subscribe()
    }
}

fn session_id_for_email(email: &str) -> SessionId {
    let normalized = email.to_lowercase();
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("mailto:{normalized}").as_bytes());
    SessionId::new(uuid.to_string())
}
