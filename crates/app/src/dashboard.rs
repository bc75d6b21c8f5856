//! Per-session view state: which projections are open and which tab is shown.

use std::fmt;
use std::str::FromStr;

use anuja_storage::Direction;

use crate::records::{CHATS_COLLECTION, ConversationTurn, GeneratedImageRecord, IMAGES_COLLECTION};
use crate::session::{Session, SessionContext};
use crate::sync::{LiveQuery, TIMESTAMP_FIELD, ViewSync};

pub const EMPTY_GALLERY_TEXT: &str = "No images yet. Generate some AI art to get started!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tab {
    #[default]
    Chat,
    Generate,
    Gallery,
}

impl Tab {
    pub const ALL: [Tab; 3] = [Tab::Chat, Tab::Generate, Tab::Gallery];

    pub fn label(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Generate => "generate",
            Self::Gallery => "gallery",
        }
    }
}

impl fmt::Display for Tab {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.label())
    }
}

impl FromStr for Tab {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|tab| tab.label().eq_ignore_ascii_case(raw))
            .ok_or_else(|| format!("unknown tab '{raw}' (expected chat, generate or gallery)"))
    }
}

/// The projections that exist while one session is signed in.
pub struct Workspace {
    session: Session,
    pub chat: LiveQuery<ConversationTurn>,
    pub gallery: LiveQuery<GeneratedImageRecord>,
}

impl Workspace {
    fn open(sync: &ViewSync, session: Session) -> Self {
        let chat = sync.subscribe(
            CHATS_COLLECTION,
            session.id(),
            TIMESTAMP_FIELD,
            Direction::Ascending,
        );
        let gallery = sync.subscribe(
            IMAGES_COLLECTION,
            session.id(),
            TIMESTAMP_FIELD,
            Direction::Descending,
        );
        tracing::info!(owner_id = %session.id(), "workspace opened");
        Self {
            session,
            chat,
            gallery,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn close(mut self) {
        let released = self.chat.unsubscribe() | self.gallery.unsubscribe();
        if released {
            tracing::info!(owner_id = %self.session.id(), "workspace closed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    Unchanged,
    Opened,
    Closed,
    Switched,
}

pub struct Dashboard {
    sync: ViewSync,
    context: SessionContext,
    tab: Tab,
    workspace: Option<Workspace>,
}

impl Dashboard {
    pub fn new(sync: ViewSync) -> Self {
        Self {
            sync,
            context: SessionContext::SignedOut,
            tab: Tab::default(),
            workspace: None,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn tab(&self) -> Tab {
        self.tab
    }

    pub fn set_tab(&mut self, tab: Tab) {
        self.tab = tab;
    }

    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }

    pub fn workspace_mut(&mut self) -> Option<&mut Workspace> {
        self.workspace.as_mut()
    }

    /// Reconciles the open projections with `context`. Projections belonging to a
    /// previous session are released exactly once; the same session is a no-op.
    pub fn apply_session(&mut self, context: SessionContext) -> SessionTransition {
        let same_owner = match (&self.workspace, context.session()) {
            (Some(workspace), Some(session)) => workspace.session.id() == session.id(),
            _ => false,
        };
        if same_owner {
            self.context = context;
            return SessionTransition::Unchanged;
        }

        let closed = self.workspace.take().map(Workspace::close).is_some();
        let opened = match context.session() {
            Some(session) => {
                self.workspace = Some(Workspace::open(&self.sync, session.clone()));
                true
            }
            None => false,
        };
        self.context = context;

        match (closed, opened) {
            (false, false) => SessionTransition::Unchanged,
            (false, true) => SessionTransition::Opened,
            (true, false) => SessionTransition::Closed,
            (true, true) => SessionTransition::Switched,
        }
    }

    pub fn greeting(&self) -> Option<String> {
        self.context
            .session()
            .map(|session| format!("Welcome back, {}", session.display_label()))
    }
}
