//! Records the orchestrator reads and writes.

use crate::session::store::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// One interview over one content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub content_id: String,
    pub exchanges: Vec<Exchange>,
    pub insights: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(content_id: &str) -> Self {
        Self {
            id: new_id(),
            content_id: content_id.to_string(),
            exchanges: Vec::new(),
            insights: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn question_count(&self) -> usize {
        self.exchanges
            .iter()
            .filter(|e| e.role == ExchangeRole::Question)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeRole {
    /// Asked by the assistant.
    Question,
    /// Given by the user.
    Answer,
}

/// One turn of dialogue. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: String,
    pub role: ExchangeRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Exchange {
    pub fn new(role: ExchangeRole, text: &str) -> Self {
        Self {
            id: new_id(),
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn question(text: &str) -> Self {
        Self::new(ExchangeRole::Question, text)
    }

    pub fn answer(text: &str) -> Self {
        Self::new(ExchangeRole::Answer, text)
    }
}

/// What kind of thing the user learned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentKind {
    Book { author: Option<String> },
    Article { url: Option<String> },
    Video {
        url: Option<String>,
        creator: Option<String>,
    },
    Podcast { show: Option<String> },
    Course { provider: Option<String> },
    Note,
}

impl ContentKind {
    pub fn label(&self) -> &'static str {
        match self {
            ContentKind::Book { .. } => "book",
            ContentKind::Article { .. } => "article",
            ContentKind::Video { .. } => "video",
            ContentKind::Podcast { .. } => "podcast",
            ContentKind::Course { .. } => "course",
            ContentKind::Note => "note",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Queued,
    Learning,
    Completed,
    Archived,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Queued => "queued",
            ContentStatus::Learning => "learning",
            ContentStatus::Completed => "completed",
            ContentStatus::Archived => "archived",
        }
    }
}

/// Review state folded in from completed sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSummary {
    pub key_insights: Vec<String>,
    pub last_session_id: Option<String>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
}

/// The subject of an interview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub title: String,
    pub kind: ContentKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: ContentStatus,
    #[serde(default)]
    pub summary: ContentSummary,
}

impl ContentItem {
    pub fn new(title: &str, kind: ContentKind) -> Self {
        Self {
            id: new_id(),
            title: title.to_string(),
            kind,
            description: None,
            tags: Vec::new(),
            status: ContentStatus::Queued,
            summary: ContentSummary::default(),
        }
    }
}

/// Partial update of a `Session`. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub exchanges: Option<Vec<Exchange>>,
    pub insights: Option<Vec<String>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Partial update of a `ContentItem`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentPatch {
    pub status: Option<ContentStatus>,
    pub summary: Option<ContentSummary>,
}

impl ContentPatch {
    pub fn status(status: ContentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl Record for Session {
    type Patch = SessionPatch;
    const KIND: &'static str = "Session";

    fn id(&self) -> &str {
        &self.id
    }

    fn apply(&mut self, patch: SessionPatch) {
        if let Some(exchanges) = patch.exchanges {
            self.exchanges = exchanges;
        }
        if let Some(insights) = patch.insights {
            self.insights = insights;
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = Some(completed_at);
        }
    }
}

impl Record for ContentItem {
    type Patch = ContentPatch;
    const KIND: &'static str = "Content";

    fn id(&self) -> &str {
        &self.id
    }

    fn apply(&mut self, patch: ContentPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(summary) = patch.summary {
            self.summary = summary;
        }
    }
}
