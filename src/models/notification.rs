use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Document;

/// Closed set of notification categories produced by the forum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Reply,
    Tag,
    Points,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Reply => "reply",
            NotificationKind::Tag => "tag",
            NotificationKind::Points => "points",
            NotificationKind::System => "system",
        }
    }

    /// Short label shown next to the message in the inbox.
    pub fn label(&self) -> &'static str {
        match self {
            NotificationKind::Reply => "New reply",
            NotificationKind::Tag => "Tagged",
            NotificationKind::Points => "Points",
            NotificationKind::System => "Notice",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Field layout of a notification document as stored remotely.
/// `createdAt` is a server timestamp and may be absent until resolved.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredFields {
    user_id: String,
    #[serde(rename = "type")]
    kind: NotificationKind,
    message: String,
    #[serde(default)]
    read: bool,
    #[serde(default)]
    post_id: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Materialize a notification from a store document.
    /// A pending server timestamp is replaced by `now`.
    pub fn from_document(doc: &Document, now: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        let fields = StoredFields::deserialize(&doc.data)?;
        Ok(Self {
            id: doc.id.clone(),
            user_id: fields.user_id,
            kind: fields.kind,
            message: fields.message,
            read: fields.read,
            post_id: fields.post_id,
            created_at: fields.created_at.unwrap_or(now),
        })
    }

    /// Route the inbox links to: the related post, or `#` when there is none.
    pub fn link_target(&self) -> String {
        match &self.post_id {
            Some(post_id) => format!("/post/{}", post_id),
            None => "#".to_string(),
        }
    }

    pub fn age_label(&self, now: DateTime<Utc>) -> String {
        describe_age(self.created_at, now)
    }
}

/// Decode a snapshot, skipping documents that do not look like notifications.
pub fn decode_snapshot(docs: &[Document]) -> Vec<Notification> {
    let now = Utc::now();
    docs.iter()
        .filter_map(|doc| match Notification::from_document(doc, now) {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(doc_id = %doc.id, error = %e, "skipping malformed notification document");
                None
            }
        })
        .collect()
}

/// What a producer (reply form, tagging, points job) writes for a new notification.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub user_id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub post_id: Option<String>,
}

impl NotificationDraft {
    pub fn new(user_id: impl Into<String>, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
            message: message.into(),
            post_id: None,
        }
    }

    pub fn with_post(mut self, post_id: impl Into<String>) -> Self {
        self.post_id = Some(post_id.into());
        self
    }

    /// Document fields for this draft, unread, stamped with `created_at`.
    pub fn to_fields(&self, created_at: DateTime<Utc>) -> serde_json::Value {
        let mut fields = serde_json::json!({
            "userId": self.user_id,
            "type": self.kind,
            "message": self.message,
            "read": false,
            "createdAt": created_at,
        });
        if let Some(post_id) = &self.post_id {
            fields["postId"] = serde_json::Value::String(post_id.clone());
        }
        fields
    }
}

/// Count shown on the navbar bell; `None` hides the badge.
pub fn unread_badge(unread: usize) -> Option<String> {
    (unread > 0).then(|| unread.to_string())
}

// ── Relative time ─────────────────────────────────────────────

const MINUTES_IN_DAY: i64 = 1440;
const MINUTES_IN_MONTH: i64 = 43_200;

/// Human-readable distance between `then` and `now`, with an "ago"/"in" suffix.
pub fn describe_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = now.signed_duration_since(then);
    let seconds = delta.num_seconds();
    let distance = distance_words(seconds.abs());
    if seconds < 0 {
        format!("in {}", distance)
    } else {
        format!("{} ago", distance)
    }
}

fn distance_words(seconds: i64) -> String {
    let minutes = (seconds as f64 / 60.0).round() as i64;

    if minutes < 1 {
        return "less than a minute".to_string();
    }
    if minutes < 45 {
        return plural(minutes, "minute");
    }
    if minutes < 90 {
        return "about 1 hour".to_string();
    }
    if minutes < MINUTES_IN_DAY {
        let hours = (minutes as f64 / 60.0).round() as i64;
        return format!("about {}", plural(hours, "hour"));
    }
    if minutes < 2520 {
        return "1 day".to_string();
    }
    if minutes < MINUTES_IN_MONTH {
        let days = (minutes as f64 / MINUTES_IN_DAY as f64).round() as i64;
        return plural(days, "day");
    }
    if minutes < 2 * MINUTES_IN_MONTH {
        let months = (minutes as f64 / MINUTES_IN_MONTH as f64).round() as i64;
        return format!("about {}", plural(months, "month"));
    }

    let months = minutes / MINUTES_IN_MONTH;
    if months < 12 {
        return plural(months, "month");
    }

    let years = months / 12;
    match months % 12 {
        0..=2 => format!("about {}", plural(years, "year")),
        3..=8 => format!("over {}", plural(years, "year")),
        _ => format!("almost {}", plural(years + 1, "year")),
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}
