use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name given to a session until the model has produced a title for it.
pub const PLACEHOLDER_SESSION_NAME: &str = "新旅行计划";

/// Older clients created sessions under this name; it is still treated as a placeholder.
const LEGACY_PLACEHOLDER_SESSION_NAME: &str = "新行程";

/// First message of every new session, shown before the user has said anything.
pub const WELCOME_MESSAGE: &str = "您好！我是您的 AI 智能旅游规划师。请告诉我您想去哪里。";

pub fn is_placeholder_name(name: &str) -> bool {
    name == PLACEHOLDER_SESSION_NAME || name == LEGACY_PLACEHOLDER_SESSION_NAME
}

// ── Sessions & messages ──────────────────────────────────────────────────────

/// Session row as listed in the sidebar; carries no messages.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn new(id: String, name: String) -> Self {
        let now = Utc::now();
        Self { id, name, created_at: now, updated_at: now }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Model,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Model => "model",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "model" | "assistant" => Ok(MessageRole::Model),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// One chat bubble. A model message carries `itinerary` only when a valid
/// block was extracted from its reply, and `text` is always the cleaned prose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub role: MessageRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub itinerary: Option<Itinerary>,
}

impl SessionMessage {
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
            itinerary: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Model, text)
    }
}

/// Working copy of a session passed explicitly through a chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub name: String,
    pub messages: Vec<SessionMessage>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: PLACEHOLDER_SESSION_NAME.to_string(),
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// A brand-new session opened by the planner's greeting.
    pub fn start(id: impl Into<String>) -> Self {
        let mut session = Self::new(id);
        session.push(SessionMessage::model(WELCOME_MESSAGE));
        session
    }

    pub fn push(&mut self, message: SessionMessage) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Replaces the message with the same id; returns false when absent.
    pub fn replace(&mut self, message: SessionMessage) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(slot) => {
                *slot = message;
                self.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}

// ── Itinerary ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Sightseeing,
    Food,
    Hotel,
    Other,
}

impl Category {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sightseeing" => Some(Category::Sightseeing),
            "food" => Some(Category::Food),
            "hotel" => Some(Category::Hotel),
            "other" => Some(Category::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub const UNRESOLVED: Coordinate = Coordinate { lat: 0.0, lng: 0.0 };

    /// Below this magnitude on both axes a pair is a placeholder, not a place.
    const SENTINEL_EPSILON: f64 = 0.1;

    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_unresolved(&self) -> bool {
        self.lat.abs() < Self::SENTINEL_EPSILON && self.lng.abs() < Self::SENTINEL_EPSILON
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItineraryPoint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
}

impl ItineraryPoint {
    #[cfg(test)]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            city: None,
            address: None,
            description: String::new(),
            lat: 0.0,
            lng: 0.0,
            day: None,
            category: None,
        }
    }

    /// Day leg the point belongs to; absent means the first day.
    pub fn day(&self) -> u32 {
        self.day.unwrap_or(1)
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }

    pub fn set_coordinate(&mut self, coordinate: Coordinate) {
        self.lat = coordinate.lat;
        self.lng = coordinate.lng;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Itinerary {
    pub points: Vec<ItineraryPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
}

impl Itinerary {
    #[cfg(test)]
    pub fn new(points: Vec<ItineraryPoint>) -> Self {
        Self { points, center: None, zoom: None }
    }

    /// Pins every point without a day to the first one.
    pub fn fill_default_days(&mut self) {
        for point in &mut self.points {
            point.day = Some(point.day());
        }
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

/// One text fragment yielded by the chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
}

impl StreamChunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

/// History entry in the shape the chat backend expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl From<&SessionMessage> for ChatTurn {
    fn from(m: &SessionMessage) -> Self {
        let role = match m.role {
            MessageRole::User => TurnRole::User,
            MessageRole::Model => TurnRole::Assistant,
        };
        Self { role, content: m.text.clone() }
    }
}

// ── Preferences ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub destination: String,
    pub origin: String,
    pub start_date: String,
    pub duration: u32,
    pub travelers: u32,
    pub budget: String,
    pub interests: Vec<String>,
    pub additional_info: String,
}

impl UserPreferences {
    /// Renders the preference block appended to the outgoing user turn.
    /// Empty when no field is filled in.
    pub fn format_context(&self) -> String {
        let mut parts = Vec::new();
        if !self.destination.is_empty() {
            parts.push(format!("目的地: {}", self.destination));
        }
        if !self.origin.is_empty() {
            parts.push(format!("出发地: {}", self.origin));
        }
        if !self.start_date.is_empty() {
            parts.push(format!("出发日期: {}", self.start_date));
        }
        if self.duration > 0 {
            parts.push(format!("行程天数: {} 天", self.duration));
        }
        if self.travelers > 0 {
            parts.push(format!("出行人数: {} 人", self.travelers));
        }
        if !self.budget.is_empty() {
            parts.push(format!("预算等级: {}", self.budget));
        }
        if !self.interests.is_empty() {
            parts.push(format!("兴趣爱好: {}", self.interests.join(", ")));
        }
        if !self.additional_info.is_empty() {
            parts.push(format!("额外备注: {}", self.additional_info));
        }

        if parts.is_empty() {
            return String::new();
        }
        format!(
            "\n\n[用户旅行偏好上下文]:\n{}\n(请参考此上下文生成行程，如果用户有新指令则优先满足新指令)",
            parts.join("\n")
        )
    }

    /// City used to scope geocoding when a point names none.
    pub fn default_city(&self) -> Option<&str> {
        let city = self.destination.trim();
        (!city.is_empty()).then_some(city)
    }
}

// ── HTTP / WebSocket payloads ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub preferences: Option<UserPreferences>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    /// Messages appended to the session by this turn.
    pub messages: Vec<SessionMessage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    StreamStart { session_id: String, user_message: SessionMessage },
    StreamSnapshot { message: SessionMessage },
    StreamEnd { message: SessionMessage },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        messages: Vec<SessionMessage>,
    },
}
