//! Core domain model, taxonomy, and pipeline event contracts for RASP.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rasp-core";

/// Sentinel for a topic/sentiment that classification has not populated yet.
pub const UNSET_LABEL: &str = "N/A";
/// Sentiment recorded when classification failed for a review.
pub const ERROR_SENTIMENT: &str = "Error";
/// Catch-all topic every industry taxonomy ends with.
pub const CATCH_ALL_TOPIC: &str = "Miscellaneous";

const GROCERY_TOPICS: &[&str] = &[
    "Delivery Experience",
    "Product Quality",
    "Product Availability",
    "Pricing & Value",
    "App Experience (UI/UX)",
    "Payments & Refunds",
    "Customer Support",
    "Offers & Discounts",
    "Order Accuracy & Packaging",
    "Miscellaneous",
];

const GAMES_TOPICS: &[&str] = &[
    "Game Experience & Variety",
    "Trust & Fair Play",
    "Winning & Payouts",
    "Payments & Withdrawals",
    "Rewards & Bonuses",
    "Account & Verification",
    "App Performance & UI",
    "Customer Support",
    "Ads & Promotions",
    "Overall Positive Experience",
    "Overall Negative Experience",
    "Miscellaneous",
];

/// Review source a record was scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewSourceKind {
    GooglePlay,
    AppStore,
}

impl ReviewSourceKind {
    /// Human-readable store name, also the value persisted in the `store` column.
    pub fn display_name(&self) -> &'static str {
        match self {
            ReviewSourceKind::GooglePlay => "Google Play",
            ReviewSourceKind::AppStore => "App Store",
        }
    }
}

impl fmt::Display for ReviewSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Industry vertical selecting which topic taxonomy applies to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Industry {
    Grocery,
    Games,
}

impl Industry {
    pub const ALL: [Industry; 2] = [Industry::Grocery, Industry::Games];

    pub fn key(&self) -> &'static str {
        match self {
            Industry::Grocery => "grocery",
            Industry::Games => "games",
        }
    }

    /// Ordered list of permitted topic labels, ending in the catch-all.
    pub fn topics(&self) -> &'static [&'static str] {
        match self {
            Industry::Grocery => GROCERY_TOPICS,
            Industry::Games => GAMES_TOPICS,
        }
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics().iter().any(|t| *t == topic)
    }
}

impl fmt::Display for Industry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Industry {
    type Err = UnknownIndustry;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Industry::ALL
            .iter()
            .copied()
            .find(|i| i.key().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownIndustry(s.trim().to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownIndustry(pub String);

impl fmt::Display for UnknownIndustry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown industry '{}', expected one of: {}",
            self.0,
            Industry::ALL
                .iter()
                .map(|i| i.key())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

impl std::error::Error for UnknownIndustry {}

/// Model-assigned sentiment for a classified review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "Positive",
            Sentiment::Negative => "Negative",
            Sentiment::Neutral => "Neutral",
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sentiment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Positive" => Ok(Sentiment::Positive),
            "Negative" => Ok(Sentiment::Negative),
            "Neutral" => Ok(Sentiment::Neutral),
            _ => Err(()),
        }
    }
}

/// One normalized app-store review. Created at scrape time with sentinel
/// `topic`/`sentiment`, mutated once by classification, then persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: String,
    pub store: ReviewSourceKind,
    pub app_id: String,
    pub username: String,
    pub posted_at: DateTime<Utc>,
    pub rating: i32,
    pub text: String,
    pub source_url: String,
    pub topic: String,
    pub sentiment: String,
}

impl ReviewRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        store: ReviewSourceKind,
        app_id: impl Into<String>,
        username: impl Into<String>,
        posted_at: DateTime<Utc>,
        rating: i32,
        text: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            app_id: app_id.into(),
            username: username.into(),
            posted_at,
            rating,
            text: text.into(),
            source_url: source_url.into(),
            topic: UNSET_LABEL.to_string(),
            sentiment: UNSET_LABEL.to_string(),
        }
    }

    /// True once classification assigned a real topic, i.e. the record is
    /// eligible for persistence.
    pub fn is_classified(&self) -> bool {
        self.topic != UNSET_LABEL
    }
}

/// Pipeline stage an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    Scrape,
    Dedup,
    Classify,
    Persist,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Scrape => "scrape",
            Stage::Dedup => "dedup",
            Stage::Classify => "classify",
            Stage::Persist => "persist",
            Stage::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// Structured progress event emitted by every pipeline stage. Replaces the
/// append-only global log buffer the surfaces used to share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub stage: Stage,
    pub level: Level,
    pub message: String,
}

impl PipelineEvent {
    pub fn info(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            level: Level::Info,
            message: message.into(),
        }
    }

    pub fn warn(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            level: Level::Warn,
            message: message.into(),
        }
    }

    pub fn error(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            level: Level::Error,
            message: message.into(),
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.level {
            Level::Info => "",
            Level::Warn => "! ",
            Level::Error => "!! ",
        };
        write!(f, "[{}] {}{}", self.stage.as_str(), marker, self.message)
    }
}

/// Sink every stage reports progress through; the presentation layer decides
/// how events are rendered.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Accumulates events in memory; backs the web live log and tests.
#[derive(Debug, Default)]
pub struct BufferSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().expect("event buffer poisoned").clone()
    }

    pub fn rendered_lines(&self) -> Vec<String> {
        self.events().iter().map(|e| e.to_string()).collect()
    }
}

impl EventSink for BufferSink {
    fn emit(&self, event: PipelineEvent) {
        self.events.lock().expect("event buffer poisoned").push(event);
    }
}
