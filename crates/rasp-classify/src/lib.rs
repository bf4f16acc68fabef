//! LLM topic/sentiment classification for scraped reviews.
//!
//! One inference call per review. The model reply is free-form text expected
//! to contain a two-key JSON object; parsing locates the first balanced
//! object substring rather than trusting the reply to be pure JSON. Every
//! failure mode maps to a deterministic fallback, never a dropped record.

use std::time::Duration;

use async_trait::async_trait;
use rasp_core::{
    EventSink, Industry, PipelineEvent, ReviewRecord, Sentiment, Stage, CATCH_ALL_TOPIC,
    ERROR_SENTIMENT,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "rasp-classify";

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-pro-latest";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("inference request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("inference http status {status}")]
    HttpStatus { status: u16 },
    #[error("model returned an empty reply")]
    EmptyReply,
    #[error("malformed model reply: {0}")]
    Malformed(String),
}

/// Parsed two-field classification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub sentiment: Sentiment,
    pub topic: String,
}

#[async_trait]
pub trait TopicClassifier: Send + Sync {
    /// Classify one review text against the allowed topic list.
    async fn classify(
        &self,
        text: &str,
        topics: &[&'static str],
    ) -> Result<Classification, ClassifyError>;
}

/// Prompt sent for every review: enumerates the allowed topics, embeds the
/// review text, and demands a two-key JSON object.
pub fn classification_prompt(topics: &[&str], review_text: &str) -> String {
    let topic_list = topics
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Analyze the following user review. You MUST categorize this review into one of the following topics:\n\
         [{topic_list}]\n\n\
         Review text:\n\"{review_text}\"\n\n\
         Instructions:\n\
         1. Choose the single most relevant topic from the provided list.\n\
         2. If no topic is a good fit, you MUST use \"Miscellaneous\".\n\
         3. Your response MUST be a JSON object with two keys: \"sentiment\" and \"topic\".\n\
         4. The \"sentiment\" value must be one of: \"Positive\", \"Negative\", or \"Neutral\".\n\
         5. The \"topic\" value MUST be one of the topics from the list."
    )
}

/// First balanced `{…}` substring of `text`, tolerant of surrounding prose
/// and of braces inside JSON string literals.
pub fn extract_first_object(text: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let open = search_from + offset;
        if let Some(len) = balanced_object_len(&text[open..]) {
            return Some(&text[open..open + len]);
        }
        search_from = open + 1;
    }
    None
}

fn balanced_object_len(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Decode a model reply into a [`Classification`]. Missing object, undecodable
/// JSON, missing fields, unrecognized sentiment, and out-of-taxonomy topics
/// are all `Malformed`; the caller maps that to the fallback sentinels.
pub fn parse_reply(reply: &str, topics: &[&str]) -> Result<Classification, ClassifyError> {
    let object = extract_first_object(reply)
        .ok_or_else(|| ClassifyError::Malformed("no balanced JSON object in reply".into()))?;
    let value: Value = serde_json::from_str(object)
        .map_err(|e| ClassifyError::Malformed(format!("object does not decode: {e}")))?;

    let sentiment = value
        .get("sentiment")
        .and_then(Value::as_str)
        .ok_or_else(|| ClassifyError::Malformed("missing 'sentiment' field".into()))?;
    let sentiment: Sentiment = sentiment
        .parse()
        .map_err(|_| ClassifyError::Malformed(format!("unrecognized sentiment '{sentiment}'")))?;

    let topic = value
        .get("topic")
        .and_then(Value::as_str)
        .ok_or_else(|| ClassifyError::Malformed("missing 'topic' field".into()))?;
    if !topics.iter().any(|t| *t == topic) {
        return Err(ClassifyError::Malformed(format!(
            "topic '{topic}' is not in the taxonomy"
        )));
    }

    Ok(Classification {
        sentiment,
        topic: topic.to_string(),
    })
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: [RequestContent<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: [RequestPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    #[serde(default)]
    content: ResponseContent,
}

#[derive(Debug, Deserialize, Default)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

/// Gemini `generateContent` client.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(http: Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl TopicClassifier for GeminiClient {
    async fn classify(
        &self,
        text: &str,
        topics: &[&'static str],
    ) -> Result<Classification, ClassifyError> {
        let prompt = classification_prompt(topics, text);
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&GenerateRequest {
                contents: [RequestContent {
                    parts: [RequestPart { text: &prompt }],
                }],
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClassifyError::HttpStatus {
                status: response.status().as_u16(),
            });
        }
        let payload: GenerateResponse = response.json().await?;
        let reply = payload
            .candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<String>()
            })
            .unwrap_or_default();
        if reply.trim().is_empty() {
            return Err(ClassifyError::EmptyReply);
        }
        debug!(model = %self.model, reply_len = reply.len(), "inference reply received");
        parse_reply(&reply, topics)
    }
}

/// Classify one chunk of records in place. Empty-text records are passed
/// through with their sentinels intact and never sent to the model; failed
/// classifications fall back to `sentiment = "Error"`,
/// `topic = "Miscellaneous"`. A fixed `delay` separates consecutive
/// inference calls.
pub async fn annotate_chunk(
    classifier: &dyn TopicClassifier,
    records: &mut [ReviewRecord],
    industry: Industry,
    delay: Duration,
    sink: &dyn EventSink,
) {
    let total = records.len();
    sink.emit(PipelineEvent::info(
        Stage::Classify,
        format!("starting classification for a chunk of {total} reviews"),
    ));
    for (index, record) in records.iter_mut().enumerate() {
        let progress = format!("classifying review {}/{total}", index + 1);
        if record.text.trim().is_empty() {
            sink.emit(PipelineEvent::info(
                Stage::Classify,
                format!("{progress}: skipped (empty)"),
            ));
            continue;
        }

        match classifier.classify(&record.text, industry.topics()).await {
            Ok(classification) => {
                record.sentiment = classification.sentiment.to_string();
                record.topic = classification.topic;
                sink.emit(PipelineEvent::info(
                    Stage::Classify,
                    format!(
                        "{progress}: sentiment={}, topic={}",
                        record.sentiment, record.topic
                    ),
                ));
            }
            Err(err) => {
                record.sentiment = ERROR_SENTIMENT.to_string();
                record.topic = CATCH_ALL_TOPIC.to_string();
                sink.emit(PipelineEvent::warn(
                    Stage::Classify,
                    format!("{progress}: failed ({err})"),
                ));
            }
        }
        tokio::time::sleep(delay).await;
    }
}
