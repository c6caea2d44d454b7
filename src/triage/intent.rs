//! Intent classification for free-text content triggers.
//!
//! The production classifier asks an LLM; a deterministic keyword
//! heuristic is the fallback when the model errors or no key is
//! configured. Triage never raises out of classification; the router
//! catches classifier errors and falls back to the heuristic itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Decision for a piece of free text left on a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// Actionable instruction; a new run is warranted.
    Command,
    /// A question directed at humans. No run.
    Question,
    /// Chatter, acknowledgements, automation noise. No run.
    Noop,
}

impl IntentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentKind::Command => "command",
            IntentKind::Question => "question",
            IntentKind::Noop => "noop",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Intent {
    pub kind: IntentKind,
    pub confidence: f32,
}

/// The black box that turns free text into a decision.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Intent>;
}

const COMMAND_MARKERS: &[&str] = &[
    "please", "fix", "redo", "re-run", "rerun", "retry", "update", "change", "implement", "apply",
    "try again", "rebuild", "regenerate",
];

/// Deterministic keyword heuristic. A trailing question mark wins over
/// command markers so "can you fix this?" routes to a human first.
pub fn keyword_intent(text: &str) -> Intent {
    let lowered = text.trim().to_lowercase();
    if lowered.is_empty() {
        return Intent {
            kind: IntentKind::Noop,
            confidence: 1.0,
        };
    }
    if lowered.ends_with('?') {
        return Intent {
            kind: IntentKind::Question,
            confidence: 0.7,
        };
    }
    if COMMAND_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Intent {
            kind: IntentKind::Command,
            confidence: 0.6,
        };
    }
    Intent {
        kind: IntentKind::Noop,
        confidence: 0.6,
    }
}

/// Classifier usable without any API key.
pub struct KeywordClassifier;

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Intent> {
        Ok(keyword_intent(text))
    }
}

const CLASSIFIER_MODEL: &str = "claude-3-5-haiku-latest";

const PREAMBLE: &str = "You label comments left on long-lived work items. \
Reply with exactly one word: command (the comment asks for work to be \
performed on the item), question (it asks people for information), or \
noop (anything else).";

/// LLM-backed classifier.
pub struct LlmClassifier {
    agent: rig::agent::Agent<rig::providers::anthropic::completion::CompletionModel>,
}

impl LlmClassifier {
    pub fn new(client: &rig::providers::anthropic::Client) -> Self {
        use rig::client::CompletionClient;
        let agent = client.agent(CLASSIFIER_MODEL).preamble(PREAMBLE).build();
        Self { agent }
    }
}

#[async_trait]
impl IntentClassifier for LlmClassifier {
    async fn classify(&self, text: &str) -> Result<Intent> {
        use rig::completion::Prompt;
        let reply = self
            .agent
            .prompt(text)
            .await
            .map_err(|e| Error::Other(format!("intent classification failed: {e}")))?;

        let kind = match reply.trim().to_lowercase().as_str() {
            "command" => IntentKind::Command,
            "question" => IntentKind::Question,
            "noop" => IntentKind::Noop,
            other => {
                return Err(Error::Other(format!("unrecognized intent label: {other}")));
            }
        };
        Ok(Intent {
            kind,
            confidence: 0.9,
        })
    }
}
