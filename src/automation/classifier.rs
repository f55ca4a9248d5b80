//! Maps raw automation failures to retry/escalation signals.
//!
//! Matching is keyword based on the lower-cased error name and message. Rules
//! are checked in order and the first match wins, so the more specific
//! transport and timeout cases sit ahead of the element-level ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Selector-driven DOM automation.
    Dom,
    /// Screenshot + coordinate driven automation.
    Vision,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    ConnectionLost,
    Timeout,
    ElementNotFound,
    AmbiguousMatch,
    Obstructed,
    StaleElement,
    NoEffect,
    AntiBot,
    Captcha,
    RateLimited,
    BudgetExceeded,
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureType::ConnectionLost => "connection_lost",
            FailureType::Timeout => "timeout",
            FailureType::ElementNotFound => "element_not_found",
            FailureType::AmbiguousMatch => "ambiguous_match",
            FailureType::Obstructed => "obstructed",
            FailureType::StaleElement => "stale_element",
            FailureType::NoEffect => "no_effect",
            FailureType::AntiBot => "anti_bot",
            FailureType::Captcha => "captcha",
            FailureType::RateLimited => "rate_limited",
            FailureType::BudgetExceeded => "budget_exceeded",
            FailureType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A raw failure as reported by the automation step.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionError {
    pub name: String,
    pub message: String,
}

impl ExecutionError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<&anyhow::Error> for ExecutionError {
    fn from(err: &anyhow::Error) -> Self {
        Self {
            name: String::new(),
            message: format!("{:#}", err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSignal {
    pub failure_type: FailureType,
    /// Worth retrying with the same strategy.
    pub retriable: bool,
    /// Worth retrying with the vision strategy instead.
    pub suggests_vision: bool,
    pub strategy: ExecutionStrategy,
    pub message: String,
    pub elapsed_ms: u64,
    pub classified_at: DateTime<Utc>,
}

struct Rule {
    failure_type: FailureType,
    retriable: bool,
    vision: bool,
    keywords: &'static [&'static str],
}

const RULES: &[Rule] = &[
    Rule {
        failure_type: FailureType::ConnectionLost,
        retriable: false,
        vision: false,
        keywords: &[
            "target closed",
            "connection closed",
            "connection lost",
            "connection refused",
            "connection reset",
            "session closed",
            "browser has disconnected",
            "disconnected",
            "econnreset",
            "econnrefused",
            "websocket",
        ],
    },
    Rule {
        failure_type: FailureType::Timeout,
        retriable: true,
        vision: false,
        keywords: &["timeout", "timed out", "deadline exceeded"],
    },
    Rule {
        failure_type: FailureType::ElementNotFound,
        retriable: true,
        vision: true,
        keywords: &[
            "selector not found",
            "element not found",
            "no element",
            "no node found",
            "unable to locate",
            "could not find element",
            "failed to find element",
        ],
    },
    Rule {
        failure_type: FailureType::AmbiguousMatch,
        retriable: false,
        vision: true,
        keywords: &[
            "strict mode violation",
            "multiple elements",
            "ambiguous",
            "matched more than one",
        ],
    },
    Rule {
        failure_type: FailureType::Obstructed,
        retriable: false,
        vision: true,
        keywords: &[
            "shadow root",
            "shadow dom",
            "shadowroot",
            "iframe",
            "canvas",
            "intercepts pointer events",
        ],
    },
    Rule {
        failure_type: FailureType::StaleElement,
        retriable: true,
        vision: false,
        keywords: &["stale", "detached", "not attached to the dom"],
    },
    Rule {
        failure_type: FailureType::NoEffect,
        retriable: true,
        vision: true,
        keywords: &[
            "no effect",
            "did not change",
            "value unchanged",
            "action was not applied",
        ],
    },
    Rule {
        failure_type: FailureType::AntiBot,
        retriable: false,
        vision: false,
        keywords: &[
            "bot detected",
            "bot detection",
            "automation detected",
            "access denied",
            "request blocked",
            "cloudflare",
            "perimeterx",
            "datadome",
        ],
    },
    Rule {
        failure_type: FailureType::Captcha,
        retriable: false,
        vision: false,
        keywords: &["captcha", "are you human", "verify you are human"],
    },
    Rule {
        failure_type: FailureType::RateLimited,
        retriable: true,
        vision: false,
        keywords: &["rate limit", "rate-limit", "too many requests", "429"],
    },
    Rule {
        failure_type: FailureType::BudgetExceeded,
        retriable: false,
        vision: false,
        keywords: &["budget", "cost limit", "spend limit"],
    },
];

/// Classify one failure. Pure: no I/O, no clock reads beyond stamping the result.
pub fn classify(
    error: &ExecutionError,
    strategy: ExecutionStrategy,
    elapsed_ms: u64,
) -> FailureSignal {
    classify_at(error, strategy, elapsed_ms, Utc::now())
}

pub fn classify_at(
    error: &ExecutionError,
    strategy: ExecutionStrategy,
    elapsed_ms: u64,
    at: DateTime<Utc>,
) -> FailureSignal {
    let haystack = format!("{} {}", error.name, error.message).to_lowercase();

    let (failure_type, retriable, vision) = RULES
        .iter()
        .find(|rule| rule.keywords.iter().any(|k| haystack.contains(k)))
        .map(|rule| (rule.failure_type, rule.retriable, rule.vision))
        .unwrap_or((FailureType::Unknown, true, false));

    FailureSignal {
        failure_type,
        retriable,
        // Already on vision: there is nowhere further to escalate.
        suggests_vision: vision && strategy != ExecutionStrategy::Vision,
        strategy,
        message: error.message.clone(),
        elapsed_ms,
        classified_at: at,
    }
}
