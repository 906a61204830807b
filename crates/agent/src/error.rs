//! Controller-level failures and operator status codes.

use std::sync::Arc;
use stride::error::LlmError;
use thiserror::Error;

/// Sentinel codes handed to the status callback so downstream UIs can map
/// failures without parsing messages.
pub mod status {
    pub const ERROR_LLM_AUTHENTICATION: &str = "STATUS$ERROR_LLM_AUTHENTICATION";
    pub const ERROR_LLM_SERVICE_UNAVAILABLE: &str = "STATUS$ERROR_LLM_SERVICE_UNAVAILABLE";
    pub const ERROR_LLM_INTERNAL_SERVER_ERROR: &str = "STATUS$ERROR_LLM_INTERNAL_SERVER_ERROR";
    pub const ERROR_LLM_OUT_OF_CREDITS: &str = "STATUS$ERROR_LLM_OUT_OF_CREDITS";
    pub const LLM_RETRY: &str = "STATUS$LLM_RETRY";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Error,
}

/// `(level, code, message)`; `code` is one of the [`status`] sentinels or
/// empty.
pub type StatusCallback = Arc<dyn Fn(StatusLevel, &str, &str) + Send + Sync>;

/// Which traffic-control limit was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficLimit {
    Iteration,
    Budget,
}

impl std::fmt::Display for TrafficLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iteration => write!(f, "iteration"),
            Self::Budget => write!(f, "budget"),
        }
    }
}

pub(crate) fn traffic_control_message(
    limit: &TrafficLimit,
    current: &f64,
    max: &f64,
    headless: &bool,
) -> String {
    // Iterations render as integers, budget keeps cents.
    let (current_str, max_str) = match limit {
        TrafficLimit::Iteration => (format!("{}", *current as u64), format!("{}", *max as u64)),
        TrafficLimit::Budget => (format!("{current:.2}"), format!("{max:.2}")),
    };
    if *headless {
        format!(
            "Agent reached maximum {limit} in headless mode. Current {limit}: {current_str}, max {limit}: {max_str}"
        )
    } else {
        format!(
            "Agent reached maximum {limit}. Current {limit}: {current_str}, max {limit}: {max_str}"
        )
    }
}

/// Fatal (or pauseable-fatal) controller failures.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ControllerError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("agent got stuck in a loop")]
    StuckInLoop,

    #[error("{}", traffic_control_message(.limit, .current, .max, .headless))]
    TrafficControl {
        limit: TrafficLimit,
        current: f64,
        max: f64,
        headless: bool,
    },

    #[error("context window exceeded and history cannot be truncated")]
    ContextWindowExceeded,

    #[error("no agent registered under name: {name}")]
    UnknownAgent { name: String },

    #[error("controller must be closed before taking the trajectory")]
    NotClosed,

    #[error("{0}")]
    Internal(String),
}

impl ControllerError {
    /// Stable kind name recorded in `last_error` as `"<kind>: <message>"`.
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Llm(error) => error.class_name(),
            Self::StuckInLoop => "AgentStuckInLoopError",
            Self::TrafficControl { .. } => "RuntimeError",
            Self::ContextWindowExceeded => "ContextWindowExceededError",
            Self::UnknownAgent { .. } => "UnknownAgentError",
            Self::NotClosed => "ControllerNotClosedError",
            Self::Internal(_) => "RuntimeError",
        }
    }
}
