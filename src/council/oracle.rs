//! The oracle tool contract and the inline `@tool` directive loop.
//!
//! Agents invoke the oracle by emitting plain-text directives of the form
//! `@tool(oracle.search, {"query": "..."})` anywhere in a reply.  The
//! convention is deliberately provider-agnostic: any model that can write
//! text can call a tool.  Directives are stripped from the displayed
//! message; results come back as separate tool-sourced transcript entries.
//!
//! The engine only specifies the contract — [`OracleTool`] — and ships a
//! backend-less default so the plumbing stays exercisable without a search
//! service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Hard cap on parallel tool calls dispatched in one iteration.
pub const MAX_TOOL_CALLS_PER_ITERATION: usize = 3;
/// Hard cap on tool-call/completion rounds within one turn.
pub const MAX_TOOL_ITERATIONS: usize = 2;
/// Default per-call timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(12);

lazy_static! {
    /// Non-greedy match of `@tool(<name>, <json-object>)`.
    static ref TOOL_DIRECTIVE: Regex =
        Regex::new(r"(?s)@tool\(\s*([A-Za-z0-9._-]+)\s*,\s*(\{.*?\})\s*\)").unwrap();
}

/// The three oracle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    Search,
    Verify,
    Cite,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::Search => "oracle.search",
            ToolName::Verify => "oracle.verify",
            ToolName::Cite => "oracle.cite",
        }
    }

    pub fn parse(name: &str) -> Option<ToolName> {
        match name {
            "oracle.search" => Some(ToolName::Search),
            "oracle.verify" => Some(ToolName::Verify),
            "oracle.cite" => Some(ToolName::Cite),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("bad arguments: {0}")]
    BadArgs(String),

    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle failed: {0}")]
    Failed(String),
}

/// External lookup facility the council can consult mid-turn.
///
/// The engine specifies the contract only; the host wires an actual
/// web-search backend.
#[async_trait]
pub trait OracleTool: Send + Sync {
    async fn search(&self, query: &str) -> Result<String, OracleError>;
    async fn verify(&self, claim: &str) -> Result<String, OracleError>;
    async fn cite(&self, topic: &str) -> Result<String, OracleError>;
}

/// Default backend that reports itself as unconfigured.
pub struct NullOracle;

#[async_trait]
impl OracleTool for NullOracle {
    async fn search(&self, _query: &str) -> Result<String, OracleError> {
        Err(OracleError::Unavailable(
            "no oracle backend configured".to_string(),
        ))
    }

    async fn verify(&self, _claim: &str) -> Result<String, OracleError> {
        Err(OracleError::Unavailable(
            "no oracle backend configured".to_string(),
        ))
    }

    async fn cite(&self, _topic: &str) -> Result<String, OracleError> {
        Err(OracleError::Unavailable(
            "no oracle backend configured".to_string(),
        ))
    }
}

/// One parsed, well-formed directive.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub name: ToolName,
    pub argument: String,
}

impl ToolInvocation {
    fn from_capture(name: &str, args_json: &str) -> Option<ToolInvocation> {
        let name = ToolName::parse(name)?;
        let args: Value = serde_json::from_str(args_json).ok()?;
        let key = match name {
            ToolName::Search => "query",
            ToolName::Verify => "claim",
            ToolName::Cite => "topic",
        };
        let argument = args.get(key)?.as_str()?.to_string();
        Some(ToolInvocation { name, argument })
    }
}

/// Extract well-formed directives from `text` and strip every directive —
/// malformed ones included — from the returned copy.
pub fn extract_directives(text: &str) -> (String, Vec<ToolInvocation>) {
    let mut invocations = Vec::new();
    for capture in TOOL_DIRECTIVE.captures_iter(text) {
        if let Some(invocation) = ToolInvocation::from_capture(&capture[1], &capture[2]) {
            invocations.push(invocation);
        }
        // Unknown names and malformed JSON are dropped silently; they are
        // still removed from the display text below.
    }
    let cleaned = TOOL_DIRECTIVE.replace_all(text, "").into_owned();
    (cleaned, invocations)
}

/// Dispatch up to [`MAX_TOOL_CALLS_PER_ITERATION`] invocations in
/// parallel, each under its own timeout.  Results come back in invocation
/// order.
pub async fn dispatch_all(
    oracle: Arc<dyn OracleTool>,
    invocations: &[ToolInvocation],
    timeout: Duration,
) -> Vec<(ToolName, Result<String, OracleError>)> {
    let bounded = &invocations[..invocations.len().min(MAX_TOOL_CALLS_PER_ITERATION)];

    let futures = bounded.iter().map(|invocation| {
        let oracle = oracle.clone();
        let name = invocation.name;
        let argument = invocation.argument.clone();
        async move {
            let call = async {
                match name {
                    ToolName::Search => oracle.search(&argument).await,
                    ToolName::Verify => oracle.verify(&argument).await,
                    ToolName::Cite => oracle.cite(&argument).await,
                }
            };
            let result = tokio::time::timeout(timeout, call)
                .await
                .unwrap_or(Err(OracleError::Timeout(timeout)));
            (name, result)
        }
    });

    futures_util::future::join_all(futures).await
}

/// Transcript rendering of one tool outcome.
pub fn render_result(name: ToolName, result: &Result<String, OracleError>) -> String {
    match result {
        Ok(text) => format!("Tool result ({}): {}", name.as_str(), text),
        Err(e) => format!("Tool result ({}): Error: {}", name.as_str(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_strips_well_formed_directives() {
        let text = r#"Let me check. @tool(oracle.search, {"query": "rust 2024 edition"}) Meanwhile..."#;
        let (cleaned, invocations) = extract_directives(text);
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].name, ToolName::Search);
        assert_eq!(invocations[0].argument, "rust 2024 edition");
        assert!(!cleaned.contains("@tool"));
        assert!(cleaned.contains("Let me check."));
        assert!(cleaned.contains("Meanwhile..."));
    }

    #[test]
    fn malformed_json_is_dropped_but_stripped() {
        let text = r#"Claim. @tool(oracle.verify, {"claim": broken}) end"#;
        let (cleaned, invocations) = extract_directives(text);
        assert!(invocations.is_empty());
        assert!(!cleaned.contains("@tool"));
    }

    #[test]
    fn unknown_tools_are_dropped_but_stripped() {
        let text = r#"@tool(oracle.summon, {"query": "x"}) rest"#;
        let (cleaned, invocations) = extract_directives(text);
        assert!(invocations.is_empty());
        assert_eq!(cleaned.trim(), "rest");
    }

    #[test]
    fn non_greedy_match_handles_multiple_directives() {
        let text = concat!(
            r#"@tool(oracle.search, {"query": "a"})"#,
            " and ",
            r#"@tool(oracle.cite, {"topic": "b"})"#,
        );
        let (_, invocations) = extract_directives(text);
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].argument, "a");
        assert_eq!(invocations[1].name, ToolName::Cite);
    }

    struct EchoOracle;

    #[async_trait]
    impl OracleTool for EchoOracle {
        async fn search(&self, query: &str) -> Result<String, OracleError> {
            Ok(format!("search:{query}"))
        }
        async fn verify(&self, claim: &str) -> Result<String, OracleError> {
            Ok(format!("verify:{claim}"))
        }
        async fn cite(&self, topic: &str) -> Result<String, OracleError> {
            Ok(format!("cite:{topic}"))
        }
    }

    struct SlowOracle;

    #[async_trait]
    impl OracleTool for SlowOracle {
        async fn search(&self, _query: &str) -> Result<String, OracleError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        }
        async fn verify(&self, claim: &str) -> Result<String, OracleError> {
            Ok(format!("verify:{claim}"))
        }
        async fn cite(&self, topic: &str) -> Result<String, OracleError> {
            Ok(format!("cite:{topic}"))
        }
    }

    #[tokio::test]
    async fn dispatch_caps_parallel_calls() {
        let invocations: Vec<ToolInvocation> = (0..5)
            .map(|i| ToolInvocation {
                name: ToolName::Search,
                argument: format!("q{i}"),
            })
            .collect();
        let results =
            dispatch_all(Arc::new(EchoOracle), &invocations, DEFAULT_TOOL_TIMEOUT).await;
        assert_eq!(results.len(), MAX_TOOL_CALLS_PER_ITERATION);
        assert_eq!(results[0].1.as_ref().unwrap(), "search:q0");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_independently() {
        let invocations = vec![
            ToolInvocation {
                name: ToolName::Search,
                argument: "will hang".to_string(),
            },
            ToolInvocation {
                name: ToolName::Cite,
                argument: "fast".to_string(),
            },
        ];
        let results =
            dispatch_all(Arc::new(SlowOracle), &invocations, Duration::from_secs(12)).await;
        assert!(matches!(
            results[0].1,
            Err(OracleError::Timeout(_))
        ));
        assert_eq!(results[1].1.as_ref().unwrap(), "cite:fast");
    }

    #[test]
    fn result_rendering_matches_transcript_contract() {
        let ok = render_result(ToolName::Search, &Ok("three hits".to_string()));
        assert_eq!(ok, "Tool result (oracle.search): three hits");
        let err = render_result(
            ToolName::Verify,
            &Err(OracleError::Unavailable("no oracle backend configured".into())),
        );
        assert!(err.starts_with("Tool result (oracle.verify): Error:"));
    }

    #[tokio::test]
    async fn null_oracle_reports_unconfigured() {
        let oracle = NullOracle;
        assert!(matches!(
            oracle.search("x").await,
            Err(OracleError::Unavailable(_))
        ));
    }
}
