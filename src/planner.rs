//! Planning collaborator interface
//!
//! The pipeline never builds prompts or picks models for the initial plan;
//! that happens upstream. What it does own is the two bounded re-entry
//! points into planning (self-repair after failed verification, and the
//! single-command autofix on the agent path) plus the parsing that turns a
//! model response back into structured edits.

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::policy::ScopeMode;
use crate::util::truncate;

/// One corrective file edit proposed by the planning collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEdit {
    pub path: String,
    pub new_content: String,
    pub old_content: Option<String>,
}

/// Context for a sandboxed self-repair re-plan.
#[derive(Debug, Clone)]
pub struct RepairRequest {
    /// Human-readable summary of the original plan, when it had one.
    pub plan_summary: Option<String>,
    /// Truncated output of the failing verification phase(s).
    pub failure_log: String,
    /// Always forced to conservative by the repair loop.
    pub scope_mode: ScopeMode,
    /// Failure fingerprint carried from run provenance, if any.
    pub fingerprint: Option<String>,
}

/// Context for the agent path's single-command autofix.
#[derive(Debug, Clone)]
pub struct CommandFixRequest {
    pub command: String,
    /// Bounded tail of the failing command's output.
    pub output_tail: String,
}

/// External planning collaborator. Implementations call an LLM; tests
/// script responses.
pub trait Planner: Send + Sync {
    /// Re-plan after failed sandbox verification. Returns a new set of file
    /// edits to stage in a fresh sandbox run.
    fn repair<'a>(
        &'a self,
        request: &'a RepairRequest,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PlannedEdit>>>;

    /// Propose minimal corrective edits for one failed test command.
    fn propose_command_fix<'a>(
        &'a self,
        request: &'a CommandFixRequest,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PlannedEdit>>>;
}

#[derive(Debug, Deserialize)]
struct PlannedEditJson {
    path: String,
    new_content: String,
    #[serde(default)]
    old_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EditListJson {
    edits: Vec<PlannedEditJson>,
}

/// Strip markdown code fences from a response.
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters.
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Parse a model response into planned edits.
///
/// Accepts either a bare array of edit objects or an object with an `edits`
/// array, with or without markdown fences around the JSON.
pub fn parse_edit_response(response: &str) -> anyhow::Result<Vec<PlannedEdit>> {
    let clean = strip_markdown_fences(response);

    let parsed: Vec<PlannedEditJson> = if let Some(obj) = extract_json_fragment(clean, '{', '}') {
        match serde_json::from_str::<EditListJson>(obj) {
            Ok(list) => list.edits,
            Err(_) => parse_bare_array(clean)?,
        }
    } else {
        parse_bare_array(clean)?
    };

    if parsed.is_empty() {
        anyhow::bail!("No edits provided in response");
    }

    Ok(parsed
        .into_iter()
        .map(|e| PlannedEdit {
            path: e.path,
            new_content: e.new_content,
            old_content: e.old_content,
        })
        .collect())
}

fn parse_bare_array(clean: &str) -> anyhow::Result<Vec<PlannedEditJson>> {
    let fragment = extract_json_fragment(clean, '[', ']').unwrap_or(clean);
    serde_json::from_str(fragment).map_err(|e| {
        anyhow::anyhow!(
            "Edit response could not be parsed ({}). Response preview: {}",
            e,
            truncate(clean, 200)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_with_edits() {
        let response = r#"{"edits": [{"path": "a.rs", "new_content": "fixed", "old_content": "broken"}]}"#;
        let edits = parse_edit_response(response).unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].path, "a.rs");
        assert_eq!(edits[0].old_content.as_deref(), Some("broken"));
    }

    #[test]
    fn test_parse_fenced_array() {
        let response = "Here you go:\n```json\n[{\"path\": \"b.py\", \"new_content\": \"pass\"}]\n```";
        let edits = parse_edit_response(response).unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].path, "b.py");
        assert!(edits[0].old_content.is_none());
    }

    #[test]
    fn test_parse_rejects_empty_edit_list() {
        assert!(parse_edit_response(r#"{"edits": []}"#).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_edit_response("I could not produce a fix, sorry.").unwrap_err();
        assert!(err.to_string().contains("could not be parsed"));
    }
}
