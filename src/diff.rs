//! Containment-splice edit application
//!
//! Applies one file edit to file content: full replace when no `old_content`
//! is given, otherwise an exact containment match spliced in place. When the
//! exact match misses, both sides are run through the deterministic
//! formatter and matched again in normalized space.
//!
//! Trade-off, kept on purpose: a normalized-space hit rewrites the entire
//! file in normalized form, which can change unrelated whitespace elsewhere
//! in the file. `Applied::normalized_rewrite` tells callers when that
//! happened. Favors apply success over format fidelity.

use thiserror::Error;

/// Result of one successful edit application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub content: String,
    /// True when the match only succeeded in normalized space and the whole
    /// file was rewritten normalized.
    pub normalized_rewrite: bool,
}

/// The target file no longer contains what the plan expected. Typically a
/// concurrent user edit between plan generation and execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("target drifted: {reason}")]
pub struct DriftConflict {
    pub reason: String,
}

impl DriftConflict {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Deterministic formatting normalization: CRLF to LF, trailing per-line
/// whitespace stripped, exactly one trailing newline on non-empty content.
/// Formatting only; never a semantic rewrite.
pub fn normalize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(text.len());
    for line in text.replace("\r\n", "\n").split('\n') {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    // split('\n') yields a final empty segment when the input ends with a
    // newline; drop the extra newline it produced.
    if text.ends_with('\n') || text.ends_with("\r\n") {
        out.pop();
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Apply one edit to file content.
///
/// `current` is None when the target file is absent from the workspace; in
/// that case the edit is always a full insert of `new_content`, whatever
/// `old_content` says.
pub fn apply(
    current: Option<&str>,
    new_content: &str,
    old_content: Option<&str>,
) -> Result<Applied, DriftConflict> {
    let Some(current) = current else {
        return Ok(Applied {
            content: normalize(new_content),
            normalized_rewrite: false,
        });
    };

    let Some(old) = old_content else {
        return Ok(Applied {
            content: normalize(new_content),
            normalized_rewrite: false,
        });
    };

    if old.is_empty() {
        if current.is_empty() {
            return Ok(Applied {
                content: normalize(new_content),
                normalized_rewrite: false,
            });
        }
        // An empty needle matches everywhere; there is no span to replace.
        return Err(DriftConflict::new(
            "old_content is empty for a non-empty file; no unique span to replace",
        ));
    }

    // Exact containment first: bytes outside the span stay untouched.
    match splice_unique(current, old, new_content) {
        SpliceResult::Applied(content) => {
            return Ok(Applied {
                content,
                normalized_rewrite: false,
            })
        }
        SpliceResult::Ambiguous(count) => {
            return Err(DriftConflict::new(format!(
                "old_content matches {} locations; a unique span is required",
                count
            )))
        }
        SpliceResult::NotFound => {}
    }

    // Retry in normalized space. A hit here rewrites the whole file
    // normalized, with the replacement applied.
    let norm_current = normalize(current);
    let norm_old = normalize(old);
    let needle = norm_old.strip_suffix('\n').unwrap_or(&norm_old);
    match splice_unique(&norm_current, needle, new_content) {
        SpliceResult::Applied(content) => Ok(Applied {
            // The whole file is rewritten in normalized form, replacement
            // included.
            content: normalize(&content),
            normalized_rewrite: true,
        }),
        SpliceResult::Ambiguous(count) => Err(DriftConflict::new(format!(
            "old_content matches {} locations after normalization; a unique span is required",
            count
        ))),
        SpliceResult::NotFound => Err(DriftConflict::new(
            "old_content not found in the current file, even after formatting normalization; \
             the file changed since the plan was generated",
        )),
    }
}

enum SpliceResult {
    Applied(String),
    Ambiguous(usize),
    NotFound,
}

fn splice_unique(haystack: &str, needle: &str, replacement: &str) -> SpliceResult {
    let count = haystack.match_indices(needle).count();
    match count {
        0 => SpliceResult::NotFound,
        1 => SpliceResult::Applied(haystack.replacen(needle, replacement, 1)),
        n => SpliceResult::Ambiguous(n),
    }
}
