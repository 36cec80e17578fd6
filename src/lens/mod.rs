// SPDX-License-Identifier: MIT
//! Lens catalogue — the independently-prompted review dimensions.
//!
//! Each lens is one AI call with its own system prompt and a shared severity
//! rubric. The executor ([`executor`]) runs one lens to completion; the
//! orchestrator fans the catalogue out under a concurrency cap.

pub mod executor;

use serde_json::json;

use crate::ai::OutputShape;

/// Severity rubric shared by every lens prompt.
const SEVERITY_RUBRIC: &str = "\
Severity rubric:
- blocker: merging this would break the build, lose data, or open a serious vulnerability
- high: a real defect likely to surface in production
- medium: a correctness or robustness concern worth fixing before merge
- low: a minor improvement; safe to defer
- nit: stylistic; mention only when the fix is trivial";

/// One review lens: a prompted perspective over the same diff.
#[derive(Debug, Clone, Copy)]
pub struct LensSpec {
    pub id: &'static str,
    pub name: &'static str,
    /// Default category stamped on issues whose AI output omitted one.
    pub category: &'static str,
    pub focus: &'static str,
}

impl LensSpec {
    pub fn system_prompt(&self) -> String {
        format!(
            "You are a senior code reviewer focused exclusively on {focus}\n\n\
             Review only the changed lines in the supplied diff. Report concrete,\n\
             evidence-backed findings; do not speculate about code you cannot see.\n\n\
             {rubric}",
            focus = self.focus,
            rubric = SEVERITY_RUBRIC,
        )
    }
}

pub const LENSES: &[LensSpec] = &[
    LensSpec {
        id: "correctness",
        name: "Correctness",
        category: "correctness",
        focus: "logic errors: wrong conditions, off-by-one bugs, unhandled edge cases, \
                broken error handling, and changes that contradict the surrounding code's intent.",
    },
    LensSpec {
        id: "security",
        name: "Security",
        category: "security",
        focus: "vulnerabilities: injection, path traversal, secrets in code, unsafe \
                deserialization, missing validation on untrusted input, and privilege mistakes.",
    },
    LensSpec {
        id: "performance",
        name: "Performance",
        category: "performance",
        focus: "performance regressions: accidental O(n\u{b2}) work, allocations or I/O in hot \
                loops, missing caching, oversized payloads, and blocking calls on async paths.",
    },
    LensSpec {
        id: "simplicity",
        name: "Simplicity",
        category: "simplicity",
        focus: "unnecessary complexity: dead code, over-abstraction, duplicated logic, \
                convoluted control flow, and APIs wider than their callers need.",
    },
    LensSpec {
        id: "tests",
        name: "Tests",
        category: "tests",
        focus: "test coverage of the change: new behavior without tests, weakened or deleted \
                assertions, tests that cannot fail, and missing edge-case coverage.",
    },
];

pub fn by_id(id: &str) -> Option<&'static LensSpec> {
    LENSES.iter().find(|l| l.id == id)
}

pub fn default_lens_ids() -> Vec<String> {
    LENSES.iter().map(|l| l.id.to_string()).collect()
}

/// The structured shape every lens call must return.
pub fn lens_output_shape() -> OutputShape {
    OutputShape {
        name: "lens_review",
        schema: json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string" },
                "issues": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "severity": { "enum": ["blocker", "high", "medium", "low", "nit"] },
                            "category": { "type": "string" },
                            "file": { "type": "string" },
                            "lineStart": { "type": "integer" },
                            "lineEnd": { "type": "integer" },
                            "rationale": { "type": "string" },
                            "recommendation": { "type": "string" },
                            "suggestedPatch": { "type": "string" },
                            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                            "evidence": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["severity", "file", "lineStart", "rationale", "recommendation"]
                    }
                }
            },
            "required": ["summary", "issues"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_has_five_lenses_with_unique_ids() {
        assert_eq!(LENSES.len(), 5);
        let mut ids: Vec<_> = LENSES.iter().map(|l| l.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn lookup_by_id() {
        assert_eq!(by_id("security").unwrap().name, "Security");
        assert!(by_id("vibes").is_none());
    }

    #[test]
    fn prompts_carry_the_rubric() {
        for lens in LENSES {
            let prompt = lens.system_prompt();
            assert!(prompt.contains("Severity rubric"), "{} missing rubric", lens.id);
            assert!(prompt.contains("blocker"));
        }
    }
}
