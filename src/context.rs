// SPDX-License-Identifier: MIT
//! Project context snapshot — a compact description of the project injected
//! into every lens prompt.
//!
//! Built from three sources: the package/workspace manifests, one level of
//! the file tree, and a README excerpt. Snapshots are cached against the
//! working-tree status hash: a matching hash reuses the cached text, any
//! other hash rebuilds. A failed build degrades to an empty string — context
//! is never worth aborting a review over.
//!
//! Total output is capped at **8,000 chars (≈ 2,000 tokens)**.

use std::path::Path;

use tokio::sync::Mutex;
use tracing::warn;

/// Hard cap: 8,000 chars ≈ 2,000 tokens (4-chars/token heuristic).
const MAX_CHARS: usize = 8_000;

/// Maximum top-level entries before truncating with "... N more files".
const MAX_ROOT_ENTRIES: usize = 50;

/// README excerpt cap.
const MAX_README_CHARS: usize = 2_000;

/// Manifest files whose presence (and name field) describe the project.
const MANIFESTS: &[&str] = &[
    "Cargo.toml",
    "package.json",
    "pyproject.toml",
    "go.mod",
    "pom.xml",
];

fn is_sensitive(name: &str) -> bool {
    let lower = name.to_lowercase();
    if lower == ".env" || lower.starts_with(".env.") || lower == "credentials.json" {
        return true;
    }
    lower.ends_with(".key") || lower.ends_with(".pem") || lower.ends_with(".secret")
}

// ─── Cache ────────────────────────────────────────────────────────────────────

/// Single-slot cache keyed by status hash.
pub struct ContextCache {
    slot: Mutex<Option<(String, String)>>,
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextCache {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Return the cached snapshot when `status_hash` matches, otherwise
    /// rebuild and replace. Never fails — build errors degrade to `""`.
    pub async fn get_or_build(&self, project_path: &Path, status_hash: &str) -> String {
        let mut slot = self.slot.lock().await;
        if let Some((hash, text)) = slot.as_ref() {
            if hash == status_hash {
                return text.clone();
            }
        }
        let text = build_snapshot(project_path).unwrap_or_else(|e| {
            warn!(err = %e, path = %project_path.display(), "context build failed — reviewing without project context");
            String::new()
        });
        *slot = Some((status_hash.to_string(), text.clone()));
        text
    }
}

// ─── Snapshot builder ─────────────────────────────────────────────────────────

fn build_snapshot(project_path: &Path) -> anyhow::Result<String> {
    let mut out = String::with_capacity(1024);

    let manifests = build_manifest_section(project_path);
    if !manifests.is_empty() {
        out.push_str("## Project\n");
        out.push_str(&manifests);
    }

    out.push_str("\n## Structure\n");
    out.push_str(&build_structure_section(project_path)?);

    let readme = build_readme_section(project_path);
    if !readme.is_empty() {
        out.push_str("\n## README\n");
        out.push_str(&readme);
    }

    // Hard cap: truncate at the last newline within the limit. The byte cap
    // may land inside a multi-byte char, so walk back to a char boundary
    // before slicing.
    if out.len() > MAX_CHARS {
        let mut cap = MAX_CHARS;
        while !out.is_char_boundary(cap) {
            cap -= 1;
        }
        let boundary = out[..cap].rfind('\n').unwrap_or(cap);
        out.truncate(boundary);
        out.push_str("\n... (truncated)");
    }

    Ok(out)
}

/// One line per recognised manifest: `Cargo.toml (name = "revd")`.
fn build_manifest_section(project_path: &Path) -> String {
    let mut out = String::new();
    for manifest in MANIFESTS {
        let path = project_path.join(manifest);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        let name = contents
            .lines()
            .find_map(|l| {
                let l = l.trim();
                l.strip_prefix("name")
                    .or_else(|| l.strip_prefix("\"name\":"))
                    .map(|rest| rest.trim_matches(&[' ', '=', ':', '"', ','][..]))
            })
            .unwrap_or("");
        if name.is_empty() {
            out.push_str(&format!("{manifest}\n"));
        } else {
            out.push_str(&format!("{manifest} (name = \"{name}\")\n"));
        }
    }
    out
}

/// One level of the directory tree, sorted, hidden and sensitive entries
/// skipped, capped at [`MAX_ROOT_ENTRIES`].
fn build_structure_section(project_path: &Path) -> anyhow::Result<String> {
    let mut entries: Vec<String> = std::fs::read_dir(project_path)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || is_sensitive(&name) {
                return None;
            }
            let is_dir = e.file_type().ok().map(|t| t.is_dir()).unwrap_or(false);
            Some(if is_dir { format!("{name}/") } else { name })
        })
        .collect();
    entries.sort_unstable();

    let total = entries.len();
    let mut out = String::new();
    for entry in entries.iter().take(MAX_ROOT_ENTRIES) {
        out.push_str(entry);
        out.push('\n');
    }
    if total > MAX_ROOT_ENTRIES {
        out.push_str(&format!("... {} more files\n", total - MAX_ROOT_ENTRIES));
    }
    Ok(out)
}

fn build_readme_section(project_path: &Path) -> String {
    for candidate in ["README.md", "README.rst", "README"] {
        if let Ok(contents) = std::fs::read_to_string(project_path.join(candidate)) {
            let mut excerpt: String = contents.chars().take(MAX_README_CHARS).collect();
            if contents.len() > MAX_README_CHARS {
                excerpt.push_str("\n... (truncated)");
            }
            return excerpt;
        }
    }
    String::new()
}

// ─── Tests ────────────────────────────────────────────────────────────────────
