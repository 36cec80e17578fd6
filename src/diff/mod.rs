// SPDX-License-Identifier: MIT
//! Diff model and unified-diff parser.
//!
//! Turns raw `git diff` text into a typed [`ParsedDiff`]. The parser never
//! fails on malformed input — unparseable hunks are skipped so one corrupt
//! section cannot sink an otherwise reviewable diff. Size policy (the
//! 512 KiB cap) is enforced by the pipeline using `total_stats.bytes`,
//! not here.

use serde::{Deserialize, Serialize};

// ─── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStats {
    pub additions: usize,
    pub deletions: usize,
    pub bytes: usize,
}

impl DiffStats {
    fn add(&mut self, other: &DiffStats) {
        self.additions += other.additions;
        self.deletions += other.deletions;
        self.bytes += other.bytes;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Add,
    Modify,
    Delete,
    Rename,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    #[serde(rename = "type")]
    pub kind: DiffLineKind,
    pub content: String,
    pub old_line_no: Option<u32>,
    pub new_line_no: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffLineKind {
    Context,
    Added,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffHunk {
    pub header: String,
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    /// Repository-relative path (the post-change path for renames).
    pub path: String,
    /// Pre-change path, only set for renames.
    pub previous_path: Option<String>,
    pub operation: FileOperation,
    pub hunks: Vec<DiffHunk>,
    /// The raw diff text for this file, verbatim.
    pub raw: String,
    pub stats: DiffStats,
}

/// A fully parsed diff.
///
/// Invariant: `total_stats` is always the elementwise sum of `files[].stats`.
/// Any operation that drops files must go through [`ParsedDiff::recompute_totals`]
/// (or [`filter_by_files`], which does) — never reuse a pre-filter aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedDiff {
    pub files: Vec<FileDiff>,
    pub total_stats: DiffStats,
}

impl ParsedDiff {
    pub fn empty() -> Self {
        Self {
            files: Vec::new(),
            total_stats: DiffStats::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Recompute `total_stats` from the current file set.
    pub fn recompute_totals(&mut self) {
        let mut totals = DiffStats::default();
        for f in &self.files {
            totals.add(&f.stats);
        }
        self.total_stats = totals;
    }

    /// Find a file entry by path, normalizing a leading `./` on the needle.
    pub fn file(&self, path: &str) -> Option<&FileDiff> {
        let needle = normalize(path);
        self.files.iter().find(|f| normalize(&f.path) == needle)
    }
}

// ─── Parsing ──────────────────────────────────────────────────────────────────

/// Parse raw unified-diff text. Never fails: malformed hunks are skipped,
/// an unrecognisable input yields an empty diff.
pub fn parse(raw: &str) -> ParsedDiff {
    let mut parsed = ParsedDiff::empty();
    if raw.trim().is_empty() {
        return parsed;
    }

    // Split into per-file sections on "diff --git" boundaries. Anything
    // before the first boundary (e.g. stat summaries) is ignored.
    let mut sections: Vec<(usize, usize)> = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0usize;
    for line in raw.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            if let Some(s) = start {
                sections.push((s, offset));
            }
            start = Some(offset);
        }
        offset += line.len();
    }
    if let Some(s) = start {
        sections.push((s, raw.len()));
    }

    for (s, e) in sections {
        if let Some(file) = parse_file_section(&raw[s..e]) {
            parsed.files.push(file);
        }
    }

    parsed.recompute_totals();
    parsed
}

fn parse_file_section(section: &str) -> Option<FileDiff> {
    let mut lines = section.lines().peekable();
    let header = lines.next()?;
    if !header.starts_with("diff --git ") {
        return None;
    }

    let mut operation = FileOperation::Modify;
    let mut old_path: Option<String> = None;
    let mut new_path: Option<String> = None;
    let mut rename_from: Option<String> = None;
    let mut rename_to: Option<String> = None;
    let mut hunks: Vec<DiffHunk> = Vec::new();

    // Header lines until the first hunk.
    while let Some(&line) = lines.peek() {
        if line.starts_with("@@") {
            break;
        }
        let line = lines.next()?;
        if line.starts_with("new file mode") {
            operation = FileOperation::Add;
        } else if line.starts_with("deleted file mode") {
            operation = FileOperation::Delete;
        } else if let Some(p) = line.strip_prefix("rename from ") {
            rename_from = Some(p.to_string());
            operation = FileOperation::Rename;
        } else if let Some(p) = line.strip_prefix("rename to ") {
            rename_to = Some(p.to_string());
            operation = FileOperation::Rename;
        } else if let Some(p) = line.strip_prefix("--- ") {
            old_path = strip_diff_prefix(p);
        } else if let Some(p) = line.strip_prefix("+++ ") {
            new_path = strip_diff_prefix(p);
        }
    }

    // Resolve the canonical path: prefer the post-change side.
    let path = rename_to
        .clone()
        .or(new_path)
        .or(rename_from.clone())
        .or(old_path.clone())
        .or_else(|| path_from_git_header(header))?;

    let previous_path = match operation {
        FileOperation::Rename => rename_from.or(old_path),
        _ => None,
    };

    // Hunks.
    let mut additions = 0usize;
    let mut deletions = 0usize;
    while let Some(line) = lines.next() {
        if !line.starts_with("@@") {
            continue;
        }
        let Some(mut hunk) = parse_hunk_header(line) else {
            // Malformed hunk header — skip its body until the next "@@".
            while let Some(&next) = lines.peek() {
                if next.starts_with("@@") {
                    break;
                }
                lines.next();
            }
            continue;
        };

        let mut old_no = hunk.old_start;
        let mut new_no = hunk.new_start;
        while let Some(&body) = lines.peek() {
            if body.starts_with("@@") {
                break;
            }
            let body = lines.next().unwrap_or_default();
            let (kind, content) = match body.as_bytes().first() {
                Some(b'+') => (DiffLineKind::Added, &body[1..]),
                Some(b'-') => (DiffLineKind::Removed, &body[1..]),
                Some(b' ') => (DiffLineKind::Context, &body[1..]),
                // "\ No newline at end of file" and anything else.
                _ => continue,
            };
            let (old_line_no, new_line_no) = match kind {
                DiffLineKind::Added => {
                    additions += 1;
                    let n = new_no;
                    new_no += 1;
                    (None, Some(n))
                }
                DiffLineKind::Removed => {
                    deletions += 1;
                    let n = old_no;
                    old_no += 1;
                    (Some(n), None)
                }
                DiffLineKind::Context => {
                    let pair = (Some(old_no), Some(new_no));
                    old_no += 1;
                    new_no += 1;
                    pair
                }
            };
            hunk.lines.push(DiffLine {
                kind,
                content: content.to_string(),
                old_line_no,
                new_line_no,
            });
        }
        hunks.push(hunk);
    }

    Some(FileDiff {
        path,
        previous_path,
        operation,
        hunks,
        raw: section.to_string(),
        stats: DiffStats {
            additions,
            deletions,
            bytes: section.len(),
        },
    })
}

/// Parse `@@ -old_start[,old_lines] +new_start[,new_lines] @@ ...`.
fn parse_hunk_header(line: &str) -> Option<DiffHunk> {
    let rest = line.strip_prefix("@@ ")?;
    let end = rest.find(" @@")?;
    let ranges = &rest[..end];
    let mut parts = ranges.split_whitespace();

    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    let (old_start, old_lines) = parse_range(old)?;
    let (new_start, new_lines) = parse_range(new)?;

    Some(DiffHunk {
        header: line.trim().to_string(),
        old_start,
        old_lines,
        new_start,
        new_lines,
        lines: Vec::new(),
    })
}

fn parse_range(s: &str) -> Option<(u32, u32)> {
    match s.split_once(',') {
        Some((a, b)) => Some((a.parse().ok()?, b.parse().ok()?)),
        None => Some((s.parse().ok()?, 1)),
    }
}

/// Strip the `a/` / `b/` prefix from a `---`/`+++` header path.
/// `/dev/null` (add/delete sides) yields `None`.
fn strip_diff_prefix(p: &str) -> Option<String> {
    let p = p.split('\t').next().unwrap_or(p).trim();
    if p == "/dev/null" {
        return None;
    }
    let stripped = p
        .strip_prefix("a/")
        .or_else(|| p.strip_prefix("b/"))
        .unwrap_or(p);
    Some(stripped.to_string())
}

/// Last-resort path extraction from `diff --git a/X b/Y`.
fn path_from_git_header(header: &str) -> Option<String> {
    let rest = header.strip_prefix("diff --git ")?;
    let b_side = rest.split(" b/").nth(1)?;
    Some(b_side.trim().to_string())
}

// ─── Filtering ────────────────────────────────────────────────────────────────

fn normalize(path: &str) -> &str {
    path.strip_prefix("./").unwrap_or(path)
}

/// Restrict a diff to the given paths.
///
/// An empty `paths` list returns the diff unfiltered. Matching normalizes a
/// leading `./` on both sides and nothing else. If no path matches, the
/// result has no files — the caller decides whether that means "nothing to
/// review".
pub fn filter_by_files(parsed: &ParsedDiff, paths: &[String]) -> ParsedDiff {
    if paths.is_empty() {
        return parsed.clone();
    }
    let wanted: Vec<&str> = paths.iter().map(|p| normalize(p)).collect();
    let mut out = ParsedDiff {
        files: parsed
            .files
            .iter()
            .filter(|f| wanted.contains(&normalize(&f.path)))
            .cloned()
            .collect(),
        total_stats: DiffStats::default(),
    };
    out.recompute_totals();
    out
}

// ─── Tests ────────────────────────────────────────────────────────────────────
