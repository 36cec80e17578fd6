// SPDX-License-Identifier: MIT
//! Review store — one JSON document per saved review.
//!
//! Reviews land under `{data_dir}/reviews/{id}.json`, written whole via a
//! temp-file rename so a crashed write never leaves a torn document. The
//! only mutation after creation is appending drilldown records, serialized
//! through a store-wide mutex (read-modify-write on a single file; contention
//! is a human clicking, not a hot path).

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::ReviewError;
use crate::model::{DrilldownRecord, ReviewMetadata, SavedReview};

pub struct ReviewStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl ReviewStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join("reviews"),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, review_id: &str) -> Result<PathBuf, ReviewError> {
        // Ids are uuids we minted; anything path-like is not ours.
        if review_id.is_empty()
            || review_id.contains('/')
            || review_id.contains('\\')
            || review_id.contains("..")
        {
            return Err(ReviewError::ReviewNotFound(review_id.to_string()));
        }
        Ok(self.root.join(format!("{review_id}.json")))
    }

    pub async fn save(&self, review: &SavedReview) -> Result<(), ReviewError> {
        let _guard = self.write_lock.lock().await;
        self.write_document(review).await?;
        debug!(review_id = %review.metadata.id, "review saved");
        Ok(())
    }

    pub async fn get(&self, review_id: &str) -> Result<SavedReview, ReviewError> {
        let path = self.path_for(review_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReviewError::ReviewNotFound(review_id.to_string()));
            }
            Err(e) => return Err(storage_err("read review", &path, e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| ReviewError::Storage(format!("corrupt review {review_id}: {e}")))
    }

    /// All saved reviews, newest first, optionally restricted to one project.
    /// Unreadable documents are skipped with a warning rather than failing
    /// the whole listing.
    pub async fn list(
        &self,
        project_path: Option<&str>,
    ) -> Result<Vec<ReviewMetadata>, ReviewError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err("list reviews", &self.root, e)),
        };

        let mut out: Vec<ReviewMetadata> = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| storage_err("list reviews", &self.root, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let review: SavedReview = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(path = %path.display(), err = %e, "skipping unreadable review");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "skipping unreadable review");
                    continue;
                }
            };
            if let Some(project) = project_path {
                if review.metadata.project_path != project {
                    continue;
                }
            }
            out.push(review.metadata);
        }

        // created_at is RFC-3339, so the lexicographic order is chronological.
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Append one drilldown record to an existing review.
    pub async fn append_drilldown(
        &self,
        review_id: &str,
        record: DrilldownRecord,
    ) -> Result<(), ReviewError> {
        let _guard = self.write_lock.lock().await;
        let mut review = self.get(review_id).await?;
        review.drilldowns.push(record);
        self.write_document(&review).await
    }

    async fn write_document(&self, review: &SavedReview) -> Result<(), ReviewError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| storage_err("create review dir", &self.root, e))?;
        let path = self.path_for(&review.metadata.id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(review)
            .map_err(|e| ReviewError::Storage(format!("serialize review: {e}")))?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| storage_err("write review", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_err("finalize review", &path, e))
    }
}

fn storage_err(what: &str, path: &Path, e: std::io::Error) -> ReviewError {
    ReviewError::Storage(format!("{what} at {}: {e}", path.display()))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
