//! Flat vector index persisted per `db_id`.
//!
//! Each index lives in `<index_dir>/<db_id>/index.json`:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "model": "bge-large-en-v1.5",
//!   "dims": 1024,
//!   "entries": [
//!     {"text": "...", "external_id": "SYS-REQ-7", "url": "https://...", "vector": "<base64 LE f32>"}
//!   ]
//! }
//! ```
//!
//! Search is brute-force cosine similarity over all entries. The file is
//! written to a temporary path and renamed into place, so a reader never
//! sees a partially written index.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use crate::error::{EmbeddingError, IndexError};
use crate::models::{EmbeddableChunk, Reference};

pub const INDEX_SCHEMA_VERSION: u32 = 1;
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub text: String,
    pub reference: Reference,
    pub vector: Vec<f32>,
}

/// A retrieved chunk with its cosine score.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub text: String,
    pub reference: Reference,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct FlatIndex {
    model: String,
    /// 0 until the first vector is added.
    dims: usize,
    entries: Vec<IndexEntry>,
}

#[derive(Serialize, Deserialize)]
struct StoredIndex {
    schema_version: u32,
    model: String,
    dims: usize,
    entries: Vec<StoredEntry>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    text: String,
    external_id: String,
    url: String,
    vector: String,
}

impl FlatIndex {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            dims: 0,
            entries: Vec::new(),
        }
    }

    /// Create an index from its first batch.
    pub async fn from_batch(
        embedder: &dyn Embedder,
        batch: &[EmbeddableChunk],
    ) -> Result<Self, EmbeddingError> {
        let mut index = Self::new(embedder.model_name());
        index.add_batch(embedder, batch).await?;
        Ok(index)
    }

    /// Embed a batch and append it. Nothing is appended if the call fails.
    pub async fn add_batch(
        &mut self,
        embedder: &dyn Embedder,
        batch: &[EmbeddableChunk],
    ) -> Result<usize, EmbeddingError> {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed(&texts).await?;
        if vectors.len() != batch.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                batch.len(),
                vectors.len()
            )));
        }

        let dims = if self.dims == 0 {
            vectors.first().map(Vec::len).unwrap_or(0)
        } else {
            self.dims
        };
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims || v.is_empty()) {
            return Err(EmbeddingError::InvalidResponse(format!(
                "vector has {} dimensions, index expects {}",
                bad.len(),
                dims
            )));
        }

        self.dims = dims;
        self.entries
            .extend(batch.iter().zip(vectors).map(|(chunk, vector)| IndexEntry {
                text: chunk.text.clone(),
                reference: chunk.reference.clone(),
                vector,
            }));
        Ok(batch.len())
    }

    /// Top `k` entries with cosine score `>= threshold`, best first.
    pub fn search(&self, query: &[f32], k: usize, threshold: f32) -> Vec<SearchHit> {
        let mut scored: Vec<(f32, &IndexEntry)> = self
            .entries
            .iter()
            .map(|entry| (cosine_similarity(query, &entry.vector), entry))
            .filter(|(score, _)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
            .into_iter()
            .take(k)
            .map(|(score, entry)| SearchHit {
                text: entry.text.clone(),
                reference: entry.reference.clone(),
                score,
            })
            .collect()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(INDEX_FILE)
    }

    pub fn exists(dir: &Path) -> bool {
        Self::file_path(dir).is_file()
    }

    /// Write the index into `dir`, replacing any previous version atomically.
    pub fn save(&self, dir: &Path) -> Result<(), IndexError> {
        fs::create_dir_all(dir)?;
        let stored = StoredIndex {
            schema_version: INDEX_SCHEMA_VERSION,
            model: self.model.clone(),
            dims: self.dims,
            entries: self
                .entries
                .iter()
                .map(|entry| StoredEntry {
                    text: entry.text.clone(),
                    external_id: entry.reference.external_id.clone(),
                    url: entry.reference.url.clone(),
                    vector: STANDARD.encode(vec_to_blob(&entry.vector)),
                })
                .collect(),
        };

        let path = Self::file_path(dir);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec(&stored)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, IndexError> {
        let bytes = fs::read(Self::file_path(dir))?;
        let stored: StoredIndex = serde_json::from_slice(&bytes)?;
        if stored.schema_version != INDEX_SCHEMA_VERSION {
            return Err(IndexError::UnsupportedVersion {
                found: stored.schema_version,
                expected: INDEX_SCHEMA_VERSION,
            });
        }

        let entries = stored
            .entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                let blob = STANDARD
                    .decode(entry.vector.as_bytes())
                    .map_err(|e| IndexError::Corrupt(format!("entry {i}: {e}")))?;
                if blob.len() != stored.dims * 4 {
                    return Err(IndexError::Corrupt(format!(
                        "entry {i}: {} bytes for {} dimensions",
                        blob.len(),
                        stored.dims
                    )));
                }
                Ok(IndexEntry {
                    text: entry.text,
                    reference: Reference {
                        external_id: entry.external_id,
                        url: entry.url,
                    },
                    vector: blob_to_vec(&blob),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            model: stored.model,
            dims: stored.dims,
            entries,
        })
    }
}
