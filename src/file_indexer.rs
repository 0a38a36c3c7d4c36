use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AppSettings;
use crate::embeddings::{cosine_similarity, Embedder};
use crate::gitlab::GitlabApiClient;
use crate::models::{GitlabProject, IndexedFile, RankedFile};

/// Maximum number of files to index per project
const MAX_FILES_TO_INDEX: usize = 2000;

/// Number of file fetches in flight during a sync
const FETCH_CONCURRENCY: usize = 10;

/// File extensions to index
const INDEXABLE_EXTENSIONS: [&str; 19] = [
    "py", "js", "jsx", "ts", "tsx", "java", "cpp", "hpp", "c", "h", "cs", "go", "rb", "php",
    "swift", "kt", "tf", "toml", "rs",
];

/// Directories whose contents are never indexed
const EXCLUDED_DIRS: [&str; 7] = [
    ".git",
    "__pycache__",
    "venv",
    "node_modules",
    "build",
    "dist",
    "target",
];

/// Outcome of one index sync
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    /// Files whose content was read during the sync
    pub seen: usize,
    /// Files that were (re-)embedded
    pub updated: usize,
    /// Entries dropped because the file is gone or now too large
    pub removed: usize,
}

enum FetchOutcome {
    Read(String, String),
    Oversized(String),
    Unreadable,
}

/// Embeddings of one project's files, keyed by path
#[derive(Debug, Clone)]
pub struct FileEmbeddingIndex {
    entries: Arc<DashMap<String, IndexedFile>>,
}

impl Default for FileEmbeddingIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FileEmbeddingIndex {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Check if a file should be indexed based on its extension and directories
    pub fn should_index_file(file_path: &str) -> bool {
        let path = Path::new(file_path);
        let has_indexable_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| INDEXABLE_EXTENSIONS.contains(&ext))
            .unwrap_or(false);
        if !has_indexable_extension {
            return false;
        }

        let mut components: Vec<&str> = file_path.split('/').collect();
        components.pop();
        !components.iter().any(|dir| EXCLUDED_DIRS.contains(dir))
    }

    /// Lowercase hex SHA-256 of file content
    pub fn content_hash(content: &str) -> String {
        let digest = Sha256::digest(content.as_bytes());
        hex::encode(digest)
    }

    pub fn needs_update(&self, path: &str, content_hash: &str) -> bool {
        self.entries
            .get(path)
            .map(|entry| entry.content_hash != content_hash)
            .unwrap_or(true)
    }

    pub fn upsert(&self, file: IndexedFile) {
        self.entries.insert(file.path.clone(), file);
    }

    /// Drops every entry whose path is not in `keep`; returns how many were dropped
    pub fn retain_paths(&self, keep: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|path, _| keep.contains(path));
        before - self.entries.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<IndexedFile> {
        let mut files: Vec<IndexedFile> = self.entries.iter().map(|e| e.value().clone()).collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    /// Top `k` files by cosine similarity to `query`; ties are broken by path.
    pub fn rank(&self, query: &[f32], k: usize) -> Vec<RankedFile> {
        let mut ranked: Vec<RankedFile> = self
            .entries
            .iter()
            .map(|entry| RankedFile {
                path: entry.key().clone(),
                score: cosine_similarity(query, &entry.value().embedding),
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        ranked.truncate(k);
        ranked
    }

}

/// Keeps one embedding index per project in sync with the repository and ranks files against issue text
pub struct FileIndexManager {
    indexes: Arc<DashMap<i64, FileEmbeddingIndex>>,
    gitlab_client: Arc<GitlabApiClient>,
    embedder: Arc<dyn Embedder>,
    settings: Arc<AppSettings>,
}

impl FileIndexManager {
    pub fn new(
        gitlab_client: Arc<GitlabApiClient>,
        embedder: Arc<dyn Embedder>,
        settings: Arc<AppSettings>,
    ) -> Self {
        Self {
            indexes: Arc::new(DashMap::new()),
            gitlab_client,
            embedder,
            settings,
        }
    }

    pub fn get_or_create_index(&self, project_id: i64) -> FileEmbeddingIndex {
        self.indexes
            .entry(project_id)
            .or_default()
            .clone()
    }

    fn embedding_input(&self, content: &str) -> String {
        content
            .chars()
            .take(self.settings.embedding_input_chars)
            .collect()
    }

    /// Bring the project's index up to date with `git_ref`: embed new or changed files, drop deleted and oversized ones.
    pub async fn sync_index(&self, project: &GitlabProject, git_ref: &str) -> Result<SyncStats> {
        let project_id = project.id;
        let index = self.get_or_create_index(project_id);
        info!(
            "Syncing file index for project {} at {}",
            project.path_with_namespace, git_ref
        );

        let tree = self
            .gitlab_client
            .get_repository_tree(project_id, git_ref)
            .await
            .with_context(|| format!("Failed to list files of {}", project.path_with_namespace))?;

        let mut files_to_index: Vec<String> = tree
            .into_iter()
            .filter(|path| FileEmbeddingIndex::should_index_file(path))
            .collect();
        if files_to_index.len() > MAX_FILES_TO_INDEX {
            warn!(
                "Project {} has {} indexable files, only the first {} are indexed",
                project.path_with_namespace,
                files_to_index.len(),
                MAX_FILES_TO_INDEX
            );
            files_to_index.truncate(MAX_FILES_TO_INDEX);
        }

        debug!(
            "Found {} indexable files in project {}",
            files_to_index.len(),
            project.path_with_namespace
        );

        // Files that could not be read this time keep their previous embedding
        let mut keep: HashSet<String> = files_to_index.iter().cloned().collect();

        let max_file_size = self.settings.max_file_size;
        let fetched: Vec<FetchOutcome> = stream::iter(files_to_index)
            .map(|file_path| {
                let client = self.gitlab_client.clone();
                async move {
                    match client.get_file_content(project_id, &file_path, git_ref).await {
                        Ok(file) if file.size <= max_file_size => match file.content {
                            Some(content) => FetchOutcome::Read(file_path, content),
                            None => FetchOutcome::Unreadable,
                        },
                        Ok(_) => {
                            debug!("Skipping {}: larger than {} bytes", file_path, max_file_size);
                            FetchOutcome::Oversized(file_path)
                        }
                        Err(e) => {
                            debug!("Skipping {}: {}", file_path, e);
                            FetchOutcome::Unreadable
                        }
                    }
                }
            })
            .buffer_unordered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut seen = 0;
        let mut pending: Vec<(String, String, String)> = Vec::new();
        for outcome in fetched {
            match outcome {
                FetchOutcome::Read(path, content) => {
                    seen += 1;
                    let hash = FileEmbeddingIndex::content_hash(&content);
                    if index.needs_update(&path, &hash) {
                        pending.push((path, hash, self.embedding_input(&content)));
                    }
                }
                FetchOutcome::Oversized(path) => {
                    keep.remove(&path);
                }
                FetchOutcome::Unreadable => {}
            }
        }

        let mut updated = 0;
        for batch in pending.chunks(self.settings.embedding_batch_size) {
            let inputs: Vec<String> = batch.iter().map(|(_, _, input)| input.clone()).collect();
            let vectors = self
                .embedder
                .embed(&inputs)
                .await
                .context("Failed to embed repository files")?;

            for ((path, hash, _), embedding) in batch.iter().zip(vectors) {
                index.upsert(IndexedFile {
                    path: path.clone(),
                    content_hash: hash.clone(),
                    embedding,
                    indexed_at: Utc::now(),
                });
                updated += 1;
            }
        }

        let removed = index.retain_paths(&keep);

        let stats = SyncStats {
            seen,
            updated,
            removed,
        };
        info!(
            "Index for {} synced: {} files, {} re-embedded, {} removed",
            project.path_with_namespace, stats.seen, stats.updated, stats.removed
        );
        Ok(stats)
    }

    /// Sync the index, then rank its files against `query_text`.
    pub async fn rank_files(
        &self,
        project: &GitlabProject,
        git_ref: &str,
        query_text: &str,
    ) -> Result<Vec<RankedFile>> {
        self.sync_index(project, git_ref).await?;

        let query = self
            .embedder
            .embed(&[query_text.to_string()])
            .await
            .context("Failed to embed issue text")?
            .into_iter()
            .next()
            .context("Embedding service returned no vector for the issue text")?;

        let ranked = self
            .get_or_create_index(project.id)
            .rank(&query, self.settings.max_candidate_files);
        for file in &ranked {
            debug!("File: {}, Relevance: {:.3}", file.path, file.score);
        }
        Ok(ranked)
    }

    /// Load persisted embeddings; a missing file leaves the indexes empty.
    pub async fn load_cache(&self, path: &Path) -> Result<usize> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let cached: HashMap<i64, Vec<IndexedFile>> = match serde_json::from_str(&raw) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(
                    "Ignoring unreadable embedding cache {}: {}",
                    path.display(),
                    e
                );
                return Ok(0);
            }
        };

        let mut loaded = 0;
        for (project_id, files) in cached {
            let index = self.get_or_create_index(project_id);
            for file in files {
                index.upsert(file);
                loaded += 1;
            }
        }
        info!("Loaded {} cached embeddings from {}", loaded, path.display());
        Ok(loaded)
    }

    /// Persist all indexes; written to a sibling temp file first, then renamed.
    pub async fn save_cache(&self, path: &Path) -> Result<()> {
        let snapshot: HashMap<i64, Vec<IndexedFile>> = self
            .indexes
            .iter()
            .map(|entry| (*entry.key(), entry.value().snapshot()))
            .collect();
        let raw = serde_json::to_string(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
        tokio::fs::write(&tmp_path, raw)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}
