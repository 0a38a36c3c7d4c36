//! Test modules for autopr
//!
//! Shared fixtures live here; tests are organized by the module they test.

use crate::config::AppSettings;
use crate::embeddings::{Embedder, EmbeddingError};
use crate::file_indexer::FileIndexManager;
use crate::gitlab::GitlabApiClient;
use crate::handlers::IssueProcessor;
use crate::openai::OpenAIApiClient;
use async_trait::async_trait;
use mockito::Matcher;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod openai_tests;

pub const TEST_TOKEN: &str = "test_token";

/// Settings pointing every remote at the given base URLs
pub fn test_settings(gitlab_url: &str, openai_url: &str, embedding_url: &str) -> AppSettings {
    AppSettings {
        gitlab_url: gitlab_url.to_string(),
        gitlab_token: TEST_TOKEN.to_string(),
        repos_to_poll: vec!["org/repo1".to_string()],
        trigger_label: "auto-pr".to_string(),
        complete_label: "auto-pr-complete".to_string(),
        failed_label: "auto-pr-failed".to_string(),
        default_branch: "main".to_string(),
        branch_prefix: "auto-pr/issue-".to_string(),
        openai_api_key: "test_api_key".to_string(),
        openai_custom_url: openai_url.to_string(),
        openai_model: "gpt-3.5-turbo".to_string(),
        openai_temperature: 0.7,
        openai_max_tokens: 1024,
        openai_token_mode: "max_tokens".to_string(),
        prompt_prefix: None,
        embedding_url: embedding_url.to_string(),
        embedding_model: "jina-test".to_string(),
        embedding_api_key: None,
        embedding_batch_size: 2,
        embedding_input_chars: 500,
        embedding_cache_path: None,
        max_candidate_files: 20,
        max_file_size: 100_000,
        model_dir: PathBuf::from("models"),
        model_file: "model.gguf".to_string(),
        model_url: "http://localhost:1/model.gguf".to_string(),
        poll_interval_seconds: 60,
        log_level: "debug".to_string(),
        once: false,
        download_model_only: false,
    }
}

pub fn issue_json(iid: i64, description: &str, labels: &[&str]) -> Value {
    json!({
        "id": iid * 10, "iid": iid, "project_id": 1, "title": format!("Issue {}", iid),
        "description": description, "state": "opened",
        "author": {"id": 1, "username": "tester", "name": "Test User", "avatar_url": null},
        "web_url": format!("http://example.com/org/repo1/-/issues/{}", iid),
        "labels": labels, "updated_at": "2024-01-02T12:00:00Z"
    })
}

pub fn project_json() -> Value {
    json!({
        "id": 1,
        "path_with_namespace": "org/repo1",
        "web_url": "https://gitlab.example.com/org/repo1",
        "default_branch": "main"
    })
}

pub fn file_json(path: &str, content: &str) -> Value {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    json!({
        "file_name": file_name,
        "file_path": path,
        "size": content.len(),
        "encoding": "base64",
        "content": base64::encode(content),
    })
}

pub fn tree_json(paths: &[&str]) -> Value {
    Value::Array(
        paths
            .iter()
            .map(|path| {
                json!({
                    "id": format!("sha-{}", path),
                    "name": path.rsplit('/').next().unwrap_or(path),
                    "type": "blob",
                    "path": path,
                    "mode": "100644"
                })
            })
            .collect(),
    )
}

pub fn commit_json(short_id: &str) -> Value {
    json!({
        "id": format!("{}0000000000000000000000000000000000", short_id),
        "short_id": short_id,
        "title": "Auto changes",
        "message": "Auto changes",
        "web_url": null
    })
}

pub fn merge_request_json(iid: i64, source_branch: &str) -> Value {
    json!({
        "id": iid + 100, "iid": iid, "project_id": 1, "title": "Auto PR",
        "description": null, "state": "opened",
        "source_branch": source_branch, "target_branch": "main",
        "web_url": format!("https://gitlab.example.com/org/repo1/-/merge_requests/{}", iid)
    })
}

pub fn note_json(body: &str) -> Value {
    json!({
        "id": 77, "body": body,
        "author": {"id": 2, "username": "autopr", "name": "Auto PR", "avatar_url": null},
        "noteable_type": "Issue", "created_at": "2024-01-02T12:00:00Z"
    })
}

/// An OpenAI chat completion whose single choice says `content`
pub fn chat_json(content: &str) -> Value {
    json!({
        "id": "chatcmpl-1", "object": "chat.completion", "created": 1700000000,
        "model": "gpt-3.5-turbo",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

/// Builds the issue pipeline against one mock server serving both GitLab and the chat API.
pub fn build_pipeline(
    settings: AppSettings,
    embedder: Arc<KeywordEmbedder>,
) -> (Arc<GitlabApiClient>, IssueProcessor, Arc<FileIndexManager>, Arc<AppSettings>) {
    let settings = Arc::new(settings);
    let gitlab = Arc::new(
        GitlabApiClient::new(settings.clone())
            .unwrap()
            .with_retry_max_elapsed(Duration::from_millis(200)),
    );
    let openai = Arc::new(OpenAIApiClient::new(&settings).unwrap());
    let index_manager = Arc::new(FileIndexManager::new(
        gitlab.clone(),
        embedder,
        settings.clone(),
    ));
    let processor = IssueProcessor::new(
        gitlab.clone(),
        openai,
        index_manager.clone(),
        settings.clone(),
    );
    (gitlab, processor, index_manager, settings)
}

/// Serves a repository with two source files plus entries that must never be indexed
pub async fn mock_repository(server: &mut mockito::ServerGuard) -> Vec<mockito::Mock> {
    let files = [
        ("src/auth.rs", "fn login() { check_auth_token() }"),
        ("src/db.rs", "fn query() { open_database() }"),
    ];

    let mut mocks = vec![
        server
            .mock("GET", "/api/v4/projects/1/repository/tree")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                tree_json(&[
                    "src/auth.rs",
                    "src/db.rs",
                    "README.md",
                    "node_modules/lib/index.js",
                ])
                .to_string(),
            )
            .create_async()
            .await,
    ];

    for (path, content) in files {
        mocks.push(
            server
                .mock(
                    "GET",
                    format!(
                        "/api/v4/projects/1/repository/files/{}",
                        urlencoding::encode(path)
                    )
                    .as_str(),
                )
                .match_query(Matcher::Any)
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(file_json(path, content).to_string())
                .create_async()
                .await,
        );
    }
    mocks
}

/// Embeds text as keyword presence, plus a constant component so no vector is all zeros.
pub struct KeywordEmbedder {
    keywords: Vec<&'static str>,
    embedded: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new(keywords: &[&'static str]) -> Self {
        Self {
            keywords: keywords.to_vec(),
            embedded: AtomicUsize::new(0),
        }
    }

    /// Total number of texts embedded so far
    pub fn embedded_count(&self) -> usize {
        self.embedded.load(Ordering::SeqCst)
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut vector: Vec<f32> = self
            .keywords
            .iter()
            .map(|keyword| if lower.contains(keyword) { 1.0 } else { 0.0 })
            .collect();
        vector.push(0.01);
        vector
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.embedded.fetch_add(inputs.len(), Ordering::SeqCst);
        Ok(inputs.iter().map(|input| self.vector_for(input)).collect())
    }
}
