use crate::config::AppSettings;
use crate::models::{
    CreateCommitRequest, CreateMergeRequest, GitlabCommit, GitlabFile, GitlabIssue,
    GitlabMergeRequest, GitlabNoteAttributes, GitlabProject, GitlabTreeItem,
};
use backoff::ExponentialBackoff;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;
use urlencoding::encode;

const PER_PAGE: &str = "100";
const NEXT_PAGE_HEADER: &str = "x-next-page";

#[derive(Error, Debug)]
pub enum GitlabError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {body}")]
    Api { status: StatusCode, body: String },
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Failed to deserialize response: {0}")]
    Deserialization(reqwest::Error),
    #[error("Failed to decode file {path}: {message}")]
    Decode { path: String, message: String },
}

impl GitlabError {
    /// Whether retrying the same read might succeed
    fn is_transient(&self) -> bool {
        match self {
            GitlabError::Request(e) => e.is_timeout() || e.is_connect(),
            GitlabError::Api { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct GitlabApiClient {
    client: Client,
    gitlab_url: Url,
    settings: Arc<AppSettings>,
    retry_max_elapsed: Duration,
}

impl GitlabApiClient {
    pub fn new(settings: Arc<AppSettings>) -> Result<Self, GitlabError> {
        let gitlab_url = Url::parse(&settings.gitlab_url)?;
        let client = Client::builder()
            .user_agent(concat!("autopr/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            gitlab_url,
            settings,
            retry_max_elapsed: Duration::from_secs(30),
        })
    }

    /// Caps how long reads keep retrying transient failures
    #[cfg(test)]
    pub fn with_retry_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.retry_max_elapsed = max_elapsed;
        self
    }

    fn api_url(&self, path: &str) -> Result<Url, GitlabError> {
        let base = self.gitlab_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{}/api/v4/{}", base, path))?)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("PRIVATE-TOKEN", &self.settings.gitlab_token)
    }

    async fn check_status(response: Response) -> Result<Response, GitlabError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
        Err(GitlabError::Api { status, body })
    }

    /// Sends a GET, retrying transport errors and 5xx/429 responses with exponential backoff.
    async fn get_with_retry(
        &self,
        url: &Url,
        query: &[(&str, String)],
    ) -> Result<Response, GitlabError> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_elapsed_time: Some(self.retry_max_elapsed),
            ..ExponentialBackoff::default()
        };

        let operation = || {
            let request = self.request(Method::GET, url.clone()).query(query);
            async move {
                let response = request.send().await.map_err(GitlabError::Request);
                let result = match response {
                    Ok(response) => Self::check_status(response).await,
                    Err(e) => Err(e),
                };
                result.map_err(|e| {
                    if e.is_transient() {
                        warn!("Transient GitLab error, retrying: {}", e);
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        };

        backoff::future::retry(policy, operation).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GitlabError> {
        let url = self.api_url(path)?;
        debug!("GET {}", url);
        let response = self.get_with_retry(&url, query).await?;
        response
            .json::<T>()
            .await
            .map_err(GitlabError::Deserialization)
    }

    /// Follows GitLab's `x-next-page` header until the last page.
    async fn get_paginated<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, GitlabError> {
        let url = self.api_url(path)?;
        let mut items = Vec::new();
        let mut page = 1u32;

        loop {
            let mut page_query = query.to_vec();
            page_query.push(("per_page", PER_PAGE.to_string()));
            page_query.push(("page", page.to_string()));

            debug!("GET {} (page {})", url, page);
            let response = self.get_with_retry(&url, &page_query).await?;
            let next_page = response
                .headers()
                .get(NEXT_PAGE_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u32>().ok());

            let mut batch = response
                .json::<Vec<T>>()
                .await
                .map_err(GitlabError::Deserialization)?;
            items.append(&mut batch);

            match next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        Ok(items)
    }

    async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, GitlabError> {
        let url = self.api_url(path)?;
        debug!("{} {}", method, url);
        let response = self.request(method, url).json(body).send().await?;
        let response = Self::check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(GitlabError::Deserialization)
    }

    #[instrument(skip(self), fields(repo_path))]
    pub async fn get_project_by_path(&self, repo_path: &str) -> Result<GitlabProject, GitlabError> {
        self.get_json(&format!("projects/{}", encode(repo_path)), &[])
            .await
    }

    /// Open issues carrying `label`
    #[instrument(skip(self), fields(project_id, label))]
    pub async fn get_open_issues_with_label(
        &self,
        project_id: i64,
        label: &str,
    ) -> Result<Vec<GitlabIssue>, GitlabError> {
        let query = [
            ("state", "opened".to_string()),
            ("labels", label.to_string()),
            ("order_by", "created_at".to_string()),
            ("sort", "asc".to_string()),
        ];
        self.get_paginated(&format!("projects/{}/issues", project_id), &query)
            .await
    }

    /// Paths of all blobs in the repository at `git_ref`
    #[instrument(skip(self), fields(project_id, git_ref))]
    pub async fn get_repository_tree(
        &self,
        project_id: i64,
        git_ref: &str,
    ) -> Result<Vec<String>, GitlabError> {
        let query = [
            ("recursive", "true".to_string()),
            ("ref", git_ref.to_string()),
        ];
        let items: Vec<GitlabTreeItem> = self
            .get_paginated(&format!("projects/{}/repository/tree", project_id), &query)
            .await?;

        Ok(items
            .into_iter()
            .filter(|item| item.item_type == "blob")
            .map(|item| item.path)
            .collect())
    }

    /// Fetch a file; base64 content is decoded so `content` holds the UTF-8 text.
    #[instrument(skip(self), fields(project_id, file_path, git_ref))]
    pub async fn get_file_content(
        &self,
        project_id: i64,
        file_path: &str,
        git_ref: &str,
    ) -> Result<GitlabFile, GitlabError> {
        let mut file: GitlabFile = self
            .get_json(
                &format!(
                    "projects/{}/repository/files/{}",
                    project_id,
                    encode(file_path)
                ),
                &[("ref", git_ref.to_string())],
            )
            .await?;

        if file.encoding.as_deref() == Some("base64") {
            if let Some(encoded) = file.content.take() {
                let compact: String = encoded.split_whitespace().collect();
                let bytes = base64::decode(compact).map_err(|e| GitlabError::Decode {
                    path: file_path.to_string(),
                    message: e.to_string(),
                })?;
                let text = String::from_utf8(bytes).map_err(|e| GitlabError::Decode {
                    path: file_path.to_string(),
                    message: e.to_string(),
                })?;
                file.content = Some(text);
                file.encoding = None;
            }
        }

        Ok(file)
    }

    /// Create a commit; GitLab creates `request.branch` from `request.start_branch` if needed.
    #[instrument(skip(self, request), fields(project_id, branch = %request.branch))]
    pub async fn create_commit(
        &self,
        project_id: i64,
        request: &CreateCommitRequest,
    ) -> Result<GitlabCommit, GitlabError> {
        self.send_json(
            Method::POST,
            &format!("projects/{}/repository/commits", project_id),
            request,
        )
        .await
    }

    #[instrument(skip(self, request), fields(project_id, source_branch = %request.source_branch))]
    pub async fn create_merge_request(
        &self,
        project_id: i64,
        request: &CreateMergeRequest,
    ) -> Result<GitlabMergeRequest, GitlabError> {
        self.send_json(
            Method::POST,
            &format!("projects/{}/merge_requests", project_id),
            request,
        )
        .await
    }

    #[instrument(skip(self, comment_body), fields(project_id, issue_iid))]
    pub async fn post_comment_to_issue(
        &self,
        project_id: i64,
        issue_iid: i64,
        comment_body: &str,
    ) -> Result<GitlabNoteAttributes, GitlabError> {
        self.send_json(
            Method::POST,
            &format!("projects/{}/issues/{}/notes", project_id, issue_iid),
            &json!({ "body": comment_body }),
        )
        .await
    }

    #[instrument(skip(self), fields(project_id, issue_iid, label_name))]
    pub async fn add_issue_label(
        &self,
        project_id: i64,
        issue_iid: i64,
        label_name: &str,
    ) -> Result<GitlabIssue, GitlabError> {
        self.send_json(
            Method::PUT,
            &format!("projects/{}/issues/{}", project_id, issue_iid),
            &json!({ "add_labels": label_name }),
        )
        .await
    }
}
