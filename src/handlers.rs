use crate::config::AppSettings;
use crate::file_indexer::FileIndexManager;
use crate::gitlab::GitlabApiClient;
use crate::models::{
    CommitAction, CommitActionKind, CreateCommitRequest, CreateMergeRequest, FileChange,
    GitlabIssue, GitlabMergeRequest, GitlabProject, RankedFile,
};
use crate::openai::{ChatRequestBuilder, OpenAIApiClient};
use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const EDIT_SYSTEM_PROMPT: &str = "You are a helpful programming assistant. Provide the entire file with the changes applied in response to the issue description.";

pub fn build_file_selection_prompt(issue_text: &str, candidates: &[RankedFile]) -> String {
    let file_list = candidates
        .iter()
        .map(|file| format!("- {}", file.path))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Given this issue description:\n{}\n\nAnd these available files:\n{}\n\nWhich single file is most likely to need changes? Respond with just the file path, nothing else.",
        issue_text, file_list
    )
}

pub fn build_edit_prompt(issue_text: &str, path: &str, content: &str) -> String {
    format!(
        "Based on the following codebase and issue description, provide the entire file with the changes applied.\n\nCurrent codebase:\n\nFile: {}\n```\n{}\n```\n\nIssue Description:\n{}\n\nDo not return any other text, only provide the entire file with the changes applied. Do not include code blocks (```) in your response.",
        path, content, issue_text
    )
}

/// Match the LLM's answer against the candidate paths.
///
/// Surrounding whitespace, backticks, quotes and a leading `./` are ignored.
pub fn parse_selected_path(answer: &str, candidates: &[RankedFile]) -> Option<String> {
    let first_line = answer.trim().lines().next().unwrap_or("");
    let cleaned = first_line
        .trim()
        .trim_start_matches("- ")
        .trim_matches(|c: char| c == '`' || c == '"' || c == '\'')
        .trim();
    let cleaned = cleaned.strip_prefix("./").unwrap_or(cleaned);

    candidates
        .iter()
        .find(|file| file.path == cleaned)
        .map(|file| file.path.clone())
}

/// Remove one outer code fence if the model wrapped the whole file in one.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") || !trimmed.ends_with("```") || trimmed.len() < 6 {
        return text.to_string();
    }

    let without_close = &trimmed[..trimmed.len() - 3];
    match without_close.find('\n') {
        Some(first_newline) => without_close[first_newline + 1..]
            .trim_end_matches(['\n', '\r'])
            .to_string(),
        None => text.to_string(),
    }
}

pub fn format_mr_link_note(mr: &GitlabMergeRequest) -> String {
    format!("Created merge request: {}", mr.web_url)
}

pub fn format_failure_note(error: &str) -> String {
    format!("Failed to create auto-PR:\n```\n{}\n```", error)
}

/// Turns one auto-pr issue into a merge request
pub struct IssueProcessor {
    gitlab_client: Arc<GitlabApiClient>,
    openai_client: Arc<OpenAIApiClient>,
    index_manager: Arc<FileIndexManager>,
    config: Arc<AppSettings>,
}

impl IssueProcessor {
    pub fn new(
        gitlab_client: Arc<GitlabApiClient>,
        openai_client: Arc<OpenAIApiClient>,
        index_manager: Arc<FileIndexManager>,
        config: Arc<AppSettings>,
    ) -> Self {
        Self {
            gitlab_client,
            openai_client,
            index_manager,
            config,
        }
    }

    /// Rank files, let the LLM pick and rewrite one, commit it on a new branch, open the MR and link it from the issue.
    #[instrument(skip_all, fields(project = %project.path_with_namespace, issue_iid = issue.iid))]
    pub async fn process_issue(
        &self,
        project: &GitlabProject,
        issue: &GitlabIssue,
    ) -> Result<GitlabMergeRequest> {
        info!("Processing issue #{}: {}", issue.iid, issue.title);
        let issue_text = issue.request_text();
        let base_branch = self.config.default_branch.as_str();

        let candidates = self
            .index_manager
            .rank_files(project, base_branch, &issue_text)
            .await?;
        if candidates.is_empty() {
            bail!("No relevant files found for the given issue description");
        }

        let selected_path = self.select_file(&issue_text, &candidates).await?;
        info!("Selected {} as the most relevant file", selected_path);

        let original = self
            .gitlab_client
            .get_file_content(project.id, &selected_path, base_branch)
            .await
            .with_context(|| format!("Failed to read {}", selected_path))?
            .content
            .ok_or_else(|| anyhow!("{} has no readable content", selected_path))?;

        let change = self
            .generate_change(&issue_text, &selected_path, &original)
            .await?;

        let mr = self.submit_change(project, issue, &change).await?;

        self.gitlab_client
            .post_comment_to_issue(project.id, issue.iid, &format_mr_link_note(&mr))
            .await
            .context("Failed to link merge request from issue")?;

        info!("Opened merge request !{} for issue #{}", mr.iid, issue.iid);
        Ok(mr)
    }

    async fn select_file(&self, issue_text: &str, candidates: &[RankedFile]) -> Result<String> {
        let mut builder = ChatRequestBuilder::new(&self.config);
        builder.with_user_message(&build_file_selection_prompt(issue_text, candidates));
        let request = builder.build()?;

        let answer = self
            .openai_client
            .complete(&request)
            .await
            .context("Failed to ask the LLM for the file to change")?;
        debug!("File selection answer: {:?}", answer);

        match parse_selected_path(&answer, candidates) {
            Some(path) => Ok(path),
            None => {
                let fallback = candidates[0].path.clone();
                warn!(
                    "LLM answered {:?}, which is not a candidate; using top-ranked {}",
                    answer.trim(),
                    fallback
                );
                Ok(fallback)
            }
        }
    }

    async fn generate_change(
        &self,
        issue_text: &str,
        path: &str,
        original: &str,
    ) -> Result<FileChange> {
        let mut builder = ChatRequestBuilder::new(&self.config);
        builder.with_system_message(EDIT_SYSTEM_PROMPT);
        builder.with_user_message(&build_edit_prompt(issue_text, path, original));
        let request = builder.build()?;

        let answer = self
            .openai_client
            .complete(&request)
            .await
            .context("Failed to generate the file change")?;

        let mut content = strip_code_fence(&answer);
        if original.ends_with('\n') && !content.ends_with('\n') {
            content.push('\n');
        }
        if content == original {
            bail!("The LLM returned {} unchanged", path);
        }

        Ok(FileChange {
            path: path.to_string(),
            content,
        })
    }

    async fn submit_change(
        &self,
        project: &GitlabProject,
        issue: &GitlabIssue,
        change: &FileChange,
    ) -> Result<GitlabMergeRequest> {
        let branch = self.config.branch_for_issue(issue.iid);

        let commit = CreateCommitRequest {
            branch: branch.clone(),
            start_branch: self.config.default_branch.clone(),
            commit_message: format!("Auto changes for issue #{}", issue.iid),
            actions: vec![CommitAction {
                action: CommitActionKind::Update,
                file_path: change.path.clone(),
                content: change.content.clone(),
            }],
        };
        let commit = self
            .gitlab_client
            .create_commit(project.id, &commit)
            .await
            .with_context(|| format!("Failed to commit to branch {}", branch))?;
        info!("Committed {} on {} ({})", change.path, branch, commit.short_id);

        let request = CreateMergeRequest {
            source_branch: branch,
            target_branch: self.config.default_branch.clone(),
            title: format!("Auto PR for Issue #{}", issue.iid),
            description: format!(
                "Automated changes for issue #{}\n\nModified `{}`.\n\nCloses #{}",
                issue.iid, change.path, issue.iid
            ),
            remove_source_branch: true,
        };
        self.gitlab_client
            .create_merge_request(project.id, &request)
            .await
            .context("Failed to open merge request")
    }
}
