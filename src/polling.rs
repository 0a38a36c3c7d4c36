use crate::config::AppSettings;
use crate::file_indexer::FileIndexManager;
use crate::gitlab::GitlabApiClient;
use crate::handlers::{format_failure_note, IssueProcessor};
use crate::models::{GitlabIssue, GitlabProject};
use crate::processed_cache::ProcessedIssueCache;
use anyhow::{ensure, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Issues that still need handling: not labelled complete or failed.
pub fn pending_issues(issues: Vec<GitlabIssue>, config: &AppSettings) -> Vec<GitlabIssue> {
    issues
        .into_iter()
        .filter(|issue| {
            !issue.has_label(&config.complete_label) && !issue.has_label(&config.failed_label)
        })
        .collect()
}

pub struct PollingService {
    gitlab_client: Arc<GitlabApiClient>,
    processor: IssueProcessor,
    index_manager: Arc<FileIndexManager>,
    config: Arc<AppSettings>,
    processed: ProcessedIssueCache,
}

impl PollingService {
    pub fn new(
        gitlab_client: Arc<GitlabApiClient>,
        processor: IssueProcessor,
        index_manager: Arc<FileIndexManager>,
        config: Arc<AppSettings>,
    ) -> Self {
        Self {
            gitlab_client,
            processor,
            index_manager,
            config,
            processed: ProcessedIssueCache::new(),
        }
    }

    /// Poll every configured repository each interval until `shutdown` is cancelled.
    pub async fn start_polling(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting polling service for repositories: {:?}",
            self.config.repos_to_poll
        );

        ensure!(
            self.config.poll_interval_seconds > 0,
            "poll_interval_seconds must be greater than 0"
        );
        let interval_duration = Duration::from_secs(self.config.poll_interval_seconds);
        let mut interval = time::interval(interval_duration);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping polling service");
                    break;
                }
                _ = interval.tick() => {
                    self.poll_repositories().await;
                }
            }
        }

        Ok(())
    }

    /// One poll cycle over all repositories. Returns the number of issues handled.
    pub async fn poll_repositories(&self) -> usize {
        let mut handled = 0;
        for repo_path in &self.config.repos_to_poll {
            match self.poll_repository(repo_path).await {
                Ok(count) => handled += count,
                Err(e) => error!("Error polling repository {}: {:#}", repo_path, e),
            }
        }

        if let Some(cache_path) = &self.config.embedding_cache_path {
            if let Err(e) = self.index_manager.save_cache(cache_path).await {
                warn!("Failed to save embedding cache: {:#}", e);
            }
        }

        handled
    }

    async fn poll_repository(&self, repo_path: &str) -> Result<usize> {
        debug!("Polling repository: {}", repo_path);

        let project = self.gitlab_client.get_project_by_path(repo_path).await?;
        let issues = self
            .gitlab_client
            .get_open_issues_with_label(project.id, &self.config.trigger_label)
            .await?;

        let mut handled = 0;
        for issue in pending_issues(issues, &self.config) {
            if self.processed.check(project.id, issue.iid).await {
                debug!("Issue #{} already handled in this run, skipping", issue.iid);
                continue;
            }
            self.handle_issue(&project, &issue).await;
            handled += 1;
        }

        if handled > 0 {
            info!("Handled {} issue(s) in {}", handled, repo_path);
        }
        Ok(handled)
    }

    /// Process one issue and record the outcome on it; errors never escape.
    pub async fn handle_issue(&self, project: &GitlabProject, issue: &GitlabIssue) {
        match self.processor.process_issue(project, issue).await {
            Ok(mr) => {
                info!("Issue #{} resolved with {}", issue.iid, mr.web_url);
                if let Err(e) = self
                    .gitlab_client
                    .add_issue_label(project.id, issue.iid, &self.config.complete_label)
                    .await
                {
                    error!("Failed to label issue #{} as complete: {}", issue.iid, e);
                }
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!("Error processing issue {}: {}", issue.iid, message);

                if let Err(label_err) = self
                    .gitlab_client
                    .add_issue_label(project.id, issue.iid, &self.config.failed_label)
                    .await
                {
                    error!("Failed to label issue #{} as failed: {}", issue.iid, label_err);
                }
                if let Err(note_err) = self
                    .gitlab_client
                    .post_comment_to_issue(project.id, issue.iid, &format_failure_note(&message))
                    .await
                {
                    error!("Failed to report error on issue #{}: {}", issue.iid, note_err);
                }
            }
        }

        self.processed.add(project.id, issue.iid).await;
    }
}
