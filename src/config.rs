use clap::Parser;
use std::fmt::Debug;
use std::path::PathBuf;
use url::Url;

pub const DEFAULT_MODEL_FILE: &str = "jina-embeddings-v2-small-en-q5_k_m.gguf";
pub const DEFAULT_MODEL_URL: &str = "https://huggingface.co/djuna/jina-embeddings-v2-small-en-Q5_K_M-GGUF/resolve/main/jina-embeddings-v2-small-en-q5_k_m.gguf";

#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    about = "A GitLab bot that turns auto-pr issues into merge requests"
)]
pub struct AppSettings {
    /// GitLab instance URL
    #[arg(long, env = "AUTOPR_GITLAB_URL", default_value = "https://gitlab.com")]
    pub gitlab_url: String,

    /// GitLab API token
    #[arg(long, env = "AUTOPR_GITLAB_TOKEN")]
    pub gitlab_token: String,

    /// Comma-separated list of repositories to poll (format: group/project)
    #[arg(long, env = "AUTOPR_REPOS_TO_POLL", value_delimiter = ',', required = true)]
    pub repos_to_poll: Vec<String>,

    /// Label that marks an issue for automated handling
    #[arg(long, env = "AUTOPR_TRIGGER_LABEL", default_value = "auto-pr")]
    pub trigger_label: String,

    /// Label added once a merge request was opened for an issue
    #[arg(long, env = "AUTOPR_COMPLETE_LABEL", default_value = "auto-pr-complete")]
    pub complete_label: String,

    /// Label added when handling an issue failed
    #[arg(long, env = "AUTOPR_FAILED_LABEL", default_value = "auto-pr-failed")]
    pub failed_label: String,

    /// Branch the generated changes are based on and merged into
    #[arg(long, env = "AUTOPR_DEFAULT_BRANCH", default_value = "main")]
    pub default_branch: String,

    /// Prefix of the branch created per issue; the issue iid is appended
    #[arg(long, env = "AUTOPR_BRANCH_PREFIX", default_value = "auto-pr/issue-")]
    pub branch_prefix: String,

    /// OpenAI API key
    #[arg(long, env = "AUTOPR_OPENAI_API_KEY")]
    pub openai_api_key: String,

    /// Custom OpenAI API URL (if using a proxy or alternative endpoint)
    #[arg(
        long,
        env = "AUTOPR_OPENAI_CUSTOM_URL",
        default_value = "https://api.openai.com/v1"
    )]
    pub openai_custom_url: String,

    /// OpenAI model to use
    #[arg(long, env = "AUTOPR_OPENAI_MODEL", default_value = "gpt-4o")]
    pub openai_model: String,

    /// Temperature parameter for OpenAI API (0.0 to 1.0)
    #[arg(long, env = "AUTOPR_OPENAI_TEMPERATURE", default_value_t = 0.2)]
    pub openai_temperature: f32,

    /// Maximum number of tokens to generate in the response
    #[arg(long, env = "AUTOPR_OPENAI_MAX_TOKENS", default_value_t = 4096)]
    pub openai_max_tokens: u32,

    /// Token parameter mode for OpenAI API: "max_tokens" (legacy) or "max_completion_tokens" (new)
    #[arg(long, env = "AUTOPR_OPENAI_TOKEN_MODE", default_value = "max_tokens", value_parser = validate_token_mode)]
    pub openai_token_mode: String,

    /// Optional prefix to prepend to the first user message sent to the LLM
    #[arg(long, env = "AUTOPR_PROMPT_PREFIX")]
    pub prompt_prefix: Option<String>,

    /// Base URL of an OpenAI-compatible embeddings endpoint serving the local model
    #[arg(
        long,
        env = "AUTOPR_EMBEDDING_URL",
        default_value = "http://127.0.0.1:8080/v1"
    )]
    pub embedding_url: String,

    /// Model name sent with embedding requests
    #[arg(
        long,
        env = "AUTOPR_EMBEDDING_MODEL",
        default_value = "jina-embeddings-v2-small-en"
    )]
    pub embedding_model: String,

    /// Bearer token for the embeddings endpoint, if it needs one
    #[arg(long, env = "AUTOPR_EMBEDDING_API_KEY")]
    pub embedding_api_key: Option<String>,

    /// Number of texts sent per embedding request
    #[arg(long, env = "AUTOPR_EMBEDDING_BATCH_SIZE", default_value_t = 16)]
    pub embedding_batch_size: usize,

    /// Number of leading characters of a file that get embedded
    #[arg(long, env = "AUTOPR_EMBEDDING_INPUT_CHARS", default_value_t = 500)]
    pub embedding_input_chars: usize,

    /// Optional JSON file that persists file embeddings between runs
    #[arg(long, env = "AUTOPR_EMBEDDING_CACHE_PATH")]
    pub embedding_cache_path: Option<PathBuf>,

    /// Number of top-ranked files offered to the LLM when picking the file to edit
    #[arg(long, env = "AUTOPR_MAX_CANDIDATE_FILES", default_value_t = 20)]
    pub max_candidate_files: usize,

    /// Files larger than this many bytes are not indexed
    #[arg(long, env = "AUTOPR_MAX_FILE_SIZE", default_value_t = 100_000)]
    pub max_file_size: usize,

    /// Directory holding the embedding model
    #[arg(long, env = "AUTOPR_MODEL_DIR", default_value = "models")]
    pub model_dir: PathBuf,

    /// File name of the GGUF embedding model inside the model directory
    #[arg(long, env = "AUTOPR_MODEL_FILE", default_value = DEFAULT_MODEL_FILE)]
    pub model_file: String,

    /// Where to download the embedding model from when it is missing
    #[arg(long, env = "AUTOPR_MODEL_URL", default_value = DEFAULT_MODEL_URL)]
    pub model_url: String,

    /// How often to poll for auto-pr issues (in seconds)
    #[arg(long, env = "AUTOPR_POLL_INTERVAL_SECONDS", default_value_t = 60)]
    pub poll_interval_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "AUTOPR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Run a single poll cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Download the embedding model if missing and exit
    #[arg(long)]
    pub download_model_only: bool,
}

impl AppSettings {
    /// Full path of the embedding model file
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.model_file)
    }

    /// Branch name used for the changes of one issue
    pub fn branch_for_issue(&self, issue_iid: i64) -> String {
        format!("{}{}", self.branch_prefix, issue_iid)
    }
}

/// Validate that openai_token_mode is a valid option
fn validate_token_mode(value: &str) -> Result<String, String> {
    match value {
        "max_tokens" | "max_completion_tokens" => Ok(value.to_string()),
        _ => Err(format!(
            "openai_token_mode must be either 'max_tokens' or 'max_completion_tokens', got '{}'",
            value
        )),
    }
}

fn validate_range(name: &str, value: usize, min: usize, max: usize) -> Result<usize, String> {
    if value < min {
        Err(format!("{name} must be at least {min}, got {value}"))
    } else if value > max {
        Err(format!("{name} must be at most {max}, got {value}"))
    } else {
        Ok(value)
    }
}

/// Validate that max_candidate_files is within reasonable bounds
fn validate_max_candidate_files(value: usize) -> Result<usize, String> {
    validate_range("max_candidate_files", value, 1, 100)
}

/// Validate that embedding_batch_size is within reasonable bounds
fn validate_embedding_batch_size(value: usize) -> Result<usize, String> {
    validate_range("embedding_batch_size", value, 1, 256)
}

fn validate_url(name: &str, value: &str) -> Result<(), String> {
    Url::parse(value)
        .map(|_| ())
        .map_err(|e| format!("{name} is not a valid URL ('{value}'): {e}"))
}

/// Checks the cross-field constraints clap cannot express on its own.
pub fn validate_settings(settings: &AppSettings) -> Result<(), String> {
    validate_max_candidate_files(settings.max_candidate_files)?;
    validate_embedding_batch_size(settings.embedding_batch_size)?;
    validate_url("gitlab_url", &settings.gitlab_url)?;
    validate_url("openai_custom_url", &settings.openai_custom_url)?;
    validate_url("embedding_url", &settings.embedding_url)?;
    validate_url("model_url", &settings.model_url)?;
    if settings.poll_interval_seconds == 0 {
        return Err("poll_interval_seconds must be greater than 0".to_string());
    }
    if settings.embedding_input_chars == 0 {
        return Err("embedding_input_chars must be greater than 0".to_string());
    }
    if settings.repos_to_poll.iter().all(|r| r.trim().is_empty()) {
        return Err("repos_to_poll must name at least one repository".to_string());
    }
    Ok(())
}

pub fn load_config() -> anyhow::Result<AppSettings> {
    // A missing .env is fine; variables may come from the environment directly
    let _ = dotenv::dotenv();

    let mut app_settings = AppSettings::parse();

    app_settings.repos_to_poll = app_settings
        .repos_to_poll
        .iter()
        .map(|repo| repo.trim().to_string())
        .filter(|repo| !repo.is_empty())
        .collect();

    validate_settings(&app_settings).map_err(|e| anyhow::anyhow!(e))?;

    Ok(app_settings)
}
