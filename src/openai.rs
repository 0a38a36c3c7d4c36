use crate::config::AppSettings;
use crate::models::{OpenAIChatMessage, OpenAIChatRequest, OpenAIChatResponse};
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tracing::{debug, error, instrument};
use url::Url;

pub const OPENAI_CHAT_COMPLETIONS_PATH: &str = "chat/completions";

#[derive(Error, Debug)]
pub enum OpenAIClient {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {body}")]
    Api { status: StatusCode, body: String },
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Failed to deserialize response: {0}")]
    Deserialization(reqwest::Error),
    #[error("LLM returned no usable content")]
    EmptyResponse,
}

#[derive(Error, Debug, PartialEq)]
pub enum BuilderError {
    #[error("A chat request needs at least one message")]
    NoMessages,
}

/// Joins the chat completions path onto a base URL that may or may not end in a slash.
pub(crate) fn endpoint_url(base: &str, path: &str) -> Result<Url, url::ParseError> {
    let mut base_url = Url::parse(base)?;
    if !base_url.path().ends_with('/') {
        let with_slash = format!("{}/", base_url.path());
        base_url.set_path(&with_slash);
    }
    base_url.join(path)
}

#[derive(Debug)]
pub struct OpenAIApiClient {
    client: Client,
    chat_completions_url: Url,
    api_key: String,
}

impl OpenAIApiClient {
    pub fn new(settings: &AppSettings) -> Result<Self, OpenAIClient> {
        let chat_completions_url =
            endpoint_url(&settings.openai_custom_url, OPENAI_CHAT_COMPLETIONS_PATH)?;
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            chat_completions_url,
            api_key: settings.openai_api_key.clone(),
        })
    }

    #[instrument(skip(self, request_payload), fields(model = %request_payload.model))]
    pub async fn send_chat_completion(
        &self,
        request_payload: &OpenAIChatRequest,
    ) -> Result<OpenAIChatResponse, OpenAIClient> {
        debug!(
            "Sending chat completion request to: {}",
            self.chat_completions_url
        );

        let response = self
            .client
            .post(self.chat_completions_url.clone())
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .json(request_payload)
            .send()
            .await
            .map_err(OpenAIClient::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
            error!("OpenAI API Error: {} - {}", status, body);
            return Err(OpenAIClient::Api { status, body });
        }

        let parsed_response = response
            .json::<OpenAIChatResponse>()
            .await
            .map_err(OpenAIClient::Deserialization)?;

        Ok(parsed_response)
    }

    /// Sends the request and returns the first choice's text.
    pub async fn complete(&self, request_payload: &OpenAIChatRequest) -> Result<String, OpenAIClient> {
        let response = self.send_chat_completion(request_payload).await?;
        if let Some(usage) = &response.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                total_tokens = usage.total_tokens,
                "Chat completion usage"
            );
        }
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(OpenAIClient::EmptyResponse)
    }
}

/// Assembles chat requests from the configured model, temperature and token mode.
pub struct ChatRequestBuilder<'a> {
    config: &'a AppSettings,
    messages: Vec<OpenAIChatMessage>,
    prefix_applied: bool,
}

impl<'a> ChatRequestBuilder<'a> {
    pub fn new(config: &'a AppSettings) -> Self {
        Self {
            config,
            messages: Vec::new(),
            prefix_applied: false,
        }
    }

    pub fn with_system_message(&mut self, content: &str) -> &mut Self {
        self.messages.push(OpenAIChatMessage {
            role: "system".to_string(),
            content: content.to_string(),
        });
        self
    }

    /// The configured prompt prefix is prepended to the first user message only.
    pub fn with_user_message(&mut self, content: &str) -> &mut Self {
        let content = match (&self.config.prompt_prefix, self.prefix_applied) {
            (Some(prefix), false) => format!("{}\n\n{}", prefix, content),
            _ => content.to_string(),
        };
        self.prefix_applied = true;
        self.messages.push(OpenAIChatMessage {
            role: "user".to_string(),
            content,
        });
        self
    }

    pub fn build(&self) -> Result<OpenAIChatRequest, BuilderError> {
        if self.messages.is_empty() {
            return Err(BuilderError::NoMessages);
        }

        let (max_tokens, max_completion_tokens) =
            if self.config.openai_token_mode == "max_completion_tokens" {
                (None, Some(self.config.openai_max_tokens))
            } else {
                (Some(self.config.openai_max_tokens), None)
            };

        Ok(OpenAIChatRequest {
            model: self.config.openai_model.clone(),
            messages: self.messages.clone(),
            temperature: Some(self.config.openai_temperature),
            max_tokens,
            max_completion_tokens,
        })
    }
}
