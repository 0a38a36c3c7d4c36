use crate::models::{OpenAIChatMessage, OpenAIChatRequest};
use crate::openai::{
    BuilderError, ChatRequestBuilder, OpenAIApiClient, OpenAIClient, OPENAI_CHAT_COMPLETIONS_PATH,
};
use crate::tests::test_settings;
use mockito::Matcher;
use reqwest::StatusCode;
use serde_json::json;

fn settings_for(openai_url: &str) -> crate::config::AppSettings {
    test_settings("http://localhost", openai_url, "http://localhost")
}

fn hello_request() -> OpenAIChatRequest {
    OpenAIChatRequest {
        model: "test-model".to_string(),
        messages: vec![OpenAIChatMessage {
            role: "user".to_string(),
            content: "Hello".to_string(),
        }],
        temperature: Some(0.7),
        max_tokens: Some(50),
        max_completion_tokens: None,
    }
}

fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "created": 1677652288,
        "model": "test-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
    })
}

#[tokio::test]
async fn test_new_openai_api_client_invalid_url() {
    let client = OpenAIApiClient::new(&settings_for("not a valid url"));
    match client.err().unwrap() {
        OpenAIClient::UrlParse(_) => {}
        e => panic!("Expected UrlParse, got {:?}", e),
    }
}

#[tokio::test]
async fn test_send_chat_completion_success() {
    let mut server = mockito::Server::new_async().await;
    let client = OpenAIApiClient::new(&settings_for(&server.url())).unwrap();

    let mock = server
        .mock(
            "POST",
            Matcher::Exact(format!("/{}", OPENAI_CHAT_COMPLETIONS_PATH)),
        )
        .match_header("Authorization", "Bearer test_api_key")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion_body("Hi there!").to_string())
        .create_async()
        .await;

    let response = client.send_chat_completion(&hello_request()).await.unwrap();

    mock.assert_async().await;
    assert_eq!(response.choices[0].message.content, "Hi there!");
}

#[tokio::test]
async fn test_base_url_with_path_and_trailing_slash() {
    let mut server = mockito::Server::new_async().await;
    let client = OpenAIApiClient::new(&settings_for(&format!("{}/v1/", server.url()))).unwrap();

    let mock = server
        .mock(
            "POST",
            Matcher::Exact(format!("/v1/{}", OPENAI_CHAT_COMPLETIONS_PATH)),
        )
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion_body("Hi from /v1").to_string())
        .create_async()
        .await;

    let text = client.complete(&hello_request()).await.unwrap();

    mock.assert_async().await;
    assert_eq!(text, "Hi from /v1");
}

#[tokio::test]
async fn test_base_url_with_path_no_trailing_slash() {
    let mut server = mockito::Server::new_async().await;
    let client = OpenAIApiClient::new(&settings_for(&format!("{}/v1", server.url()))).unwrap();

    let mock = server
        .mock(
            "POST",
            Matcher::Exact(format!("/v1/{}", OPENAI_CHAT_COMPLETIONS_PATH)),
        )
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion_body("ok").to_string())
        .create_async()
        .await;

    assert!(client.complete(&hello_request()).await.is_ok());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_send_chat_completion_api_error() {
    let mut server = mockito::Server::new_async().await;
    let client = OpenAIApiClient::new(&settings_for(&server.url())).unwrap();
    let error_body = json!({"error": {"message": "Invalid API key", "type": "auth_error"}});

    let _m = server
        .mock("POST", Matcher::Any)
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(error_body.to_string())
        .create_async()
        .await;

    match client.send_chat_completion(&hello_request()).await.err().unwrap() {
        OpenAIClient::Api { status, body } => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, error_body.to_string());
        }
        e => panic!("Expected Api, got {:?}", e),
    }
}

#[tokio::test]
async fn test_complete_empty_choices_is_error() {
    let mut server = mockito::Server::new_async().await;
    let client = OpenAIApiClient::new(&settings_for(&server.url())).unwrap();

    let _m = server
        .mock("POST", Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "id": "chatcmpl-456", "object": "chat.completion", "created": 1677652300,
                "model": "test-model", "choices": []
            })
            .to_string(),
        )
        .create_async()
        .await;

    assert!(matches!(
        client.complete(&hello_request()).await,
        Err(OpenAIClient::EmptyResponse)
    ));
}

#[test]
fn test_builder_basic_construction() {
    let config = settings_for("https://api.openai.com/v1");
    let mut builder = ChatRequestBuilder::new(&config);
    builder.with_user_message("Hello");
    let request = builder.build().unwrap();

    assert_eq!(request.messages.len(), 1);
    assert_eq!(request.messages[0].role, "user");
    assert_eq!(request.messages[0].content, "Hello");
    assert_eq!(request.model, "gpt-3.5-turbo");
    assert_eq!(request.temperature, Some(0.7));
    assert_eq!(request.max_tokens, Some(1024));
    assert!(request.max_completion_tokens.is_none());
}

#[test]
fn test_builder_token_mode_max_completion_tokens() {
    let mut config = settings_for("https://api.openai.com/v1");
    config.openai_token_mode = "max_completion_tokens".to_string();

    let mut builder = ChatRequestBuilder::new(&config);
    builder.with_user_message("test");
    let request = builder.build().unwrap();

    assert!(request.max_tokens.is_none());
    assert_eq!(request.max_completion_tokens, Some(1024));
}

#[test]
fn test_builder_prompt_prefix_only_on_first_user_message() {
    let mut config = settings_for("https://api.openai.com/v1");
    config.prompt_prefix = Some("Follow the repository style".to_string());

    let mut builder = ChatRequestBuilder::new(&config);
    builder.with_system_message("You are a helpful programming assistant");
    builder.with_user_message("First");
    builder.with_user_message("Second");
    let request = builder.build().unwrap();

    assert_eq!(request.messages[0].role, "system");
    assert_eq!(request.messages[0].content, "You are a helpful programming assistant");
    assert!(request.messages[1].content.starts_with("Follow the repository style"));
    assert!(request.messages[1].content.ends_with("First"));
    assert_eq!(request.messages[2].content, "Second");
}

#[test]
fn test_builder_without_messages_fails() {
    let config = settings_for("https://api.openai.com/v1");
    let builder = ChatRequestBuilder::new(&config);
    assert_eq!(builder.build().unwrap_err(), BuilderError::NoMessages);
}
