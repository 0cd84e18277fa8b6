//! Provider-level tests: mock queueing, streaming parity and the settings
//! factory.

use tf_core::config::{LlmProviderKind, LlmSettings};
use tf_intelligence::llm::{
    collect_stream, complete_prompt, provider_from_settings, stream_prompt, LlmConfig, LlmError,
    LlmMessage, LlmProvider, LlmRole, MockProvider,
};

#[test]
fn llm_message_constructors() {
    assert_eq!(LlmMessage::system("s").role, LlmRole::System);
    assert_eq!(LlmMessage::user("u").role, LlmRole::User);
    assert_eq!(LlmMessage::assistant("a").role, LlmRole::Assistant);
}

#[test]
fn llm_config_from_settings() {
    let settings = LlmSettings::default();
    let cfg = LlmConfig::from_settings(&settings, "reasoner");
    assert_eq!(cfg.model, "reasoner");
    assert_eq!(cfg.max_tokens, settings.max_tokens);
    assert!(cfg.system_prompt.is_none());
}

#[tokio::test]
async fn stream_and_complete_agree() {
    let text = "```python\nprint('hi')\n```\nDone.";
    let provider = MockProvider::new().with_text(text).with_text(text);
    let cfg = LlmConfig::default();

    let full = complete_prompt(&provider, "sys", "user", &cfg).await.unwrap();
    let streamed = collect_stream(stream_prompt(&provider, "sys", "user", &cfg).await.unwrap())
        .await
        .unwrap();
    assert_eq!(full, streamed);
}

#[tokio::test]
async fn stream_error_surfaces_once() {
    let provider = MockProvider::new().with_error(LlmError::ApiError {
        status: 503,
        message: "unavailable".into(),
    });
    let result = provider
        .stream(&[LlmMessage::user("x")], &LlmConfig::default())
        .await;
    assert!(matches!(result, Err(LlmError::ApiError { status: 503, .. })));
}

#[tokio::test]
async fn shared_mock_accepts_pushes() {
    let provider = std::sync::Arc::new(MockProvider::new());
    provider.push(Err(LlmError::Timeout));
    let dyn_provider: std::sync::Arc<dyn LlmProvider> = provider.clone();
    let err = complete_prompt(dyn_provider.as_ref(), "s", "u", &LlmConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Timeout));
    assert_eq!(provider.call_count(), 1);
}

#[test]
fn factory_builds_mock_without_key() {
    let settings = LlmSettings {
        provider: LlmProviderKind::Mock,
        ..LlmSettings::default()
    };
    assert!(provider_from_settings(&settings).is_ok());
}

#[test]
fn factory_requires_key_for_hosted_providers() {
    let settings = LlmSettings {
        provider: LlmProviderKind::Anthropic,
        api_key_env: "TASKFORGE_TEST_KEY_THAT_IS_NEVER_SET".into(),
        ..LlmSettings::default()
    };
    let err = provider_from_settings(&settings).err().expect("missing key");
    assert!(matches!(err, LlmError::MissingApiKey(ref name) if name.contains("NEVER_SET")));
}

#[test]
fn factory_local_needs_no_key() {
    let settings = LlmSettings {
        provider: LlmProviderKind::Local,
        base_url: Some("http://127.0.0.1:9".into()),
        api_key_env: "TASKFORGE_TEST_KEY_THAT_IS_NEVER_SET".into(),
        ..LlmSettings::default()
    };
    assert!(provider_from_settings(&settings).is_ok());
}
