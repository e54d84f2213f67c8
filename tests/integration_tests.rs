//! Integration tests for the deepterm library.
//! These tests require an API key in the environment to run.

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use deepterm::{
        ChatConfig, ConversationController, DeepSeek, MessageRole, SessionRegistry,
        TranscriptStore, TurnState, WireMessage,
    };

    fn api_key() -> Option<String> {
        std::env::var("DEEPSEEK_API_KEY").ok()
    }

    #[tokio::test]
    async fn test_simple_chat_request() {
        // This test requires DEEPSEEK_API_KEY to be set
        let api_key = api_key();
        if api_key.is_none() {
            eprintln!("Skipping test: DEEPSEEK_API_KEY not set");
            return;
        }

        let config = ChatConfig::default().with_max_tokens(16);
        let client = DeepSeek::new(api_key, config).expect("Failed to create client");

        let messages = vec![WireMessage::new(MessageRole::User, "Say 'test passed'")];
        let response = client.send(messages).await;
        assert!(
            response.is_ok(),
            "Request should succeed with valid API key"
        );
    }

    #[tokio::test]
    async fn test_streaming_response() {
        let api_key = api_key();
        if api_key.is_none() {
            eprintln!("Skipping test: DEEPSEEK_API_KEY not set");
            return;
        }

        let config = ChatConfig::default().with_max_tokens(16);
        let client = DeepSeek::new(api_key, config).expect("Failed to create client");

        let messages = vec![WireMessage::new(MessageRole::User, "Count to 3")];
        let stream = client.stream(messages).await;
        assert!(stream.is_ok(), "Stream request should succeed");

        let mut stream = Box::pin(stream.unwrap());
        let mut saw_chunk = false;
        while let Some(chunk) = stream.next().await {
            assert!(chunk.is_ok(), "Chunks should parse");
            saw_chunk = true;
        }
        assert!(saw_chunk, "Stream should deliver at least one chunk");
    }

    #[tokio::test]
    async fn test_full_turn_through_controller() {
        let api_key = api_key();
        if api_key.is_none() {
            eprintln!("Skipping test: DEEPSEEK_API_KEY not set");
            return;
        }

        let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let config = ChatConfig::default().with_max_tokens(16);
        let backend = DeepSeek::new(api_key, config).expect("Failed to create client");
        let store = TranscriptStore::new(dir.path()).expect("Failed to open store");
        let registry = SessionRegistry::new(store).expect("Failed to build registry");
        let mut controller =
            ConversationController::new(backend, registry).expect("Failed to build controller");

        controller
            .submit("Say 'test passed'")
            .await
            .expect("Submit should succeed");
        controller
            .run_to_idle()
            .await
            .expect("Turn should complete");

        assert_eq!(controller.state(), TurnState::Idle);
        let last = controller.messages().last().expect("Reply expected");
        assert_eq!(last.role, MessageRole::Assistant);
        assert!(last.is_complete(), "Reply should be complete");
        assert!(!last.content.is_empty(), "Reply should carry text");
    }
}
