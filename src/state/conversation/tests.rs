use super::*;
use crate::api::{MockReply, MockTransport};
use crate::config::Config;
use crate::error::{ClientError, StoreError};
use crate::store::{ConversationStore, MemoryStore, SharedStore};
use crate::tokens::{HeuristicTokenCounter, SharedTokenCounter, TokenCounter};
use crate::types::{Message, ModelFamily, Role};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const NEW_ONLY_PROMPT: &str =
    "P<|endoftext|>\n\nUser:\n\nHi<|endoftext|>\n\nAssistant:\n\n";
const NEW_ONLY_TOKENS: usize = 28;
const WITH_PARENT_TOKENS: usize = 44;
const WITH_GRANDPARENT_TOKENS: usize = 55;

fn char_counter(family: ModelFamily) -> SharedTokenCounter {
    Arc::new(HeuristicTokenCounter::with_chars_per_token(family, 1).expect("counter"))
}

fn settings(max_model_tokens: usize, max_response_tokens: usize) -> PromptSettings {
    PromptSettings {
        family: ModelFamily::Plain,
        max_model_tokens,
        max_response_tokens,
        user_label: "User".to_string(),
        assistant_label: "Assistant".to_string(),
    }
}

fn assembler(
    max_model_tokens: usize,
    max_response_tokens: usize,
    store: Arc<MemoryStore>,
) -> PromptAssembler {
    PromptAssembler::new(
        settings(max_model_tokens, max_response_tokens),
        char_counter(ModelFamily::Plain),
        store,
    )
    .expect("assembler")
}

/// m1 (user "a") <- m2 (assistant "b")
async fn two_turn_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .put(Message::user("m1", "c1", None, "a"))
        .await
        .expect("put");
    store
        .put(Message::assistant("m2", "c1", Some("m1".to_string()), "b"))
        .await
        .expect("put");
    store
}

fn test_config() -> Config {
    Config {
        api_url: "http://localhost:8000/v1/completions".to_string(),
        model: "text-davinci-003".to_string(),
        max_model_tokens: 1000,
        max_response_tokens: 100,
        temperature: None,
        top_p: None,
        presence_penalty: None,
        prompt_prefix: Some("P".to_string()),
        ..Config::default()
    }
}

fn manager_with(
    config: &Config,
    transport: &MockTransport,
) -> (ConversationManager, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let manager = ConversationManager::with_parts(
        config,
        Arc::new(transport.clone()),
        store.clone(),
        char_counter(ModelFamily::from_model_name(&config.model)),
    )
    .expect("manager");
    (manager, store)
}

fn buffered_reply(text: &str) -> MockReply {
    MockReply::Json(json!({"id": "cmpl-1", "choices": [{"text": text, "index": 0}]}))
}

// Prompt assembly

#[tokio::test]
async fn test_new_message_without_parent_has_no_history() {
    let store = Arc::new(MemoryStore::new());
    let budget = assembler(1000, 100, store)
        .build_prompt("Hi", None, Some("P"), None)
        .await
        .expect("prompt");

    assert_eq!(budget.prompt, NEW_ONLY_PROMPT);
    assert_eq!(budget.prompt_tokens, NEW_ONLY_TOKENS);
    assert_eq!(budget.max_tokens, 100);
    assert_eq!(budget.history_turns, 0);
}

#[tokio::test]
async fn test_unknown_parent_stops_walk_without_error() {
    let store = Arc::new(MemoryStore::new());
    let budget = assembler(1000, 100, store)
        .build_prompt("Hi", Some("missing"), Some("P"), None)
        .await
        .expect("prompt");

    assert_eq!(budget.prompt, NEW_ONLY_PROMPT);
    assert_eq!(budget.history_turns, 0);
}

#[tokio::test]
async fn test_full_chain_is_included_when_it_fits() {
    let store = two_turn_store().await;
    let budget = assembler(1000, 100, store)
        .build_prompt("Hi", Some("m2"), Some("P"), None)
        .await
        .expect("prompt");

    assert_eq!(
        budget.prompt,
        "P<|endoftext|>\n\nUser:\n\na<|endoftext|>\n\nAssistant:\n\nb<|endoftext|>\n\nUser:\n\nHi<|endoftext|>\n\nAssistant:\n\n"
    );
    assert_eq!(budget.prompt_tokens, WITH_GRANDPARENT_TOKENS);
    assert_eq!(budget.history_turns, 2);
}

#[tokio::test]
async fn test_exact_budget_is_accepted_and_next_ancestor_dropped() {
    let store = two_turn_store().await;
    let response = 10;
    let budget = assembler(WITH_PARENT_TOKENS + response, response, store)
        .build_prompt("Hi", Some("m2"), Some("P"), None)
        .await
        .expect("prompt");

    assert_eq!(budget.prompt_tokens, WITH_PARENT_TOKENS);
    assert_eq!(budget.history_turns, 1);
    assert!(budget.prompt.contains("Assistant:\n\nb<|endoftext|>"));
    assert!(!budget.prompt.contains("User:\n\na<|endoftext|>"));
    assert_eq!(budget.max_tokens, response);
}

#[tokio::test]
async fn test_walk_halts_at_first_overflowing_ancestor() {
    let store = two_turn_store().await;
    // m2 alone overflows; m1 would never be reached even though the walk
    // could otherwise skip to it.
    let budget = assembler(WITH_PARENT_TOKENS - 1 + 10, 10, store)
        .build_prompt("Hi", Some("m2"), Some("P"), None)
        .await
        .expect("prompt");

    assert_eq!(budget.prompt, NEW_ONLY_PROMPT);
    assert_eq!(budget.history_turns, 0);
}

#[tokio::test]
async fn test_newest_message_over_budget_is_still_sent() {
    // Kept as-is: an oversized newest message is accepted rather than rejected.
    let store = two_turn_store().await;
    let budget = assembler(20, 10, store)
        .build_prompt("Hi", Some("m2"), Some("P"), None)
        .await
        .expect("prompt");

    assert_eq!(budget.prompt, NEW_ONLY_PROMPT);
    assert!(budget.prompt_tokens > 10);
    assert_eq!(budget.max_tokens, 1);
}

#[tokio::test]
async fn test_max_tokens_stays_within_response_budget() {
    let store = two_turn_store().await;
    for max_model_tokens in [30, 40, 44, 50, 54, 60, 80, 200, 5000] {
        for max_response_tokens in [1, 5, 10, 25] {
            if max_response_tokens >= max_model_tokens {
                continue;
            }
            let budget = assembler(max_model_tokens, max_response_tokens, store.clone())
                .build_prompt("Hi", Some("m2"), Some("P"), None)
                .await
                .expect("prompt");

            assert!(budget.max_tokens >= 1);
            assert!(budget.max_tokens <= max_response_tokens);
            if budget.history_turns > 0 {
                assert!(budget.prompt_tokens <= max_model_tokens - max_response_tokens);
            }
        }
    }
}

#[tokio::test]
async fn test_history_grows_monotonically_with_budget() {
    let store = two_turn_store().await;
    let mut previous_turns = 0;
    let mut previous_prompt = String::new();
    for context in NEW_ONLY_TOKENS..=WITH_GRANDPARENT_TOKENS + 5 {
        let budget = assembler(context + 10, 10, store.clone())
            .build_prompt("Hi", Some("m2"), Some("P"), None)
            .await
            .expect("prompt");
        assert!(budget.history_turns >= previous_turns);
        if budget.history_turns > previous_turns {
            let previous_body = previous_prompt
                .trim_start_matches("P<|endoftext|>\n\n")
                .to_string();
            assert!(budget.prompt.ends_with(&previous_body));
        }
        previous_turns = budget.history_turns;
        previous_prompt = budget.prompt;
    }
    assert_eq!(previous_turns, 2);
}

#[tokio::test]
async fn test_cyclic_parent_chain_terminates_by_budget() {
    let store = Arc::new(MemoryStore::new());
    store
        .put(Message::user("x", "c1", Some("y".to_string()), "ping"))
        .await
        .expect("put");
    store
        .put(Message::assistant("y", "c1", Some("x".to_string()), "pong"))
        .await
        .expect("put");

    let budget = assembler(310, 10, store)
        .build_prompt("Hi", Some("y"), Some("P"), None)
        .await
        .expect("prompt");

    assert!(budget.prompt_tokens <= 300);
    assert!(budget.history_turns > 2);
}

#[test]
fn test_context_budget_must_be_positive() {
    let store = Arc::new(MemoryStore::new());
    let result = PromptAssembler::new(settings(100, 100), char_counter(ModelFamily::Plain), store);
    assert!(matches!(result, Err(ClientError::Configuration(_))));

    let store = Arc::new(MemoryStore::new());
    let result = PromptAssembler::new(settings(100, 0), char_counter(ModelFamily::Plain), store);
    assert!(matches!(result, Err(ClientError::Configuration(_))));
}

#[test]
fn test_default_prefix_names_persona_and_date() {
    let store = Arc::new(MemoryStore::new());
    let assembler = assembler(1000, 100, store);
    let date = NaiveDate::from_ymd_opt(2023, 2, 1).expect("date");

    assert_eq!(
        assembler.default_prompt_prefix(date),
        "Instructions:\nYou are Assistant, a large language model. Respond conversationally.\nCurrent date: 2023-02-01<|endoftext|>\n\n"
    );
    assert_eq!(assembler.default_prompt_suffix(), "\n\nAssistant:\n\n");
}

#[test]
fn test_custom_prefix_gets_single_separator() {
    let store = Arc::new(MemoryStore::new());
    let assembler = assembler(1000, 100, store);

    assert_eq!(assembler.custom_prompt_prefix("  Be brief. "), "Be brief.<|endoftext|>\n\n");
    assert_eq!(
        assembler.custom_prompt_prefix("Be brief.<|endoftext|>"),
        "Be brief.<|endoftext|>\n\n"
    );
}

#[tokio::test]
async fn test_chat_family_uses_chat_delimiters() {
    let store = Arc::new(MemoryStore::new());
    let mut chat_settings = settings(1000, 100);
    chat_settings.family = ModelFamily::Chat;
    let assembler =
        PromptAssembler::new(chat_settings, char_counter(ModelFamily::Chat), store).expect("assembler");

    let budget = assembler
        .build_prompt("Hi", None, Some("P"), None)
        .await
        .expect("prompt");

    assert_eq!(
        budget.prompt,
        "P<|im_sep|>\n\nUser:\n\nHi<|im_end|>\n\nAssistant:\n\n"
    );
    // Chat delimiters are counted as their canonical token.
    assert_eq!(budget.prompt_tokens, NEW_ONLY_TOKENS);
}

struct FlakyStore {
    error: fn(&str) -> StoreError,
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn get(&self, id: &str) -> Result<Option<Message>, StoreError> {
        Err((self.error)(id))
    }

    async fn put(&self, _message: Message) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_store_timeout_is_treated_as_missing_parent() {
    let store: SharedStore = Arc::new(FlakyStore {
        error: |id| StoreError::Timeout(id.to_string()),
    });
    let assembler =
        PromptAssembler::new(settings(1000, 100), char_counter(ModelFamily::Plain), store)
            .expect("assembler");

    let budget = assembler
        .build_prompt("Hi", Some("m2"), Some("P"), None)
        .await
        .expect("prompt");
    assert_eq!(budget.prompt, NEW_ONLY_PROMPT);
}

#[tokio::test]
async fn test_store_backend_failure_is_fatal() {
    let store: SharedStore = Arc::new(FlakyStore {
        error: |_| StoreError::Io(std::io::Error::other("disk gone")),
    });
    let assembler =
        PromptAssembler::new(settings(1000, 100), char_counter(ModelFamily::Plain), store)
            .expect("assembler");

    let error = assembler
        .build_prompt("Hi", Some("m2"), Some("P"), None)
        .await
        .expect_err("fatal store error");
    assert!(matches!(error, ClientError::Store(StoreError::Io(_))));
}

struct BrokenCounter;

impl TokenCounter for BrokenCounter {
    fn count_tokens(&self, _text: &str) -> crate::error::Result<usize> {
        Err(ClientError::Tokenizer("vocabulary missing".to_string()))
    }
}

#[tokio::test]
async fn test_tokenizer_failure_is_surfaced() {
    let store = Arc::new(MemoryStore::new());
    let assembler = PromptAssembler::new(settings(1000, 100), Arc::new(BrokenCounter), store)
        .expect("assembler");

    let error = assembler
        .build_prompt("Hi", None, Some("P"), None)
        .await
        .expect_err("tokenizer failure");
    assert!(matches!(error, ClientError::Tokenizer(_)));
}

// Orchestration

#[tokio::test]
async fn test_send_message_buffered_persists_both_turns() {
    let transport = MockTransport::new(vec![buffered_reply("\n\nHello there.")]);
    let (manager, store) = manager_with(&test_config(), &transport);

    let reply = manager
        .send_message("Hi", SendOptions::default())
        .await
        .expect("reply");

    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.text, "Hello there.");
    assert_eq!(reply.detail.as_ref().expect("detail")["id"], "cmpl-1");

    let user_id = reply.parent_message_id.clone().expect("parent");
    let user = store.get(&user_id).await.expect("get").expect("user stored");
    assert_eq!(user.role, Role::User);
    assert_eq!(user.text, "Hi");
    assert_eq!(user.conversation_id, reply.conversation_id);
    assert_eq!(store.get(&reply.id).await.expect("get"), Some(reply.clone()));

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].stream);
    assert_eq!(requests[0].prompt, NEW_ONLY_PROMPT);
    assert_eq!(requests[0].max_tokens, 100);
    assert_eq!(requests[0].stop, vec!["<|endoftext|>".to_string()]);
}

#[tokio::test]
async fn test_send_message_streams_when_progress_is_given() {
    let transport = MockTransport::new(vec![MockReply::events([
        r#"{"id":"cmpl-2","choices":[{"text":"Hel"}]}"#,
        r#"{"id":"cmpl-2","choices":[{"text":"lo"}]}"#,
        "[DONE]",
    ])]);
    let (manager, _store) = manager_with(&test_config(), &transport);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let reply = manager
        .send_message("Hi", SendOptions::default().with_progress(tx))
        .await
        .expect("reply");

    assert_eq!(reply.text, "Hello");
    assert!(transport.requests()[0].stream);

    let texts: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|update| update.text)
        .collect();
    assert_eq!(texts, vec!["Hel".to_string(), "Hello".to_string()]);
}

#[tokio::test]
async fn test_stream_flag_overrides_progress_default() {
    let transport = MockTransport::new(vec![
        buffered_reply("buffered"),
        MockReply::events([r#"{"choices":[{"text":"streamed"}]}"#, "[DONE]"]),
    ]);
    let (manager, _store) = manager_with(&test_config(), &transport);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let buffered = manager
        .send_message("Hi", SendOptions::default().with_progress(tx).streaming(false))
        .await
        .expect("buffered");
    assert_eq!(buffered.text, "buffered");
    assert!(rx.try_recv().is_err());

    let streamed = manager
        .send_message("Hi", SendOptions::default().streaming(true))
        .await
        .expect("streamed");
    assert_eq!(streamed.text, "streamed");
}

#[tokio::test]
async fn test_follow_up_turn_replays_history() {
    let transport = MockTransport::new(vec![buffered_reply("Hello"), buffered_reply("Fine")]);
    let (manager, _store) = manager_with(&test_config(), &transport);

    let first = manager
        .send_message("Hi", SendOptions::default())
        .await
        .expect("first");
    let second = manager
        .send_message(
            "How are you?",
            SendOptions::reply_to(first.conversation_id.clone(), first.id.clone()),
        )
        .await
        .expect("second");

    assert_eq!(second.conversation_id, first.conversation_id);
    let prompt = &transport.requests()[1].prompt;
    assert_eq!(
        prompt,
        "P<|endoftext|>\n\nUser:\n\nHi<|endoftext|>\n\nAssistant:\n\nHello<|endoftext|>\n\nUser:\n\nHow are you?<|endoftext|>\n\nAssistant:\n\n"
    );
}

#[tokio::test]
async fn test_caller_supplied_ids_are_used() {
    let transport = MockTransport::new(vec![buffered_reply("ok")]);
    let (manager, store) = manager_with(&test_config(), &transport);

    let options = SendOptions {
        conversation_id: Some("conv-7".to_string()),
        message_id: Some("user-7".to_string()),
        ..SendOptions::default()
    };
    let reply = manager.send_message("Hi", options).await.expect("reply");

    assert_eq!(reply.conversation_id, "conv-7");
    assert_eq!(reply.parent_message_id.as_deref(), Some("user-7"));
    assert!(store.get("user-7").await.expect("get").is_some());
}

#[tokio::test]
async fn test_prompt_overrides_replace_defaults() {
    let transport = MockTransport::new(vec![buffered_reply("ok")]);
    let (manager, _store) = manager_with(&test_config(), &transport);

    let options = SendOptions {
        prompt_prefix: Some("Q".to_string()),
        prompt_suffix: Some("\n\nBot:".to_string()),
        ..SendOptions::default()
    };
    manager.send_message("Hi", options).await.expect("reply");

    assert_eq!(
        transport.requests()[0].prompt,
        "Q<|endoftext|>\n\nUser:\n\nHi<|endoftext|>\n\nBot:"
    );
}

#[tokio::test]
async fn test_http_error_rejects_and_stores_no_reply() {
    let transport = MockTransport::new(vec![MockReply::Status {
        status: 500,
        body: "overloaded".to_string(),
    }]);
    let (manager, store) = manager_with(&test_config(), &transport);

    let error = manager
        .send_message("Hi", SendOptions::default())
        .await
        .expect_err("500");

    match error {
        ClientError::UpstreamHttp { status, body, .. } => {
            assert_eq!(status, 500);
            assert_eq!(body, "overloaded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_stream_parse_error_discards_partial_reply() {
    let transport = MockTransport::new(vec![MockReply::events([
        r#"{"choices":[{"text":"Hel"}]}"#,
        "<html>bad gateway</html>",
    ])]);
    let (manager, store) = manager_with(&test_config(), &transport);

    let error = manager
        .send_message("Hi", SendOptions::default().streaming(true))
        .await
        .expect_err("parse error");

    assert!(matches!(error, ClientError::StreamParse { .. }));
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_timeout_rejects_and_silences_progress() {
    let transport = MockTransport::new(vec![MockReply::paced_events(
        Duration::from_millis(200),
        [r#"{"choices":[{"text":"late"}]}"#, "[DONE]"],
    )]);
    let (manager, store) = manager_with(&test_config(), &transport);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let error = manager
        .send_message(
            "Hi",
            SendOptions::default()
                .with_progress(tx)
                .with_timeout(Duration::from_millis(50)),
        )
        .await
        .expect_err("timeout");

    assert!(matches!(error, ClientError::Timeout(limit) if limit == Duration::from_millis(50)));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_configured_timeout_applies_by_default() {
    let transport = MockTransport::new(vec![MockReply::paced_events(
        Duration::from_millis(200),
        [r#"{"choices":[{"text":"late"}]}"#, "[DONE]"],
    )]);
    let config = Config {
        timeout: Some(Duration::from_millis(30)),
        ..test_config()
    };
    let (manager, _store) = manager_with(&config, &transport);

    let error = manager
        .send_message("Hi", SendOptions::default().streaming(true))
        .await
        .expect_err("timeout");
    assert!(matches!(error, ClientError::Timeout(_)));
}

#[tokio::test]
async fn test_caller_cancellation_stops_stream() {
    let transport = MockTransport::new(vec![MockReply::paced_events(
        Duration::from_millis(40),
        [
            r#"{"choices":[{"text":"one"}]}"#,
            r#"{"choices":[{"text":" two"}]}"#,
            r#"{"choices":[{"text":" three"}]}"#,
            "[DONE]",
        ],
    )]);
    let (manager, store) = manager_with(&test_config(), &transport);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let watcher = {
        let cancel = cancel.clone();
        async move {
            let first = rx.recv().await.expect("first update");
            cancel.cancel();
            (first, rx)
        }
    };
    let (outcome, (first, mut rx)) = tokio::join!(
        manager.send_message(
            "Hi",
            SendOptions::default()
                .with_progress(tx)
                .with_cancel(cancel.clone()),
        ),
        watcher
    );

    assert!(matches!(outcome, Err(ClientError::Cancelled)));
    assert_eq!(first.text, "one");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_timeout_does_not_cancel_caller_token() {
    let transport = MockTransport::new(vec![MockReply::paced_events(
        Duration::from_millis(200),
        [r#"{"choices":[{"text":"late"}]}"#, "[DONE]"],
    )]);
    let (manager, _store) = manager_with(&test_config(), &transport);
    let cancel = CancellationToken::new();

    let error = manager
        .send_message(
            "Hi",
            SendOptions::default()
                .streaming(true)
                .with_cancel(cancel.clone())
                .with_timeout(Duration::from_millis(20)),
        )
        .await
        .expect_err("timeout");

    assert!(matches!(error, ClientError::Timeout(_)));
    assert!(!cancel.is_cancelled());
}

#[tokio::test]
async fn test_chat_model_sends_both_stop_sequences() {
    let transport = MockTransport::new(vec![buffered_reply("ok")]);
    let config = Config {
        model: "text-chat-davinci-002-20230126".to_string(),
        ..test_config()
    };
    let (manager, _store) = manager_with(&config, &transport);

    manager
        .send_message("Hi", SendOptions::default())
        .await
        .expect("reply");

    let request = &transport.requests()[0];
    assert_eq!(
        request.stop,
        vec!["<|im_end|>".to_string(), "<|im_sep|>".to_string()]
    );
    assert!(request.prompt.contains("User:\n\nHi<|im_end|>"));
}
