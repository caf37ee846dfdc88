mod common;

use futures::StreamExt;

use askdocs::admission::BusyReason;
use askdocs::coordinator::StreamEvent;
use askdocs::gateway::PersistenceGateway;
use askdocs::pipeline::{QueryOutcome, QueryRequest};

use common::{collect, harness, wait_completed, HarnessOptions, Script};

fn question(text: &str) -> QueryRequest {
    QueryRequest {
        question: text.to_string(),
        keyword: String::new(),
        conv_id: String::new(),
        think: false,
    }
}

#[tokio::test]
async fn test_answer_streams_prompt_tokens_and_sources() {
    let h = harness(HarnessOptions::default()).await;

    let events = collect(
        h.state
            .queries
            .ask("alice", question("How do I file vacation requests?"))
            .await,
    )
    .await;

    assert_eq!(events.len(), 4, "events: {:?}", events);
    let conv_id = match &events[0] {
        StreamEvent::Prompt { conv_id, prompt } => {
            assert!(prompt.starts_with("CTX:Vacation requests are filed"));
            assert!(prompt.contains("|Q:How do I file vacation requests?|"));
            assert!(!prompt.contains("Expense"));
            conv_id.clone()
        }
        other => panic!("first event should be the prompt, got {:?}", other),
    };
    assert!(!conv_id.is_empty());
    assert_eq!(
        events[1],
        StreamEvent::Token {
            content: "You file ".to_string(),
            thinking: None
        }
    );
    match &events[3] {
        StreamEvent::Sources { html, files } => {
            assert_eq!(files, &vec!["vacation.md".to_string()]);
            assert!(html.starts_with("Sources: "));
            assert!(html.contains("/md_viewer?file=vacation.md"));
        }
        other => panic!("last event should be sources, got {:?}", other),
    }

    let record = wait_completed(&h.gateway, 1).await;
    assert_eq!(record.error_message, None);
    assert_eq!(record.user_id, "alice");
    assert!(record.response_time.unwrap() >= 0.0);

    let turns = h.gateway.conversation_turns(&conv_id, "alice").await.unwrap();
    assert_eq!(turns.len(), 1);
    assert!(turns[0].answer.starts_with("You file in the portal.\n\nSources: <a"));
}

#[tokio::test]
async fn test_follow_up_sees_history() {
    let h = harness(HarnessOptions::default()).await;

    let first = collect(
        h.state
            .queries
            .ask("alice", question("How do I file vacation requests?"))
            .await,
    )
    .await;
    let conv_id = match &first[0] {
        StreamEvent::Prompt { conv_id, .. } => conv_id.clone(),
        other => panic!("unexpected {:?}", other),
    };
    wait_completed(&h.gateway, 1).await;

    let mut follow_up = question("And the vacation deadline?");
    follow_up.conv_id = conv_id.clone();
    collect(h.state.queries.ask("alice", follow_up).await).await;
    wait_completed(&h.gateway, 2).await;

    let calls = h.generator.calls();
    assert_eq!(calls.len(), 2);
    let system = &calls[1].0[0];
    assert_eq!(system.role, "system");
    assert!(system
        .content
        .contains("H:User Question: How do I file vacation requests?\nAnswer: You file in the portal."));
    assert_eq!(calls[1].0[1].content, "And the vacation deadline?");

    assert_eq!(h.gateway.conversation_turns(&conv_id, "alice").await.unwrap().len(), 2);
    let listed = h.gateway.list_conversations("alice").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].message_count, 2);
}

#[tokio::test]
async fn test_foreign_conversation_id_starts_a_new_conversation() {
    let h = harness(HarnessOptions::default()).await;

    let mut first = question("vacation: alice secret salary question");
    first.conv_id = "shared-conv".to_string();
    collect(h.state.queries.ask("alice", first).await).await;
    wait_completed(&h.gateway, 1).await;

    let mut intrusion = question("vacation?");
    intrusion.conv_id = "shared-conv".to_string();
    let events = collect(h.state.queries.ask("bob", intrusion).await).await;
    let bob_conv = match &events[0] {
        StreamEvent::Prompt { conv_id, prompt } => {
            assert!(!prompt.contains("alice secret"), "prompt: {}", prompt);
            assert!(prompt.ends_with("|H:"));
            conv_id.clone()
        }
        other => panic!("unexpected {:?}", other),
    };
    assert_ne!(bob_conv, "shared-conv");
    let record = wait_completed(&h.gateway, 2).await;
    assert_eq!(record.conv_id, bob_conv);

    let calls = h.generator.calls();
    assert!(!calls[1].0[0].content.contains("alice secret"));

    let alice_turns = h.gateway.conversation_turns("shared-conv", "alice").await.unwrap();
    assert_eq!(alice_turns.len(), 1);
    assert!(h
        .gateway
        .conversation_turns("shared-conv", "bob")
        .await
        .unwrap()
        .is_empty());
    let bob_list = h.gateway.list_conversations("bob").await.unwrap();
    assert_eq!(bob_list.len(), 1);
    assert_eq!(bob_list[0].conv_id, bob_conv);
}

#[tokio::test]
async fn test_think_requires_config_and_request() {
    let h = harness(HarnessOptions::default()).await;

    let mut req = question("vacation?");
    req.think = true;
    collect(h.state.queries.ask("alice", req).await).await;
    wait_completed(&h.gateway, 1).await;

    collect(h.state.queries.ask("alice", question("vacation?")).await).await;
    wait_completed(&h.gateway, 2).await;

    let calls = h.generator.calls();
    assert!(calls[0].1);
    assert!(!calls[1].1);
}

#[tokio::test]
async fn test_provider_failure_mid_stream() {
    let h = harness(HarnessOptions {
        script: Script::FailAfter(vec!["partial"], "model crashed"),
        ..Default::default()
    })
    .await;

    let events = collect(h.state.queries.ask("alice", question("vacation?")).await).await;

    assert_eq!(events.len(), 3, "events: {:?}", events);
    assert!(matches!(events[1], StreamEvent::Token { .. }));
    match &events[2] {
        StreamEvent::Error { message } => assert!(!message.contains("model crashed")),
        other => panic!("expected error event, got {:?}", other),
    }

    let record = wait_completed(&h.gateway, 1).await;
    assert!(record.error_message.unwrap().contains("model crashed"));
    assert!(h.gateway.list_conversations("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stalled_provider_times_out() {
    let h = harness(HarnessOptions {
        script: Script::Hang(vec![]),
        ..Default::default()
    })
    .await;

    let events = collect(h.state.queries.ask("alice", question("vacation?")).await).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], StreamEvent::Error { .. }));
    let record = wait_completed(&h.gateway, 1).await;
    assert!(record.error_message.unwrap().contains("stalled"));
}

#[tokio::test]
async fn test_client_disconnect_completes_request() {
    let h = harness(HarnessOptions {
        script: Script::Hang(vec!["first"]),
        ..Default::default()
    })
    .await;

    let mut events = match h.state.queries.ask("alice", question("vacation?")).await {
        QueryOutcome::Streaming(events) => events,
        _ => panic!("expected a stream"),
    };
    assert!(matches!(events.next().await, Some(StreamEvent::Prompt { .. })));
    assert!(matches!(events.next().await, Some(StreamEvent::Token { .. })));
    drop(events);

    let record = wait_completed(&h.gateway, 1).await;
    assert_eq!(record.error_message.as_deref(), Some("client disconnected"));
    let counts = h.gateway.pending_counts("alice").await.unwrap();
    assert_eq!(counts.total, 0);
    assert!(h.gateway.list_conversations("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_busy_user_and_system() {
    let h = harness(HarnessOptions {
        script: Script::Hang(vec![]),
        global_limit: 2,
        ..Default::default()
    })
    .await;

    let _alice = h.state.queries.ask("alice", question("vacation?")).await;
    assert!(matches!(
        h.state.queries.ask("alice", question("again?")).await,
        QueryOutcome::Busy(BusyReason::User)
    ));

    let _bob = h.state.queries.ask("bob", question("vacation?")).await;
    assert!(matches!(
        h.state.queries.ask("carol", question("vacation?")).await,
        QueryOutcome::Busy(BusyReason::System)
    ));

    // Declined requests leave no record.
    assert_eq!(h.gateway.pending_counts("carol").await.unwrap().total, 2);
    assert!(h.gateway.request(3).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unindexed_store_is_not_ready() {
    let h = harness(HarnessOptions {
        seed: false,
        ..Default::default()
    })
    .await;

    match h.state.queries.ask("alice", question("vacation?")).await {
        QueryOutcome::Failed { code, message } => {
            assert_eq!(code, "index_not_ready");
            assert!(message.contains("index"));
        }
        _ => panic!("expected a not-ready failure"),
    }

    let record = wait_completed(&h.gateway, 1).await;
    assert!(record.error_message.unwrap().contains("no documents have been indexed"));
    assert!(h.generator.calls().is_empty());
}

#[tokio::test]
async fn test_analyze_uses_single_message_and_stores_nothing() {
    let h = harness(HarnessOptions::default()).await;

    let mut req = question("Accrual and carry-over of leave");
    req.think = true;
    let events = collect(h.state.queries.analyze("alice", req).await).await;

    assert!(matches!(events[0], StreamEvent::Prompt { .. }));
    assert!(!events
        .iter()
        .any(|e| matches!(e, StreamEvent::Sources { .. })));

    let record = wait_completed(&h.gateway, 1).await;
    assert_eq!(record.error_message, None);

    let calls = h.generator.calls();
    let (messages, think) = &calls[0];
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, "user");
    assert!(messages[0].content.contains("Accrual and carry-over of leave"));
    assert!(!think);
    assert!(h.gateway.list_conversations("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_analyze_works_without_index() {
    let h = harness(HarnessOptions {
        seed: false,
        ..Default::default()
    })
    .await;

    let events = collect(h.state.queries.analyze("alice", question("leave accrual")).await).await;
    assert_eq!(events.len(), 3);
}
