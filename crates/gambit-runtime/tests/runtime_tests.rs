//! End-to-end tests for gambit-runtime: the chat shim, tool dispatch,
//! external bubbling, guardrails, and the compute path, all against the
//! scripted mock provider.

use gambit_core::error::Result as CoreResult;
use gambit_core::types::{ChatTurn, FinishReason, Message, Role, RunResult, ToolCall, ToolDefinition};
use gambit_llm::MockProvider;
use gambit_runtime::*;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn write(dir: &Path, rel: &str, content: &str) -> PathBuf {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

fn stop_turn(text: &str) -> ChatTurn {
    ChatTurn {
        message: Message::assistant(text),
        finish_reason: FinishReason::Stop,
        tool_calls: None,
        usage: None,
    }
}

fn tool_turn(calls: Vec<ToolCall>) -> ChatTurn {
    ChatTurn {
        message: Message::assistant(""),
        finish_reason: FinishReason::ToolCalls,
        tool_calls: Some(calls),
        usage: None,
    }
}

struct ChildExec;

#[async_trait::async_trait]
impl DeckExecutor for ChildExec {
    fn name(&self) -> &str {
        "child"
    }

    fn context_schema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }))
    }

    fn response_schema(&self) -> Option<serde_json::Value> {
        Some(json!({"type": "string"}))
    }

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> CoreResult<serde_json::Value> {
        let text = ctx.input()["text"].as_str().unwrap_or_default().to_string();
        Ok(json!(format!("child:{text}")))
    }
}

struct RecurseExec;

#[async_trait::async_trait]
impl DeckExecutor for RecurseExec {
    fn name(&self) -> &str {
        "recurse"
    }

    fn context_schema(&self) -> Option<serde_json::Value> {
        Some(json!({"type": "object"}))
    }

    fn response_schema(&self) -> Option<serde_json::Value> {
        Some(json!({"type": "string"}))
    }

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> CoreResult<serde_json::Value> {
        let value = ctx
            .spawn_and_wait(SpawnOptions::new("recurse", json!({})))
            .await?;
        Ok(value)
    }
}

struct SlowExec;

#[async_trait::async_trait]
impl DeckExecutor for SlowExec {
    fn name(&self) -> &str {
        "slow"
    }

    fn context_schema(&self) -> Option<serde_json::Value> {
        Some(json!({"type": "object"}))
    }

    fn response_schema(&self) -> Option<serde_json::Value> {
        Some(json!({"type": "string"}))
    }

    async fn execute(&self, _ctx: &mut ExecutionContext<'_>) -> CoreResult<serde_json::Value> {
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        Ok(json!("late"))
    }
}

struct ReadExec;

#[async_trait::async_trait]
impl DeckExecutor for ReadExec {
    fn name(&self) -> &str {
        "read_file"
    }

    fn context_schema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        }))
    }

    fn response_schema(&self) -> Option<serde_json::Value> {
        Some(json!({"type": "string"}))
    }

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> CoreResult<serde_json::Value> {
        let path = ctx.input()["path"].as_str().unwrap_or_default().to_string();
        let content = ctx.read_file(&path).await?;
        Ok(json!(content))
    }
}

fn default_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(ChildExec);
    registry.register(RecurseExec);
    registry.register(SlowExec);
    registry.register(ReadExec);
    registry
}

fn runtime_at(provider: Arc<MockProvider>, ws: &Path) -> DeckRuntime {
    DeckRuntime::new(
        provider,
        default_registry(),
        RuntimeConfig {
            workspace_root: ws.to_path_buf(),
            ..Default::default()
        },
    )
}

// ===========================================================================
// Chat shim
// ===========================================================================

#[tokio::test]
async fn chat_shim_simple_stop() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(ws.path(), "PROMPT.md", "+++\n+++\nYou are concise.\n");

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(stop_turn("ok"));
    let runtime = runtime_at(provider.clone(), ws.path());

    let response = runtime
        .chat_completions(
            &deck.display().to_string(),
            ChatCompletionRequest {
                model: None,
                messages: vec![Message::user("hi")],
                tools: Vec::new(),
            },
        )
        .await
        .unwrap();

    assert_eq!(response.object, "chat.completion");
    assert_eq!(response.choices[0].message.content, "ok");
    assert_eq!(response.choices[0].finish_reason, "stop");

    // The provider saw the deck body as the system message.
    let first = &provider.chat_requests()[0];
    assert_eq!(first.messages[0].role, Role::System);
    assert!(first.messages[0].content.contains("You are concise."));
    assert_eq!(first.messages[1].content, "hi");

    // The runtime extension carries the full history.
    assert!(response
        .gambit
        .messages
        .iter()
        .any(|m| m.role == Role::Assistant && m.content == "ok"));
}

#[tokio::test]
async fn caller_system_message_loses_to_deck_prompt() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(ws.path(), "PROMPT.md", "+++\n+++\nDeck prompt wins.\n");

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(stop_turn("ok"));
    let runtime = runtime_at(provider.clone(), ws.path());

    runtime
        .chat_completions(
            &deck.display().to_string(),
            ChatCompletionRequest {
                model: None,
                messages: vec![Message::system("Caller prompt."), Message::user("hi")],
                tools: Vec::new(),
            },
        )
        .await
        .unwrap();

    let first = &provider.chat_requests()[0];
    let systems: Vec<_> = first
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .collect();
    assert_eq!(systems.len(), 1);
    assert!(systems[0].content.contains("Deck prompt wins."));
}

// ===========================================================================
// Tool dispatch
// ===========================================================================

#[tokio::test]
async fn action_tool_call_dispatches_to_child() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\n[[actions]]\nname = \"child\"\ndescription = \"Run the child\"\nexecute = \"child\"\n+++\nDelegate work.\n",
    );

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(tool_turn(vec![ToolCall::function(
        "call-1",
        "child",
        r#"{"text":"hi"}"#,
    )]));
    provider.push_turn(stop_turn("done"));
    let runtime = runtime_at(provider.clone(), ws.path());

    let outcome = runtime
        .run_deck(RunDeckOptions::new(
            deck.display().to_string(),
            json!("start"),
        ))
        .await
        .unwrap();

    match outcome.result {
        RunResult::Text { text } => assert_eq!(text, "done"),
        other => panic!("expected text result, got {other:?}"),
    }

    // The child's validated result came back as a tool message on the
    // second model call.
    let second = &provider.chat_requests()[1];
    let tool_msg = second
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool message present");
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call-1"));
    assert_eq!(tool_msg.name.as_deref(), Some("child"));
    assert_eq!(tool_msg.content, "child:hi");

    // The action was advertised with the executor's context schema.
    let first = &provider.chat_requests()[0];
    let tool = first.tools.iter().find(|t| t.name == "child").unwrap();
    assert_eq!(tool.parameters["required"][0], "text");
}

#[tokio::test]
async fn action_tool_call_dispatches_to_nested_deck() {
    let ws = tempfile::tempdir().unwrap();
    write(
        ws.path(),
        "child/PROMPT.md",
        "+++\n[contextSchema]\ntype = \"object\"\nrequired = [\"text\"]\n[contextSchema.properties.text]\ntype = \"string\"\n[responseSchema]\ntype = \"object\"\n+++\nAnswer as the child.\n",
    );
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\n[[actions]]\nname = \"helper\"\ndescription = \"Delegate to the nested deck\"\npath = \"./child/PROMPT.md\"\n+++\nDelegate work.\n",
    );

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(tool_turn(vec![ToolCall::function(
        "call-1",
        "helper",
        r#"{"text":"hi"}"#,
    )]));
    // Served to the nested deck's own loop.
    provider.push_turn(stop_turn("child says hi"));
    provider.push_turn(stop_turn("parent done"));
    let runtime = runtime_at(provider.clone(), ws.path());

    let outcome = runtime
        .run_deck(RunDeckOptions::new(deck.display().to_string(), json!(null)))
        .await
        .unwrap();

    match outcome.result {
        RunResult::Text { text } => assert_eq!(text, "parent done"),
        other => panic!("expected text result, got {other:?}"),
    }
    assert_eq!(provider.chat_request_count(), 3);

    // The second model call belongs to the child: its own system prompt,
    // seeded with the validated action arguments.
    let requests = provider.chat_requests();
    assert!(requests[1].messages[0].content.contains("Answer as the child."));
    assert!(requests[1]
        .messages
        .iter()
        .any(|m| m.role == Role::User && m.content.contains("hi")));

    // The child's final text came back to the parent as a tool message.
    let tool_msg = requests[2]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool message present");
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call-1"));
    assert_eq!(tool_msg.name.as_deref(), Some("helper"));
    assert_eq!(tool_msg.content, "child says hi");
}

#[tokio::test]
async fn parallel_actions_batch_and_keep_call_order() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\n[[actions]]\nname = \"alpha\"\ndescription = \"d\"\nexecute = \"child\"\nparallel = true\n\n[[actions]]\nname = \"beta\"\ndescription = \"d\"\nexecute = \"child\"\nparallel = true\n+++\nFan out.\n",
    );

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(tool_turn(vec![
        ToolCall::function("call-a", "alpha", r#"{"text":"one"}"#),
        ToolCall::function("call-b", "beta", r#"{"text":"two"}"#),
    ]));
    provider.push_turn(stop_turn("done"));
    let runtime = runtime_at(provider.clone(), ws.path());

    let outcome = runtime
        .run_deck(RunDeckOptions::new(deck.display().to_string(), json!(null)))
        .await
        .unwrap();

    match outcome.result {
        RunResult::Text { text } => assert_eq!(text, "done"),
        other => panic!("expected text result, got {other:?}"),
    }

    // Both calls dispatched as one batch, results appended in call order.
    let second = &provider.chat_requests()[1];
    let tool_msgs: Vec<_> = second
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tool_msgs.len(), 2);
    assert_eq!(tool_msgs[0].tool_call_id.as_deref(), Some("call-a"));
    assert_eq!(tool_msgs[0].content, "child:one");
    assert_eq!(tool_msgs[1].tool_call_id.as_deref(), Some("call-b"));
    assert_eq!(tool_msgs[1].content, "child:two");
}

#[tokio::test]
async fn external_tool_call_bubbles_unchanged() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(ws.path(), "PROMPT.md", "+++\n+++\nUse your tools.\n");

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(tool_turn(vec![ToolCall::function(
        "call-9",
        "external_tool",
        r#"{"q":"x"}"#,
    )]));
    let runtime = runtime_at(provider.clone(), ws.path());

    let response = runtime
        .chat_completions(
            &deck.display().to_string(),
            ChatCompletionRequest {
                model: None,
                messages: vec![Message::user("go")],
                tools: vec![ToolDefinition {
                    name: "external_tool".to_string(),
                    description: "caller-side tool".to_string(),
                    parameters: json!({"type": "object"}),
                }],
            },
        )
        .await
        .unwrap();

    assert_eq!(provider.chat_request_count(), 1, "exactly one model call");
    assert_eq!(response.choices[0].finish_reason, "tool_calls");
    let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
    assert_eq!(calls[0].id, "call-9");
    assert_eq!(calls[0].function.name, "external_tool");
    assert_eq!(calls[0].function.arguments, r#"{"q":"x"}"#);
}

#[tokio::test]
async fn action_and_external_name_collision_fails_before_model() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\n[[actions]]\nname = \"dup\"\ndescription = \"d\"\nexecute = \"child\"\n+++\nbody\n",
    );

    let provider = Arc::new(MockProvider::new());
    let runtime = runtime_at(provider.clone(), ws.path());

    let err = runtime
        .run_deck(RunDeckOptions {
            external_tools: vec![ToolDefinition {
                name: "dup".to_string(),
                description: "outside".to_string(),
                parameters: json!({"type": "object"}),
            }],
            ..RunDeckOptions::new(deck.display().to_string(), json!(null))
        })
        .await
        .unwrap_err();

    assert!(err.to_string().contains("dup"));
    assert_eq!(provider.chat_request_count(), 0, "no model call was made");
}

// ===========================================================================
// Responder builtins
// ===========================================================================

#[tokio::test]
async fn gambit_respond_finalizes_with_validated_payload() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\n[responseSchema]\ntype = \"object\"\nrequired = [\"answer\"]\n[responseSchema.properties.answer]\ntype = \"string\"\n+++\n![r](gambit://respond)\n",
    );

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(tool_turn(vec![ToolCall::function(
        "call-1",
        "gambit_respond",
        r#"{"payload":{"answer":"42"},"message":"solved"}"#,
    )]));
    let runtime = runtime_at(provider.clone(), ws.path());

    let outcome = runtime
        .run_deck(RunDeckOptions::new(deck.display().to_string(), json!(null)))
        .await
        .unwrap();

    match outcome.result {
        RunResult::Responded {
            status,
            message,
            payload,
            ..
        } => {
            assert_eq!(status, "ok");
            assert_eq!(message.as_deref(), Some("solved"));
            assert_eq!(payload["answer"], "42");
        }
        other => panic!("expected responded, got {other:?}"),
    }

    // gambit_respond was advertised to the model.
    let tools = &provider.chat_requests()[0].tools;
    assert!(tools.iter().any(|t| t.name == "gambit_respond"));
}

#[tokio::test]
async fn gambit_respond_rejects_payload_outside_schema() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\n[responseSchema]\ntype = \"object\"\nrequired = [\"answer\"]\n[responseSchema.properties.answer]\ntype = \"string\"\n+++\n![r](gambit://respond)\n",
    );

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(tool_turn(vec![ToolCall::function(
        "call-1",
        "gambit_respond",
        r#"{"payload":{"answer":7}}"#,
    )]));
    let runtime = runtime_at(provider.clone(), ws.path());

    let err = runtime
        .run_deck(RunDeckOptions::new(deck.display().to_string(), json!(null)))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("validation") || err.to_string().contains("failed"));
}

#[tokio::test]
async fn gambit_end_finalizes_when_allowed() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\n+++\nWork, then stop.\n![end](gambit://end)\n",
    );

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(tool_turn(vec![ToolCall::function(
        "call-1",
        "gambit_end",
        r#"{"message":"all done"}"#,
    )]));
    let runtime = runtime_at(provider.clone(), ws.path());

    let outcome = runtime
        .run_deck(RunDeckOptions::new(deck.display().to_string(), json!(null)))
        .await
        .unwrap();

    match outcome.result {
        RunResult::Ended { message, .. } => assert_eq!(message.as_deref(), Some("all done")),
        other => panic!("expected ended, got {other:?}"),
    }
}

// ===========================================================================
// Guardrails
// ===========================================================================

#[tokio::test]
async fn depth_guardrail_stops_runaway_recursion() {
    let provider = Arc::new(MockProvider::new());
    let ws = tempfile::tempdir().unwrap();
    let runtime = runtime_at(provider, ws.path());

    let err = runtime
        .run_deck(RunDeckOptions::new("recurse", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code().as_deref(), Some("depth_exceeded"));
}

#[tokio::test]
async fn pass_guardrail_bounds_model_turns() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\n[guardrails]\nmaxPasses = 2\n\n[[actions]]\nname = \"child\"\ndescription = \"d\"\nexecute = \"child\"\n+++\nbody\n",
    );

    let provider = Arc::new(MockProvider::new());
    for _ in 0..2 {
        provider.push_turn(tool_turn(vec![ToolCall::function(
            "call-1",
            "child",
            r#"{"text":"again"}"#,
        )]));
    }
    let runtime = runtime_at(provider.clone(), ws.path());

    let err = runtime
        .run_deck(RunDeckOptions::new(deck.display().to_string(), json!(null)))
        .await
        .unwrap_err();
    assert_eq!(err.code().as_deref(), Some("passes_exceeded"));
    assert_eq!(provider.chat_request_count(), 2);
}

#[tokio::test]
async fn child_pass_exhaustion_terminates_the_parent_run() {
    let ws = tempfile::tempdir().unwrap();
    write(
        ws.path(),
        "child/PROMPT.md",
        "+++\n[guardrails]\nmaxPasses = 1\n\n[contextSchema]\ntype = \"object\"\n[responseSchema]\ntype = \"object\"\n\n[[actions]]\nname = \"work\"\ndescription = \"d\"\nexecute = \"child\"\n+++\nKeep working.\n",
    );
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\n[[actions]]\nname = \"helper\"\ndescription = \"d\"\npath = \"./child/PROMPT.md\"\n+++\nDelegate.\n",
    );

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(tool_turn(vec![ToolCall::function(
        "call-1",
        "helper",
        "{}",
    )]));
    // The child's single allowed pass ends in a tool call, so its loop
    // wants a second pass and trips its own budget.
    provider.push_turn(tool_turn(vec![ToolCall::function(
        "call-2",
        "work",
        r#"{"text":"x"}"#,
    )]));
    let runtime = runtime_at(provider.clone(), ws.path());

    let err = runtime
        .run_deck(RunDeckOptions::new(deck.display().to_string(), json!(null)))
        .await
        .unwrap_err();

    // The child's guardrail error terminates the parent run instead of
    // being swallowed into a tool-result message.
    assert_eq!(err.code().as_deref(), Some("passes_exceeded"));
    assert_eq!(provider.chat_request_count(), 2);
}

#[tokio::test]
async fn deadline_guardrail_times_out_slow_executors() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(
        ws.path(),
        "parent/PROMPT.md",
        "+++\n[guardrails]\ntimeoutMs = 50\n\n[[actions]]\nname = \"slow\"\ndescription = \"d\"\nexecute = \"slow\"\n+++\nbody\n",
    );

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(tool_turn(vec![ToolCall::function(
        "call-1", "slow", "{}",
    )]));
    let runtime = runtime_at(provider, ws.path());

    let err = runtime
        .run_deck(RunDeckOptions::new(deck.display().to_string(), json!(null)))
        .await
        .unwrap_err();
    assert_eq!(err.code().as_deref(), Some("timeout"));
}

// ===========================================================================
// Compute path
// ===========================================================================

#[tokio::test]
async fn root_compute_run_validates_io() {
    let provider = Arc::new(MockProvider::new());
    let ws = tempfile::tempdir().unwrap();
    let runtime = runtime_at(provider, ws.path());

    let outcome = runtime
        .run_deck(RunDeckOptions::new("child", json!({"text": "direct"})))
        .await
        .unwrap();

    match outcome.result {
        RunResult::Value { value } => assert_eq!(value, json!("child:direct")),
        other => panic!("expected value, got {other:?}"),
    }
}

#[tokio::test]
async fn compute_input_failing_schema_is_rejected() {
    let provider = Arc::new(MockProvider::new());
    let ws = tempfile::tempdir().unwrap();
    let runtime = runtime_at(provider, ws.path());

    let err = runtime
        .run_deck(RunDeckOptions::new("child", json!({"wrong": true})))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("validation") || err.to_string().contains("failed"));
}

#[tokio::test]
async fn sandbox_denies_reads_outside_workspace_grant() {
    let ws = tempfile::tempdir().unwrap();
    fs::create_dir_all(ws.path().join("data")).unwrap();
    fs::write(ws.path().join("data/ok.txt"), "fine").unwrap();
    fs::write(ws.path().join("secret.txt"), "no").unwrap();

    let provider = Arc::new(MockProvider::new());
    let runtime = DeckRuntime::new(
        provider,
        default_registry(),
        RuntimeConfig {
            workspace_root: ws.path().to_path_buf(),
            workspace_permissions: Some(gambit_sandbox::PermissionDecl {
                read: Some(gambit_sandbox::ScopeDecl::List(vec!["./data".into()])),
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    let ok = runtime
        .run_deck(RunDeckOptions::new(
            "read_file",
            json!({"path": ws.path().join("data/ok.txt").display().to_string()}),
        ))
        .await
        .unwrap();
    match ok.result {
        RunResult::Value { value } => assert_eq!(value, json!("fine")),
        other => panic!("expected value, got {other:?}"),
    }

    let err = runtime
        .run_deck(RunDeckOptions::new(
            "read_file",
            json!({"path": ws.path().join("secret.txt").display().to_string()}),
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().to_lowercase().contains("permission denied"));
}

// ===========================================================================
// Streaming, state, inspection
// ===========================================================================

#[tokio::test]
async fn streamed_text_reaches_the_caller() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(ws.path(), "PROMPT.md", "+++\n+++\nbody\n");

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(stop_turn("streamed reply"));
    let runtime = runtime_at(provider, ws.path());

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    runtime
        .run_deck(RunDeckOptions {
            on_stream_text: Some(tx),
            ..RunDeckOptions::new(deck.display().to_string(), json!("hello"))
        })
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), "streamed reply");
}

#[tokio::test]
async fn state_updates_publish_in_order() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(ws.path(), "PROMPT.md", "+++\n+++\nbody\n");

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(stop_turn("final"));
    let runtime = runtime_at(provider, ws.path());

    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let outcome = runtime
        .run_deck(RunDeckOptions {
            on_state_update: Some(tx),
            ..RunDeckOptions::new(deck.display().to_string(), json!("hello"))
        })
        .await
        .unwrap();

    let mut updates = Vec::new();
    while let Ok(state) = rx.try_recv() {
        updates.push(state);
    }
    assert!(!updates.is_empty());
    // Same run throughout, and the last snapshot has the final reply.
    assert!(updates.iter().all(|s| s.run_id == outcome.state.run_id));
    let last = updates.last().unwrap();
    assert!(last
        .messages
        .iter()
        .any(|m| m.role == Role::Assistant && m.content == "final"));
}

#[tokio::test]
async fn inspect_deck_summarizes_without_running() {
    let ws = tempfile::tempdir().unwrap();
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\nlabel = \"Inspectable\"\n[[actions]]\nname = \"child\"\ndescription = \"d\"\nexecute = \"child\"\n+++\n![r](gambit://respond)\n",
    );

    let provider = Arc::new(MockProvider::new());
    let runtime = runtime_at(provider.clone(), ws.path());

    let summary = runtime
        .inspect_deck(&deck.display().to_string())
        .await
        .unwrap();
    assert_eq!(summary["label"], "Inspectable");
    assert_eq!(summary["respond"], true);
    assert_eq!(summary["actions"][0]["name"], "child");
    assert_eq!(provider.chat_request_count(), 0);
}

#[tokio::test]
async fn responses_mode_keeps_both_state_shapes_in_lockstep() {
    use gambit_core::protocol::ResponsesResultPayload;
    use gambit_core::state::{derive_messages, ContentPart, ResponseItem};

    let ws = tempfile::tempdir().unwrap();
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\nstartMode = \"responses\"\n+++\nItem-centric deck.\n",
    );

    let provider = Arc::new(MockProvider::new());
    provider.push_responses(ResponsesResultPayload {
        items: vec![ResponseItem::Message {
            role: Role::Assistant,
            content: vec![ContentPart::text("done items")],
            id: None,
        }],
        usage: None,
    });
    let runtime = runtime_at(provider.clone(), ws.path());

    let outcome = runtime
        .run_deck(RunDeckOptions::new(
            deck.display().to_string(),
            json!("hello"),
        ))
        .await
        .unwrap();

    match outcome.result {
        RunResult::Text { text } => assert_eq!(text, "done items"),
        other => panic!("expected text, got {other:?}"),
    }

    // The item shape is canonical and the chat projection matches it.
    let items = outcome.state.items.as_ref().unwrap();
    assert_eq!(derive_messages(items), outcome.state.messages);
    assert_eq!(provider.responses_requests().len(), 1);
    assert_eq!(provider.chat_request_count(), 0);
}

#[tokio::test]
async fn responses_mode_dispatches_function_calls() {
    use gambit_core::protocol::ResponsesResultPayload;
    use gambit_core::state::{ContentPart, ResponseItem};

    let ws = tempfile::tempdir().unwrap();
    let deck = write(
        ws.path(),
        "PROMPT.md",
        "+++\nstartMode = \"responses\"\n[[actions]]\nname = \"child\"\ndescription = \"d\"\nexecute = \"child\"\n+++\nbody\n",
    );

    let provider = Arc::new(MockProvider::new());
    provider.push_responses(ResponsesResultPayload {
        items: vec![ResponseItem::FunctionCall {
            call_id: "call-5".into(),
            name: "child".into(),
            arguments: r#"{"text":"go"}"#.into(),
            id: None,
        }],
        usage: None,
    });
    provider.push_responses(ResponsesResultPayload {
        items: vec![ResponseItem::Message {
            role: Role::Assistant,
            content: vec![ContentPart::text("after")],
            id: None,
        }],
        usage: None,
    });
    let runtime = runtime_at(provider.clone(), ws.path());

    let outcome = runtime
        .run_deck(RunDeckOptions::new(deck.display().to_string(), json!(null)))
        .await
        .unwrap();

    match outcome.result {
        RunResult::Text { text } => assert_eq!(text, "after"),
        other => panic!("expected text, got {other:?}"),
    }

    // The second request carried the child's output item.
    let second = &provider.responses_requests()[1];
    let output = second
        .items
        .iter()
        .find_map(|item| match item {
            ResponseItem::FunctionCallOutput {
                call_id, output, ..
            } if call_id == "call-5" => Some(output.clone()),
            _ => None,
        })
        .expect("function_call_output present");
    assert_eq!(output, "child:go");
}

#[tokio::test]
async fn saved_state_with_items_hydrates_for_the_model() {
    use gambit_core::state::{ContentPart, ResponseItem, SavedState};

    let ws = tempfile::tempdir().unwrap();
    let deck = write(ws.path(), "PROMPT.md", "+++\n+++\nbody\n");

    let provider = Arc::new(MockProvider::new());
    provider.push_turn(stop_turn("resumed"));
    let runtime = runtime_at(provider.clone(), ws.path());

    let mut state = SavedState::new("run-items");
    state.items = Some(vec![ResponseItem::Message {
        role: Role::User,
        content: vec![ContentPart::text("from items")],
        id: None,
    }]);

    runtime
        .run_deck(RunDeckOptions {
            saved_state: Some(state),
            ..RunDeckOptions::new(deck.display().to_string(), json!(null))
        })
        .await
        .unwrap();

    let first = &provider.chat_requests()[0];
    assert!(first
        .messages
        .iter()
        .any(|m| m.role == Role::User && m.content == "from items"));
}
