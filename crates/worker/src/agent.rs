#![forbid(unsafe_code)]
//! Agent execution: one claimed inbox task through the multi-turn tool
//! loop, bounded by the control policy.

use autonous_core::{
    classify_tool_error, estimate_tokens, parse_tool_protocol, redact_secrets, truncate_chars,
    LimitError, Policy, ToolProtocol,
};
use autonous_storage::{
    Store, EVENT_CONTEXT_ASSEMBLED, EVENT_CONTROL_LIMIT_REACHED, EVENT_REPLY_SENT,
    EVENT_TOOL_CALL_COMPLETED, EVENT_TOOL_CALL_FAILED, EVENT_TOOL_CALL_STARTED,
    EVENT_TURN_COMPLETED, EVENT_TURN_STARTED,
};
use autonous_storage::InboxTask;
use autonous_tools::{Registry, Runner, ToolCall};
use serde_json::json;
use std::time::Instant;

use crate::commander::Commander;
use crate::config::WorkerConfig;
use crate::context;
use crate::error::WorkerError;
use crate::provider::{Message, ModelProvider};

/// Run the agent for one claimed task and send the final answer back.
///
/// Events are appended under `agent_event_id` in happens-before order:
/// context assembly, then one `turn.started`/`turn.completed` pair per
/// provider call, with tool calls as children of their turn.
#[allow(clippy::too_many_arguments)]
pub fn process_task(
    store: &Store,
    commander: &mut dyn Commander,
    provider: &mut dyn ModelProvider,
    cfg: &WorkerConfig,
    system_prompt: &str,
    policy: &Policy,
    registry: &Registry,
    task: &InboxTask,
    agent_event_id: i64,
) -> Result<(), WorkerError> {
    let started_at = Instant::now();
    let mut used_turns: i64 = 0;
    let mut total_tokens: i64 = 0;
    let runner = Runner::new(registry);

    policy
        .check_turn_limit(used_turns)
        .map_err(|err| record_limit(store, agent_event_id, task.id, err))?;
    policy
        .check_wall_time(started_at, Instant::now())
        .map_err(|err| record_limit(store, agent_event_id, task.id, err))?;

    let history = context::get_history(store, task.chat_id, cfg.history_window)?;
    let original_count = history.len();
    let compressed = context::compress(history, cfg.history_window.max(0) as usize);
    let compressed_count = compressed.len();
    let history_tokens: i64 = compressed.iter().map(|m| estimate_tokens(&m.content)).sum();

    let instruction = build_tool_protocol_instruction(registry, &cfg.tool_allowed_roots);
    let mut messages = context::assemble(system_prompt, compressed, &task.text);
    messages = context::inject_tool_instruction(messages, &instruction);

    let _ = store.log_event(
        Some(agent_event_id),
        EVENT_CONTEXT_ASSEMBLED,
        Some(&json!({
            "original_count": original_count,
            "compressed_count": compressed_count,
            "max_messages": cfg.history_window,
            "system_tokens": estimate_tokens(system_prompt) + estimate_tokens(&instruction),
            "history_tokens": history_tokens,
            "user_tokens": estimate_tokens(&task.text),
        })),
    );

    let mut turn_event_id = log_turn_started(store, agent_event_id, cfg);
    used_turns += 1;
    let response = run_turn(
        store,
        provider,
        cfg,
        policy,
        agent_event_id,
        task.id,
        started_at,
        &mut total_tokens,
        &messages,
    )?;

    let mut final_reply = response.trim().to_string();
    let mut last_assistant = final_reply.clone();
    let mut envelope = parse_tool_protocol(&final_reply);
    let mut has_protocol = envelope.is_some();
    if let Some(parsed) = &envelope {
        if parsed.tool_calls.is_empty() {
            final_reply = parsed.final_answer.trim().to_string();
        }
    }

    while let Some(parsed) = envelope.take() {
        if parsed.tool_calls.is_empty() {
            break;
        }
        let tool_results = execute_tool_calls(store, turn_event_id, &runner, &parsed);
        policy
            .check_turn_limit(used_turns)
            .map_err(|err| record_limit(store, agent_event_id, task.id, err))?;
        used_turns += 1;

        messages.push(Message::new("assistant", last_assistant.clone()));
        messages.push(Message::new(
            "user",
            format!(
                "Tool results:\n{tool_results}\nReturn JSON: {{\"tool_calls\":[],\"final_answer\":\"...\"}}"
            ),
        ));

        turn_event_id = log_turn_started(store, agent_event_id, cfg);
        let next = run_turn(
            store,
            provider,
            cfg,
            policy,
            agent_event_id,
            task.id,
            started_at,
            &mut total_tokens,
            &messages,
        )?;

        final_reply = next.trim().to_string();
        last_assistant = final_reply.clone();
        match parse_tool_protocol(&final_reply) {
            Some(next_envelope) => {
                if next_envelope.tool_calls.is_empty() {
                    final_reply = next_envelope.final_answer.trim().to_string();
                }
                envelope = Some(next_envelope);
                has_protocol = true;
            }
            None => {
                has_protocol = false;
            }
        }
    }

    // A protocol-speaking model that returned neither tools nor an answer
    // gets exactly one bounded re-prompt.
    if final_reply.is_empty() && has_protocol {
        policy
            .check_turn_limit(used_turns)
            .map_err(|err| record_limit(store, agent_event_id, task.id, err))?;
        used_turns += 1;
        let _ = log_turn_started(store, agent_event_id, cfg);

        messages.push(Message::new("assistant", last_assistant.clone()));
        messages.push(Message::new(
            "user",
            "Previous final_answer was empty. Return strict JSON with tool_calls=[] and a non-empty final_answer.",
        ));
        let last = run_turn(
            store,
            provider,
            cfg,
            policy,
            agent_event_id,
            task.id,
            started_at,
            &mut total_tokens,
            &messages,
        )?;
        final_reply = last.trim().to_string();
        if let Some(parsed) = parse_tool_protocol(&final_reply) {
            final_reply = parsed.final_answer.trim().to_string();
        }
    }

    if final_reply.is_empty() {
        return Err(WorkerError::Validation("validation: empty final reply".into()));
    }

    commander.send_message(task.chat_id, &final_reply)?;
    let _ = store.log_event(
        Some(agent_event_id),
        EVENT_REPLY_SENT,
        Some(&json!({"chat_id": task.chat_id})),
    );

    store.append_history(task.chat_id, "user", &task.text)?;
    store.append_history(task.chat_id, "assistant", &final_reply)?;
    Ok(())
}

/// One provider call with its `turn.completed` bookkeeping and the
/// wall-time and token checks that follow every turn.
#[allow(clippy::too_many_arguments)]
fn run_turn(
    store: &Store,
    provider: &mut dyn ModelProvider,
    cfg: &WorkerConfig,
    policy: &Policy,
    agent_event_id: i64,
    task_id: i64,
    started_at: Instant,
    total_tokens: &mut i64,
    messages: &[Message],
) -> Result<String, WorkerError> {
    let turn_start = Instant::now();
    let response = provider.chat_completion(messages)?;
    let latency_ms = turn_start.elapsed().as_millis() as i64;

    let _ = store.log_event(
        Some(agent_event_id),
        EVENT_TURN_COMPLETED,
        Some(&json!({
            "model_name": cfg.model_name,
            "latency_ms": latency_ms,
            "input_tokens": response.input_tokens,
            "output_tokens": response.output_tokens,
        })),
    );

    policy
        .check_wall_time(started_at, Instant::now())
        .map_err(|err| record_limit(store, agent_event_id, task_id, err))?;
    *total_tokens += response.input_tokens + response.output_tokens;
    policy
        .check_token_limit(*total_tokens)
        .map_err(|err| record_limit(store, agent_event_id, task_id, err))?;

    Ok(response.content)
}

fn log_turn_started(store: &Store, agent_event_id: i64, cfg: &WorkerConfig) -> i64 {
    store
        .log_event(
            Some(agent_event_id),
            EVENT_TURN_STARTED,
            Some(&json!({"model_name": cfg.model_name})),
        )
        .unwrap_or(agent_event_id)
}

fn record_limit(store: &Store, agent_event_id: i64, task_id: i64, err: LimitError) -> WorkerError {
    let _ = store.log_event(
        Some(agent_event_id),
        EVENT_CONTROL_LIMIT_REACHED,
        Some(&json!({
            "task_id": task_id,
            "limit_type": err.limit_type.as_str(),
            "value": err.value,
            "threshold": err.threshold,
        })),
    );
    WorkerError::Limit(err)
}

/// System instruction advertising the registered tools and the strict
/// envelope the model must reply with.
pub fn build_tool_protocol_instruction(registry: &Registry, allowed_roots: &str) -> String {
    let tool_names = registry.names().join(", ");
    let roots = if allowed_roots.trim().is_empty() {
        "/workspace,/state"
    } else {
        allowed_roots.trim()
    };
    format!(
        "You can use tools in this environment. Available tools: {tool_names}. \
         Allowed roots: {roots}. \
         For ls/find/read/write/edit, arguments must include a valid \"path\". \
         Use \".\" for current directory; never use \"/\". \
         For read, always set \"limit\" > 0 and optional \"offset\" >= 0. \
         For write, always set non-empty \"content\". \
         Always respond with strict JSON: \
         {{\"tool_calls\":[{{\"name\":\"...\",\"arguments\":{{...}}}}],\"final_answer\":\"...\"}}. \
         If a tool is needed, set final_answer to empty and fill tool_calls. \
         If no tool is needed, set tool_calls to [] and provide final_answer."
    )
}

/// Execute every requested tool call, logging a `tool_call.started` child
/// under the turn and a completion/failure child under that. Returns the
/// redacted transcript appended to the conversation.
fn execute_tool_calls(
    store: &Store,
    turn_event_id: i64,
    runner: &Runner<'_>,
    envelope: &ToolProtocol,
) -> String {
    let mut out = String::new();
    for call in &envelope.tool_calls {
        let tool_name = call.name.trim().to_string();
        let args_text = call.arguments.to_string();
        let (args_text, args_redacted) = redact_secrets(&args_text);

        let tool_event_id = store
            .log_event(
                Some(turn_event_id),
                EVENT_TOOL_CALL_STARTED,
                Some(&json!({
                    "tool_name": tool_name,
                    "arguments": truncate_chars(&args_text, 500),
                })),
            )
            .unwrap_or(turn_event_id);

        let started = Instant::now();
        let run = runner.run_one(&ToolCall {
            name: tool_name.clone(),
            arguments: call.arguments.clone(),
        });

        match run {
            Ok(result) => {
                let (stdout, stdout_redacted) = redact_secrets(&result.stdout);
                let (stderr, stderr_redacted) = redact_secrets(&result.stderr);
                let _ = store.log_event(
                    Some(tool_event_id),
                    EVENT_TOOL_CALL_COMPLETED,
                    Some(&json!({
                        "tool_name": tool_name,
                        "latency_ms": started.elapsed().as_millis() as i64,
                        "exit_code": result.exit_code,
                        "truncated_lines": result.truncated_lines,
                        "truncated_bytes": result.truncated_bytes,
                        "redacted": args_redacted || stdout_redacted || stderr_redacted,
                    })),
                );
                out.push_str(&format!("tool={tool_name}\n"));
                if !stdout.trim().is_empty() {
                    out.push_str(&format!("stdout:\n{stdout}\n"));
                }
                if !stderr.trim().is_empty() {
                    out.push_str(&format!("stderr:\n{stderr}\n"));
                }
            }
            Err(err) => {
                let (err_text, err_redacted) = redact_secrets(&err.to_string());
                let (stdout, stdout_redacted) = match err.result() {
                    Some(result) => redact_secrets(&result.stdout),
                    None => (String::new(), false),
                };
                let (stderr, stderr_redacted) = match err.result() {
                    Some(result) => redact_secrets(&result.stderr),
                    None => (String::new(), false),
                };
                let error_class = classify_tool_error(&err_text);
                let _ = store.log_event(
                    Some(tool_event_id),
                    EVENT_TOOL_CALL_FAILED,
                    Some(&json!({
                        "tool_name": tool_name,
                        "error": truncate_chars(&err_text, 500),
                        "error_class": error_class,
                        "redacted": args_redacted || err_redacted || stdout_redacted || stderr_redacted,
                    })),
                );
                out.push_str(&format!("tool={tool_name}\n"));
                out.push_str(&format!("error:\n{}\n", truncate_chars(&err_text, 2000)));
                if !stdout.trim().is_empty() {
                    out.push_str(&format!("stdout:\n{stdout}\n"));
                }
                if !stderr.trim().is_empty() {
                    out.push_str(&format!("stderr:\n{stderr}\n"));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commander::{Commander, CommanderError, Update};
    use crate::config::tests_support::test_cfg;
    use crate::provider::{CompletionResponse, ProviderError};
    use autonous_storage::EVENT_AGENT_STARTED;
    use autonous_tools::{Limits, Ls, ToolPolicy};
    use std::sync::Arc;
    use std::time::Duration;

    struct SeqProvider {
        responses: Vec<CompletionResponse>,
        index: usize,
    }

    impl SeqProvider {
        fn new(contents: &[&str]) -> Self {
            Self {
                responses: contents
                    .iter()
                    .map(|content| CompletionResponse {
                        content: content.to_string(),
                        input_tokens: 1,
                        output_tokens: 1,
                    })
                    .collect(),
                index: 0,
            }
        }
    }

    impl ModelProvider for SeqProvider {
        fn chat_completion(
            &mut self,
            _messages: &[Message],
        ) -> Result<CompletionResponse, ProviderError> {
            if self.index >= self.responses.len() {
                return Ok(CompletionResponse {
                    content: r#"{"tool_calls":[],"final_answer":"done"}"#.to_string(),
                    input_tokens: 1,
                    output_tokens: 1,
                });
            }
            let response = self.responses[self.index].clone();
            self.index += 1;
            Ok(response)
        }
    }

    #[derive(Default)]
    struct CaptureCommander {
        last: String,
    }

    impl Commander for CaptureCommander {
        fn get_updates(
            &mut self,
            _offset: i64,
            _timeout_seconds: i64,
        ) -> Result<Vec<Update>, CommanderError> {
            Ok(Vec::new())
        }

        fn send_message(&mut self, _chat_id: i64, text: &str) -> Result<(), CommanderError> {
            self.last = text.to_string();
            Ok(())
        }
    }

    fn open_store(dir: &std::path::Path) -> Store {
        Store::open(dir.join("agent.db")).unwrap()
    }

    fn task(id: i64, text: &str) -> InboxTask {
        InboxTask {
            id,
            chat_id: 1,
            update_id: id,
            text: text.to_string(),
            attempts: 1,
            updated_at: 0,
        }
    }

    fn registry_with_ls(dir: &std::path::Path) -> Registry {
        let policy = Arc::new(ToolPolicy::new(dir.to_str().unwrap(), "").unwrap());
        let mut registry = Registry::new();
        registry
            .register(Box::new(Ls::new(
                policy,
                dir.to_str().unwrap(),
                Duration::from_secs(2),
                Limits {
                    max_lines: 100,
                    max_bytes: 4096,
                },
            )))
            .unwrap();
        registry
    }

    fn count_events(store: &Store, root: i64, event_type: &str) -> usize {
        store
            .subtree(root)
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    #[test]
    fn turn_limit_zero_records_limit_event() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(dir.path());
        let cfg = test_cfg(dir.path());
        let mut commander = CaptureCommander::default();
        let mut provider = SeqProvider::new(&[]);
        let policy = Policy {
            max_turns: 0,
            ..Policy::default()
        };
        let registry = Registry::new();
        let agent_id = store
            .log_event(None, EVENT_AGENT_STARTED, Some(&serde_json::json!({"task_id": 1})))
            .unwrap();

        let err = process_task(
            &store,
            &mut commander,
            &mut provider,
            &cfg,
            "sys",
            &policy,
            &registry,
            &task(1, "hello"),
            agent_id,
        )
        .unwrap_err();
        assert!(matches!(err, WorkerError::Limit(_)));
        assert_eq!(count_events(&store, agent_id, EVENT_CONTROL_LIMIT_REACHED), 1);
    }

    #[test]
    fn token_limit_records_limit_event() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(dir.path());
        let cfg = test_cfg(dir.path());
        let mut commander = CaptureCommander::default();
        let mut provider = SeqProvider::new(&[r#"{"tool_calls":[],"final_answer":"hi"}"#]);
        let policy = Policy {
            max_turns: 1,
            max_tokens: 1,
            ..Policy::default()
        };
        let registry = Registry::new();
        let agent_id = store
            .log_event(None, EVENT_AGENT_STARTED, Some(&serde_json::json!({"task_id": 2})))
            .unwrap();

        let err = process_task(
            &store,
            &mut commander,
            &mut provider,
            &cfg,
            "sys",
            &policy,
            &registry,
            &task(2, "hello"),
            agent_id,
        )
        .unwrap_err();
        assert!(matches!(err, WorkerError::Limit(_)));
        assert_eq!(count_events(&store, agent_id, EVENT_CONTROL_LIMIT_REACHED), 1);
    }

    #[test]
    fn extracts_final_answer_from_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(dir.path());
        let cfg = test_cfg(dir.path());
        let mut commander = CaptureCommander::default();
        let mut provider = SeqProvider::new(&[r#"{"tool_calls":[],"final_answer":"direct final"}"#]);
        let policy = Policy::default();
        let registry = Registry::new();
        let agent_id = store
            .log_event(None, EVENT_AGENT_STARTED, Some(&serde_json::json!({"task_id": 4})))
            .unwrap();

        process_task(
            &store,
            &mut commander,
            &mut provider,
            &cfg,
            "sys",
            &policy,
            &registry,
            &task(4, "hello"),
            agent_id,
        )
        .unwrap();
        assert_eq!(commander.last, "direct final");
        assert_eq!(count_events(&store, agent_id, EVENT_REPLY_SENT), 1);
    }

    #[test]
    fn tool_loop_runs_ls_then_answers() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello").unwrap();
        let store = open_store(dir.path());
        let cfg = test_cfg(dir.path());
        let mut commander = CaptureCommander::default();
        let mut provider = SeqProvider::new(&[
            r#"{"tool_calls":[{"name":"ls","arguments":{"path":"."}}],"final_answer":""}"#,
            r#"{"tool_calls":[],"final_answer":"tool done"}"#,
        ]);
        let policy = Policy {
            max_turns: 2,
            max_tokens: 1000,
            ..Policy::default()
        };
        let registry = registry_with_ls(dir.path());
        let agent_id = store
            .log_event(None, EVENT_AGENT_STARTED, Some(&serde_json::json!({"task_id": 3})))
            .unwrap();

        process_task(
            &store,
            &mut commander,
            &mut provider,
            &cfg,
            "sys",
            &policy,
            &registry,
            &task(3, "list files"),
            agent_id,
        )
        .unwrap();
        assert_eq!(commander.last, "tool done");
        assert_eq!(count_events(&store, agent_id, EVENT_TOOL_CALL_COMPLETED), 1);
        assert_eq!(count_events(&store, agent_id, EVENT_TURN_STARTED), 2);
    }

    #[test]
    fn tool_failure_then_recovery() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "ok").unwrap();
        let store = open_store(dir.path());
        let cfg = test_cfg(dir.path());
        let mut commander = CaptureCommander::default();
        let mut provider = SeqProvider::new(&[
            r#"{"tool_calls":[{"name":"ls","arguments":{"path":"missing.txt"}}],"final_answer":""}"#,
            r#"{"tool_calls":[{"name":"ls","arguments":{"path":"."}}],"final_answer":""}"#,
            r#"{"tool_calls":[],"final_answer":"recovered"}"#,
        ]);
        let policy = Policy {
            max_turns: 4,
            max_tokens: 1000,
            ..Policy::default()
        };
        let registry = registry_with_ls(dir.path());
        let agent_id = store
            .log_event(None, EVENT_AGENT_STARTED, Some(&serde_json::json!({"task_id": 5})))
            .unwrap();

        process_task(
            &store,
            &mut commander,
            &mut provider,
            &cfg,
            "sys",
            &policy,
            &registry,
            &task(5, "recover"),
            agent_id,
        )
        .unwrap();
        assert_eq!(commander.last, "recovered");
        assert!(count_events(&store, agent_id, EVENT_TOOL_CALL_FAILED) >= 1);
        assert!(count_events(&store, agent_id, EVENT_TOOL_CALL_COMPLETED) >= 1);
    }

    #[test]
    fn empty_final_answer_gets_one_reprompt() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(dir.path());
        let cfg = test_cfg(dir.path());
        let mut commander = CaptureCommander::default();
        let mut provider = SeqProvider::new(&[
            r#"{"tool_calls":[],"final_answer":""}"#,
            r#"{"tool_calls":[],"final_answer":"second try"}"#,
        ]);
        let policy = Policy {
            max_turns: 3,
            max_tokens: 1000,
            ..Policy::default()
        };
        let registry = Registry::new();
        let agent_id = store
            .log_event(None, EVENT_AGENT_STARTED, Some(&serde_json::json!({"task_id": 6})))
            .unwrap();

        process_task(
            &store,
            &mut commander,
            &mut provider,
            &cfg,
            "sys",
            &policy,
            &registry,
            &task(6, "answer me"),
            agent_id,
        )
        .unwrap();
        assert_eq!(commander.last, "second try");
    }

    #[test]
    fn non_protocol_reply_goes_out_verbatim() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(dir.path());
        let cfg = test_cfg(dir.path());
        let mut commander = CaptureCommander::default();
        let mut provider = SeqProvider::new(&["plain prose answer"]);
        let policy = Policy::default();
        let registry = Registry::new();
        let agent_id = store
            .log_event(None, EVENT_AGENT_STARTED, Some(&serde_json::json!({"task_id": 7})))
            .unwrap();

        process_task(
            &store,
            &mut commander,
            &mut provider,
            &cfg,
            "sys",
            &policy,
            &registry,
            &task(7, "hi"),
            agent_id,
        )
        .unwrap();
        assert_eq!(commander.last, "plain prose answer");
    }

    #[test]
    fn history_is_recorded_after_reply() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(dir.path());
        let cfg = test_cfg(dir.path());
        let mut commander = CaptureCommander::default();
        let mut provider = SeqProvider::new(&[r#"{"tool_calls":[],"final_answer":"noted"}"#]);
        let policy = Policy::default();
        let registry = Registry::new();
        let agent_id = store
            .log_event(None, EVENT_AGENT_STARTED, Some(&serde_json::json!({"task_id": 8})))
            .unwrap();

        process_task(
            &store,
            &mut commander,
            &mut provider,
            &cfg,
            "sys",
            &policy,
            &registry,
            &task(8, "remember this"),
            agent_id,
        )
        .unwrap();
        let history = store.get_history(1, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[0].text, "remember this");
        assert_eq!(history[1].role, "assistant");
        assert_eq!(history[1].text, "noted");
    }

    #[test]
    fn instruction_lists_registered_tools() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry_with_ls(dir.path());
        let instruction = build_tool_protocol_instruction(&registry, "/workspace,/state");
        assert!(instruction.contains("Available tools: ls."));
        assert!(instruction.contains("Allowed roots: /workspace,/state"));
        assert!(instruction.contains("final_answer"));
    }
}
