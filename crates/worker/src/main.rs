#![forbid(unsafe_code)]
//! autonous worker: polls the command source into the durable inbox,
//! claims tasks one at a time and runs them through the agent loop, with
//! retry/backoff, a per-error-class circuit breaker and progress-stall
//! detection. Operator `update`/`approve`/`cancel` commands are handled
//! before the agent ever sees them.

mod agent;
mod command;
mod commander;
mod config;
mod context;
mod error;
mod provider;
mod scripted;
mod update;

use autonous_core::{
    build_state_fingerprint, classify_error, no_progress, retry_backoff_seconds, should_retry,
    truncate_chars, CircuitBreaker, CircuitState, Policy,
};
use autonous_storage::{
    InboxTask, Store, EVENT_AGENT_COMPLETED, EVENT_AGENT_FAILED, EVENT_AGENT_STARTED,
    EVENT_CIRCUIT_CLOSED, EVENT_CIRCUIT_HALF_OPEN, EVENT_CIRCUIT_OPENED, EVENT_PROCESS_STARTED,
    EVENT_PROGRESS_STALLED, EVENT_RETRY_EXHAUSTED, EVENT_RETRY_SCHEDULED,
};
use autonous_tools::{Bash, Edit, Find, Grep, Limits, Ls, ReadTool, Registry, ToolPolicy, WriteTool};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

use commander::{Commander, Update};
use config::{load_system_prompt, WorkerConfig};
use error::WorkerError;
use provider::ModelProvider;
use scripted::{ScriptedCommander, ScriptedProvider};

const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);
const NO_PROGRESS_K: usize = 3;

fn log_line(message: &str) {
    eprintln!("[worker] {message}");
}

fn main() {
    if let Err(err) = run() {
        log_line(&err.to_string());
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = WorkerConfig::from_env()?;
    let mut store = Store::open(&cfg.db_path)?;

    let parent_id = (cfg.parent_process_id > 0).then_some(cfg.parent_process_id);
    let worker_event_id = match store.log_event(
        parent_id,
        EVENT_PROCESS_STARTED,
        Some(&json!({
            "role": "worker",
            "pid": std::process::id(),
            "provider": cfg.model_provider,
            "source": cfg.commander,
        })),
    ) {
        Ok(id) => id,
        Err(err) => {
            log_line(&format!("failed to log process.started: {err}"));
            0
        }
    };

    let (system_prompt, prompt_err) = load_system_prompt(&cfg);
    if let Some(err) = prompt_err {
        log_line(&format!("system prompt file unreadable: {err}"));
    }
    log_line(&format!(
        "system prompt source={} size={}",
        system_prompt.source, system_prompt.size
    ));

    let mut commander = new_commander(&cfg)?;
    let mut provider = new_provider(&cfg)?;

    let mut policy = Policy {
        max_turns: cfg.control_max_turns,
        max_wall_time: Duration::from_secs(cfg.control_max_wall_time_seconds as u64),
        max_tokens: cfg.control_max_tokens,
        max_retries: cfg.control_max_retries,
    };
    // The tool loop needs at least a second turn to report results.
    if policy.max_turns < 2 {
        policy.max_turns = 2;
    }
    let mut circuit = CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN);

    let registry = build_registry(&cfg)?;

    let mut offset = store.derive_offset()?;
    if offset == 0 && cfg.drop_pending {
        match bootstrap_offset(
            commander.as_mut(),
            cfg.pending_window_seconds,
            cfg.pending_max_messages,
        ) {
            Ok(bootstrapped) => offset = bootstrapped,
            Err(err) => log_line(&format!("bootstrap offset error: {err}")),
        }
    }

    log_line(&format!(
        "running id={} model={} provider={} source={}",
        cfg.worker_instance_id, cfg.model_name, cfg.model_provider, cfg.commander
    ));

    let mut handled_count: u64 = 0;

    loop {
        let prev_state = circuit.state();
        if !circuit.allow(Instant::now()) {
            std::thread::sleep(Duration::from_secs(cfg.sleep_seconds));
            continue;
        }
        if prev_state == CircuitState::Open && circuit.state() == CircuitState::HalfOpen {
            let _ = store.log_event(
                Some(worker_event_id),
                EVENT_CIRCUIT_HALF_OPEN,
                Some(&json!({"error_class": circuit.opened_class()})),
            );
        }

        let poll_timeout = if store.has_runnable_tasks(&policy, unix_now()).unwrap_or(false) {
            0
        } else {
            cfg.timeout
        };

        match commander.get_updates(offset, poll_timeout) {
            Ok(updates) => {
                if circuit.state() == CircuitState::HalfOpen
                    && circuit.opened_class() == "command_source_api"
                {
                    circuit.record_success();
                    let _ = store.log_event(
                        Some(worker_event_id),
                        EVENT_CIRCUIT_CLOSED,
                        Some(&json!({"recovered": true})),
                    );
                }
                for update in updates {
                    offset = update.update_id + 1;
                    let Some(message) = update.message else { continue };
                    let Some(text) = message.text else { continue };
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(err) =
                        store.enqueue_message(update.update_id, message.chat_id, &text, message.date)
                    {
                        log_line(&format!("enqueue error update_id={}: {err}", update.update_id));
                    }
                }
            }
            Err(err) => {
                log_line(&format!("get_updates error: {err}"));
                let error_class = classify_error(&err.to_string());
                record_failure_on_breaker(&store, &mut circuit, worker_event_id, error_class);
                std::thread::sleep(Duration::from_secs(cfg.sleep_seconds));
                continue;
            }
        }

        let task = match store.claim_next_task(&policy, unix_now()) {
            Ok(task) => task,
            Err(err) => {
                log_line(&format!("claim_next_task error: {err}"));
                std::thread::sleep(Duration::from_secs(cfg.sleep_seconds));
                continue;
            }
        };
        let Some(task) = task else {
            std::thread::sleep(Duration::from_secs(cfg.sleep_seconds));
            continue;
        };

        handled_count += 1;
        log_line(&format!(
            "process task_id={} chat_id={} text={}",
            task.id,
            task.chat_id,
            truncate_chars(&task.text, 200)
        ));

        match command::process_direct_command(
            &mut store,
            commander.as_mut(),
            &cfg,
            &task,
            worker_event_id,
        ) {
            Ok(outcome) if outcome.handled => {
                if let Err(err) = store.mark_task_done(task.id) {
                    log_line(&format!("mark done error task_id={}: {err}", task.id));
                }
                if !outcome.reply.is_empty() {
                    if let Err(err) = commander.send_message(task.chat_id, &outcome.reply) {
                        log_line(&format!("direct command notify failed: {err}"));
                    }
                }
                if outcome.should_exit {
                    log_line("exiting for deploy handoff");
                    std::process::exit(0);
                }
            }
            Ok(_) => {
                let agent_event_id = store
                    .log_event(
                        Some(worker_event_id),
                        EVENT_AGENT_STARTED,
                        Some(&json!({
                            "chat_id": task.chat_id,
                            "task_id": task.id,
                            "update_id": task.update_id,
                            "text": truncate_chars(&task.text, 1000),
                        })),
                    )
                    .unwrap_or(worker_event_id);

                let result = agent::process_task(
                    &store,
                    commander.as_mut(),
                    provider.as_mut(),
                    &cfg,
                    &system_prompt.text,
                    &policy,
                    &registry,
                    &task,
                    agent_event_id,
                );
                match result {
                    Ok(()) => {
                        let prev = circuit.state();
                        circuit.record_success();
                        if prev != CircuitState::Closed {
                            let _ = store.log_event(
                                Some(worker_event_id),
                                EVENT_CIRCUIT_CLOSED,
                                Some(&json!({"recovered": true})),
                            );
                        }
                        if let Err(err) = store.mark_task_done(task.id) {
                            log_line(&format!("mark done error task_id={}: {err}", task.id));
                        }
                        let _ = store.log_event(
                            Some(worker_event_id),
                            EVENT_AGENT_COMPLETED,
                            Some(&json!({"task_id": task.id})),
                        );
                    }
                    Err(err) => handle_task_failure(
                        &store,
                        commander.as_mut(),
                        &mut circuit,
                        &policy,
                        &cfg,
                        &task,
                        worker_event_id,
                        agent_event_id,
                        &err,
                    ),
                }
            }
            Err(err) => {
                log_line(&format!("direct command error task_id={}: {err}", task.id));
                if let Err(mark_err) = store.mark_task_failed(task.id, &err.to_string()) {
                    log_line(&format!("mark failed error task_id={}: {mark_err}", task.id));
                }
            }
        }

        if cfg.suicide_every > 0 && handled_count % cfg.suicide_every == 0 {
            log_line(&format!(
                "id={} handled {handled_count} messages; exiting intentionally",
                cfg.worker_instance_id
            ));
            std::process::exit(17);
        }
    }
}

fn new_commander(cfg: &WorkerConfig) -> Result<Box<dyn Commander>, Box<dyn std::error::Error>> {
    match cfg.commander.as_str() {
        "scripted" => Ok(Box::new(ScriptedCommander::new(
            &cfg.commander_script,
            &cfg.commander_send_script,
        )?)),
        other => Err(format!("unsupported commander: {other}").into()),
    }
}

fn new_provider(cfg: &WorkerConfig) -> Result<Box<dyn ModelProvider>, Box<dyn std::error::Error>> {
    match cfg.model_provider.as_str() {
        "scripted" => Ok(Box::new(ScriptedProvider::new(&cfg.provider_script)?)),
        other => Err(format!("unsupported model provider: {other}").into()),
    }
}

fn build_registry(cfg: &WorkerConfig) -> Result<Registry, Box<dyn std::error::Error>> {
    let policy = Arc::new(ToolPolicy::new(
        &cfg.tool_allowed_roots,
        &cfg.tool_bash_denylist,
    )?);
    let timeout = Duration::from_secs(cfg.tool_timeout_seconds);
    let limits = Limits {
        max_lines: cfg.tool_max_output_lines,
        max_bytes: cfg.tool_max_output_bytes,
    };
    let base = cfg.workspace_dir.clone();
    let mut registry = Registry::new();
    registry.register(Box::new(Ls::new(policy.clone(), base.clone(), timeout, limits)))?;
    registry.register(Box::new(Find::new(policy.clone(), base.clone(), timeout, limits)))?;
    registry.register(Box::new(Grep::new(policy.clone(), base.clone(), timeout, limits)))?;
    registry.register(Box::new(ReadTool::new(policy.clone(), base.clone(), timeout, limits)))?;
    registry.register(Box::new(WriteTool::new(policy.clone(), base.clone(), timeout, limits)))?;
    registry.register(Box::new(Edit::new(policy.clone(), base.clone(), timeout, limits)))?;
    registry.register(Box::new(Bash::new(policy, base, timeout, limits)))?;
    Ok(registry)
}

/// First-run offset bootstrap: drop everything older than the pending
/// window, keep at most `pending_max` of the remainder, and start at the
/// oldest kept update.
fn bootstrap_offset(
    commander: &mut dyn Commander,
    pending_window_seconds: i64,
    pending_max: usize,
) -> Result<i64, WorkerError> {
    let updates = commander.get_updates(0, 0)?;
    if updates.is_empty() {
        return Ok(0);
    }
    let cutoff = unix_now() - pending_window_seconds;
    let in_window: Vec<&Update> = updates
        .iter()
        .filter(|u| u.message.as_ref().is_some_and(|m| m.date >= cutoff))
        .collect();
    if in_window.is_empty() {
        return Ok(updates[updates.len() - 1].update_id + 1);
    }
    let kept = if in_window.len() > pending_max {
        &in_window[in_window.len() - pending_max..]
    } else {
        &in_window[..]
    };
    Ok(kept[0].update_id)
}

fn record_failure_on_breaker(
    store: &Store,
    circuit: &mut CircuitBreaker,
    worker_event_id: i64,
    error_class: &str,
) {
    let prev = circuit.state();
    circuit.record_failure(error_class, Instant::now());
    if prev != CircuitState::Open && circuit.state() == CircuitState::Open {
        let _ = store.log_event(
            Some(worker_event_id),
            EVENT_CIRCUIT_OPENED,
            Some(&json!({
                "error_class": error_class,
                "threshold": circuit.threshold,
                "cooldown_seconds": circuit.cooldown.as_secs(),
            })),
        );
    }
}

/// Failure bookkeeping for one attempt: fail the row, feed the breaker,
/// decide retry vs. stall vs. exhaustion, and tell the user.
#[allow(clippy::too_many_arguments)]
fn handle_task_failure(
    store: &Store,
    commander: &mut dyn Commander,
    circuit: &mut CircuitBreaker,
    policy: &Policy,
    cfg: &WorkerConfig,
    task: &InboxTask,
    worker_event_id: i64,
    agent_event_id: i64,
    err: &WorkerError,
) {
    let message = err.to_string();
    if let Err(mark_err) = store.mark_task_failed(task.id, &message) {
        log_line(&format!("mark failed error task_id={}: {mark_err}", task.id));
    }
    let error_class = classify_error(&message);
    record_failure_on_breaker(store, circuit, worker_event_id, error_class);

    if should_retry(policy, task.attempts) {
        let history_count = store.history_count(task.chat_id).unwrap_or(0);
        let fingerprint = build_state_fingerprint(
            task.id,
            history_count,
            cfg.history_window,
            error_class,
            "",
        );
        if progress_stalled(store, task.id, &fingerprint, NO_PROGRESS_K) {
            let _ = store.log_event(
                Some(agent_event_id),
                EVENT_PROGRESS_STALLED,
                Some(&json!({
                    "task_id": task.id,
                    "k": NO_PROGRESS_K,
                    "state_fingerprint": fingerprint,
                })),
            );
            if let Err(mark_err) =
                store.mark_task_exhausted(task.id, &message, policy.max_retries)
            {
                log_line(&format!("mark exhausted error task_id={}: {mark_err}", task.id));
            }
            let _ = store.log_event(
                Some(worker_event_id),
                EVENT_RETRY_EXHAUSTED,
                Some(&json!({
                    "task_id": task.id,
                    "attempts": task.attempts,
                    "last_error_class": error_class,
                })),
            );
        } else {
            let backoff = retry_backoff_seconds(task.attempts);
            let _ = store.log_event(
                Some(worker_event_id),
                EVENT_RETRY_SCHEDULED,
                Some(&json!({
                    "task_id": task.id,
                    "attempt": task.attempts,
                    "backoff_seconds": backoff,
                    "error_class": error_class,
                    "state_fingerprint": fingerprint,
                })),
            );
        }
    } else {
        let backoff = retry_backoff_seconds(task.attempts);
        let _ = store.log_event(
            Some(worker_event_id),
            EVENT_RETRY_EXHAUSTED,
            Some(&json!({
                "task_id": task.id,
                "attempts": task.attempts,
                "last_error_class": error_class,
                "last_backoff": backoff,
            })),
        );
    }

    let _ = store.log_event(
        Some(worker_event_id),
        EVENT_AGENT_FAILED,
        Some(&json!({
            "task_id": task.id,
            "error": truncate_chars(&message, 1000),
        })),
    );

    let notify = format!("任务处理失败：{}", truncate_chars(&message, 600));
    if let Err(send_err) = commander.send_message(task.chat_id, &notify) {
        log_line(&format!(
            "task {} failed to notify chat_id={}: {send_err}",
            task.id, task.chat_id
        ));
    }
    log_line(&format!("task {} failed: {message}", task.id));
}

/// Stall verdict: the last `k` fingerprints for this task (the recorded
/// ones plus the current) are identical.
fn progress_stalled(store: &Store, task_id: i64, current: &str, k: usize) -> bool {
    if k <= 1 {
        return false;
    }
    let previous = store.recent_fingerprints(task_id, k - 1).unwrap_or_default();
    let mut fingerprints: Vec<&str> = previous.iter().map(String::as_str).collect();
    fingerprints.push(current);
    no_progress(&fingerprints, k)
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
