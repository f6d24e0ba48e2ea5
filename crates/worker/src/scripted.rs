#![forbid(unsafe_code)]
//! Deterministic commander/provider doubles driven by action scripts.
//!
//! A script is a comma-separated action list: `ok`, `err:<class>`,
//! `sleep:<ms>`, `msg:<text>`, `msgb64:<base64>`. The last action repeats
//! once the script is exhausted, so a single `err:` makes a provider fail
//! on every call. `msgb64` exists because protocol JSON contains commas.

use crate::commander::{Commander, CommanderError, IncomingMessage, Update};
use crate::provider::{CompletionResponse, Message, ModelProvider, ProviderError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::Engine;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Action {
    Ok,
    Err(String),
    Sleep(u64),
    Msg(String),
}

fn parse_script(script: &str) -> Result<Vec<Action>, String> {
    if script.trim().is_empty() {
        return Ok(vec![Action::Ok]);
    }
    let mut actions = Vec::new();
    for token in script.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token == "ok" {
            actions.push(Action::Ok);
        } else if let Some(arg) = token.strip_prefix("err:") {
            actions.push(Action::Err(arg.to_string()));
        } else if let Some(arg) = token.strip_prefix("sleep:") {
            let ms = arg.parse::<u64>().map_err(|_| format!("invalid sleep ms: {arg}"))?;
            actions.push(Action::Sleep(ms));
        } else if let Some(arg) = token.strip_prefix("msg:") {
            actions.push(Action::Msg(arg.to_string()));
        } else if let Some(arg) = token.strip_prefix("msgb64:") {
            let raw = BASE64
                .decode(arg)
                .map_err(|err| format!("msgb64 decode failed: {err}"))?;
            let text = String::from_utf8(raw).map_err(|err| format!("msgb64 not utf-8: {err}"))?;
            actions.push(Action::Msg(text));
        } else {
            return Err(format!("invalid scripted action: {token}"));
        }
    }
    if actions.is_empty() {
        actions.push(Action::Ok);
    }
    Ok(actions)
}

#[derive(Debug)]
struct ScriptRunner {
    actions: Vec<Action>,
    index: usize,
}

impl ScriptRunner {
    fn new(script: &str) -> Result<Self, String> {
        Ok(Self {
            actions: parse_script(script)?,
            index: 0,
        })
    }

    fn next(&mut self) -> Action {
        if self.index >= self.actions.len() {
            return self.actions.last().cloned().unwrap_or(Action::Ok);
        }
        let action = self.actions[self.index].clone();
        self.index += 1;
        action
    }
}

fn empty_as(v: &str, fallback: &str) -> String {
    if v.trim().is_empty() {
        fallback.to_string()
    } else {
        v.to_string()
    }
}

pub struct ScriptedCommander {
    poll: ScriptRunner,
    send: ScriptRunner,
    update_id: i64,
}

impl ScriptedCommander {
    pub fn new(poll_script: &str, send_script: &str) -> Result<Self, String> {
        Ok(Self {
            poll: ScriptRunner::new(poll_script)?,
            send: ScriptRunner::new(send_script)?,
            update_id: 1,
        })
    }
}

impl Commander for ScriptedCommander {
    fn get_updates(
        &mut self,
        _offset: i64,
        _timeout_seconds: i64,
    ) -> Result<Vec<Update>, CommanderError> {
        match self.poll.next() {
            Action::Ok => Ok(Vec::new()),
            Action::Err(class) => Err(CommanderError(format!(
                "scripted commander error class={}",
                empty_as(&class, "command_source_api")
            ))),
            Action::Sleep(ms) => {
                std::thread::sleep(std::time::Duration::from_millis(ms));
                Ok(Vec::new())
            }
            Action::Msg(text) => {
                self.update_id += 1;
                Ok(vec![Update {
                    update_id: self.update_id,
                    message: Some(IncomingMessage {
                        chat_id: 1,
                        text: Some(text),
                        date: unix_now(),
                    }),
                }])
            }
        }
    }

    fn send_message(&mut self, _chat_id: i64, _text: &str) -> Result<(), CommanderError> {
        match self.send.next() {
            Action::Err(class) => Err(CommanderError(format!(
                "scripted commander send error class={}",
                empty_as(&class, "command_source_api")
            ))),
            Action::Sleep(ms) => {
                std::thread::sleep(std::time::Duration::from_millis(ms));
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

pub struct ScriptedProvider {
    script: ScriptRunner,
}

impl ScriptedProvider {
    pub fn new(script: &str) -> Result<Self, String> {
        Ok(Self {
            script: ScriptRunner::new(script)?,
        })
    }
}

impl ModelProvider for ScriptedProvider {
    fn chat_completion(
        &mut self,
        _messages: &[Message],
    ) -> Result<CompletionResponse, ProviderError> {
        match self.script.next() {
            Action::Ok => Ok(CompletionResponse {
                content: "scripted-ok".to_string(),
                input_tokens: 1,
                output_tokens: 1,
            }),
            Action::Err(class) => Err(ProviderError(format!(
                "scripted provider error class={}",
                empty_as(&class, "provider_api")
            ))),
            Action::Sleep(ms) => {
                std::thread::sleep(std::time::Duration::from_millis(ms));
                Ok(CompletionResponse {
                    content: "scripted-after-sleep".to_string(),
                    input_tokens: 1,
                    output_tokens: 1,
                })
            }
            Action::Msg(text) => Ok(CompletionResponse {
                content: text,
                input_tokens: 1,
                output_tokens: 1,
            }),
        }
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_script_defaults_to_ok() {
        let mut provider = ScriptedProvider::new("").unwrap();
        let resp = provider.chat_completion(&[]).unwrap();
        assert_eq!(resp.content, "scripted-ok");
    }

    #[test]
    fn invalid_action_is_rejected() {
        assert!(ScriptedProvider::new("explode").is_err());
        assert!(ScriptedCommander::new("ok", "boom:1").is_err());
    }

    #[test]
    fn last_action_repeats() {
        let mut provider = ScriptedProvider::new("msg:a,err:provider_api").unwrap();
        assert_eq!(provider.chat_completion(&[]).unwrap().content, "a");
        assert!(provider.chat_completion(&[]).is_err());
        assert!(provider.chat_completion(&[]).is_err());
    }

    #[test]
    fn msgb64_carries_commas() {
        let payload = r#"{"tool_calls":[],"final_answer":"hi"}"#;
        let encoded = BASE64.encode(payload);
        let mut provider = ScriptedProvider::new(&format!("msgb64:{encoded}")).unwrap();
        assert_eq!(provider.chat_completion(&[]).unwrap().content, payload);
    }

    #[test]
    fn commander_msg_allocates_update_ids() {
        let mut commander = ScriptedCommander::new("msg:hello,msg:again", "ok").unwrap();
        let first = commander.get_updates(0, 0).unwrap();
        let second = commander.get_updates(0, 0).unwrap();
        assert_eq!(first[0].update_id + 1, second[0].update_id);
        assert_eq!(
            first[0].message.as_ref().unwrap().text.as_deref(),
            Some("hello")
        );
    }

    #[test]
    fn commander_err_mentions_commander_for_classification() {
        let mut commander = ScriptedCommander::new("err:", "ok").unwrap();
        let err = commander.get_updates(0, 0).unwrap_err();
        assert_eq!(
            autonous_core::classify_error(&err.to_string()),
            "command_source_api"
        );
    }
}
