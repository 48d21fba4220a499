use anyhow::{Context, Result};
use base64::Engine;
use dchat_core::{
    ChatCore, ChatSession, ConversationTarget, CoreNotification, DecryptedMessageEvent, Pending,
};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use crate::config::Config;
use crate::loopback::LoopbackTransport;
use crate::output::{Event, Output};

/// One line of a replay script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ScriptStep {
    #[serde(rename_all = "camelCase")]
    SetNickname { nickname: String },
    #[serde(rename_all = "camelCase")]
    SetLocalId { local_id: String },
    /// Keys are base64
    #[serde(rename_all = "camelCase")]
    SetKeyPair {
        private_key: String,
        public_key: String,
    },
    #[serde(rename_all = "camelCase")]
    AddFriend { peer_id: String, public_key: String },
    #[serde(rename_all = "camelCase")]
    AddGroup {
        group_id: String,
        symmetric_key: String,
    },
    #[serde(rename_all = "camelCase")]
    StartDirect { peer_id: String },
    #[serde(rename_all = "camelCase")]
    JoinGroup { group_id: String },
    #[serde(rename_all = "camelCase")]
    Send {
        target: ConversationTarget,
        plaintext: String,
    },
    #[serde(rename_all = "camelCase")]
    SendToSession {
        conversation_id: String,
        plaintext: String,
    },
    /// Inbound decrypted message, fields inline
    Deliver(DecryptedMessageEvent),
    #[serde(rename_all = "camelCase")]
    TransportError {
        message: String,
        #[serde(default)]
        timestamp_iso: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveSession { conversation_id: String },
    Sessions,
    /// Make the loopback transport fail requests for a peer or group
    #[serde(rename_all = "camelCase")]
    Unreachable {
        id: String,
        #[serde(default = "default_true")]
        unreachable: bool,
    },
}

fn default_true() -> bool {
    true
}

impl ScriptStep {
    fn op(&self) -> &'static str {
        match self {
            ScriptStep::SetNickname { .. } => "setNickname",
            ScriptStep::SetLocalId { .. } => "setLocalId",
            ScriptStep::SetKeyPair { .. } => "setKeyPair",
            ScriptStep::AddFriend { .. } => "addFriend",
            ScriptStep::AddGroup { .. } => "addGroup",
            ScriptStep::StartDirect { .. } => "startDirect",
            ScriptStep::JoinGroup { .. } => "joinGroup",
            ScriptStep::Send { .. } => "send",
            ScriptStep::SendToSession { .. } => "sendToSession",
            ScriptStep::Deliver(_) => "deliver",
            ScriptStep::TransportError { .. } => "transportError",
            ScriptStep::RemoveSession { .. } => "removeSession",
            ScriptStep::Sessions => "sessions",
            ScriptStep::Unreachable { .. } => "unreachable",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub steps: usize,
    pub failed: usize,
    pub sessions: Vec<ChatSession>,
}

/// Parse a JSON-lines script. Blank lines and `#` comments are skipped.
pub fn parse_steps(reader: impl BufRead) -> Result<Vec<(usize, ScriptStep)>> {
    let mut steps = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("Failed to read script line {line_no}"))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let step: ScriptStep = serde_json::from_str(trimmed)
            .with_context(|| format!("Invalid step on line {line_no}"))?;
        steps.push((line_no, step));
    }
    Ok(steps)
}

/// Replay a script file ("-" for stdin) against a fresh core
pub fn run(script: &str, fail_fast: bool, config: &Config, output: &Output) -> Result<()> {
    let steps = if script == "-" {
        parse_steps(std::io::stdin().lock())?
    } else {
        let file = std::fs::File::open(script)
            .with_context(|| format!("Failed to open script {script}"))?;
        parse_steps(BufReader::new(file))?
    };

    let summary = replay(&steps, fail_fast, config, output)?;
    output.success("run", summary);
    Ok(())
}

pub fn replay(
    steps: &[(usize, ScriptStep)],
    fail_fast: bool,
    config: &Config,
    output: &Output,
) -> Result<RunSummary> {
    let transport = Arc::new(LoopbackTransport::new(output.clone()));
    let core = ChatCore::with_options(transport.clone(), config.core_options())?;
    let (subscription, notifications) = core.subscribe_channel();
    tracing::debug!(steps = steps.len(), local_id = %core.current_identity().id, "replaying script");

    let mut failed = 0;
    for (line, step) in steps {
        let result = execute(&core, &transport, step, output);
        drain(&notifications, output);
        if let Err(e) = result {
            if fail_fast {
                core.shutdown();
                return Err(e.context(format!("Step {} on line {line} failed", step.op())));
            }
            failed += 1;
            output.event(Event::StepError {
                line: *line,
                op: step.op(),
                error: &format!("{e:#}"),
            });
        }
    }

    let summary = RunSummary {
        steps: steps.len(),
        failed,
        sessions: core.sessions(),
    };
    subscription.unsubscribe();
    core.shutdown();
    Ok(summary)
}

fn execute(
    core: &ChatCore,
    transport: &LoopbackTransport,
    step: &ScriptStep,
    output: &Output,
) -> Result<()> {
    match step {
        ScriptStep::SetNickname { nickname } => {
            core.set_nickname(nickname)?;
        }
        ScriptStep::SetLocalId { local_id } => {
            core.set_local_id(local_id)?;
        }
        ScriptStep::SetKeyPair {
            private_key,
            public_key,
        } => {
            core.set_local_key_pair(&decode_key(private_key)?, &decode_key(public_key)?)?;
        }
        ScriptStep::AddFriend {
            peer_id,
            public_key,
        } => {
            core.add_friend(peer_id, &decode_key(public_key)?)?;
        }
        ScriptStep::AddGroup {
            group_id,
            symmetric_key,
        } => {
            core.add_group(group_id, &decode_key(symmetric_key)?)?;
        }
        ScriptStep::StartDirect { peer_id } => {
            let (session, pending) = core.start_direct(peer_id)?;
            output.event(Event::SessionOpened(&session));
            settle(pending)?;
        }
        ScriptStep::JoinGroup { group_id } => {
            let (session, pending) = core.join_group(group_id)?;
            output.event(Event::SessionOpened(&session));
            settle(pending)?;
        }
        ScriptStep::Send { target, plaintext } => {
            settle(core.send(target, plaintext)?)?;
        }
        ScriptStep::SendToSession {
            conversation_id,
            plaintext,
        } => {
            settle(core.send_to_session(conversation_id, plaintext)?)?;
        }
        ScriptStep::Deliver(message) => {
            core.inbound_sender().decrypted_message(message.clone())?;
            core.process_pending()?;
        }
        ScriptStep::TransportError {
            message,
            timestamp_iso,
        } => {
            core.inbound_sender()
                .transport_error(message.clone(), timestamp_iso.clone())?;
            core.process_pending()?;
        }
        ScriptStep::RemoveSession { conversation_id } => {
            let removed = core.remove_session(conversation_id)?;
            if !removed {
                anyhow::bail!("No session {conversation_id}");
            }
        }
        ScriptStep::Sessions => {
            output.event(Event::Sessions(&core.sessions()));
        }
        ScriptStep::Unreachable { id, unreachable } => {
            transport.set_unreachable(id, *unreachable);
        }
    }
    Ok(())
}

fn decode_key(encoded: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("Key is not valid base64")
}

fn settle(pending: Pending) -> Result<()> {
    let id = pending.id().to_string();
    pending
        .wait()
        .with_context(|| format!("Transport request {id} failed"))
}

fn drain(notifications: &Receiver<CoreNotification>, output: &Output) {
    for notification in notifications.try_iter() {
        match notification {
            CoreNotification::SessionUpdated { session, message } => {
                output.event(Event::SessionUpdated {
                    session: &session,
                    message: &message,
                })
            }
            CoreNotification::ErrorRaised(notice) => output.event(Event::ErrorRaised(&notice)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> (TempDir, Config) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        config.local_id = Some("alice".to_string());
        (temp, config)
    }

    const SCRIPT: &str = r#"
# alice talks to bob and a group
{"op":"setKeyPair","privateKey":"c2s=","publicKey":"cGs="}
{"op":"addFriend","peerId":"bob","publicKey":"Ym9icGs="}
{"op":"addGroup","groupId":"g1","symmetricKey":"c3lt"}
{"op":"startDirect","peerId":"bob"}
{"op":"joinGroup","groupId":"g1"}
{"op":"deliver","conversationId":"g1","senderId":"carol","timestampIso":"2024-01-01T00:00:05Z","plaintext":"late","isGroup":true}
{"op":"deliver","conversationId":"g1","senderId":"dave","timestampIso":"2024-01-01T00:00:01Z","plaintext":"early","isGroup":true}
{"op":"send","target":{"kind":"group","groupId":"g1"},"plaintext":"hi all"}
{"op":"sessions"}
"#;

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let steps = parse_steps(SCRIPT.as_bytes()).unwrap();
        assert_eq!(steps.len(), 9);
        assert_eq!(steps[0].0, 3);
        assert_eq!(
            steps[3].1,
            ScriptStep::StartDirect {
                peer_id: "bob".to_string()
            }
        );
        assert!(matches!(&steps[5].1, ScriptStep::Deliver(m) if m.sender_id == "carol"));
        assert_eq!(steps[8].1, ScriptStep::Sessions);
    }

    #[test]
    fn test_parse_reports_bad_line() {
        let err = parse_steps("{\"op\":\"sessions\"}\n{\"op\":\"nope\"}\n".as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn test_replay_builds_sessions() {
        let (_temp, config) = config();
        let steps = parse_steps(SCRIPT.as_bytes()).unwrap();
        let (output, captured) = Output::capture(true);
        let summary = replay(&steps, true, &config, &output).unwrap();

        assert_eq!(summary.failed, 0);
        let events: Vec<String> = captured
            .lock()
            .unwrap()
            .iter()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["event"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(events.first().map(String::as_str), Some("transportRequest"));
        assert_eq!(events.last().map(String::as_str), Some("sessions"));
        assert_eq!(summary.sessions.len(), 2);
        let direct = &summary.sessions[0];
        assert_eq!(
            direct.id,
            dchat_core::resolve_direct("alice", "bob").unwrap()
        );
        let group = &summary.sessions[1];
        assert_eq!(group.id, "g1");
        assert_eq!(group.last_message.as_deref(), Some("late"));
    }

    #[test]
    fn test_failures_are_counted_unless_fail_fast() {
        let (_temp, config) = config();
        let script = r#"
{"op":"startDirect","peerId":"carol"}
{"op":"addGroup","groupId":"g1","symmetricKey":"c3lt"}
{"op":"unreachable","id":"g1"}
{"op":"joinGroup","groupId":"g1"}
{"op":"removeSession","conversationId":"missing"}
"#;
        let steps = parse_steps(script.as_bytes()).unwrap();

        let (output, captured) = Output::capture(false);
        let summary = replay(&steps, false, &config, &output).unwrap();
        assert_eq!(summary.steps, 5);
        assert_eq!(summary.failed, 3);
        // session exists even though the join request failed
        assert_eq!(summary.sessions.len(), 1);
        let lines = captured.lock().unwrap().clone();
        assert_eq!(lines[0], "line 2 startDirect failed: Unknown peer: carol");
        assert!(lines.contains(&"-> groupJoinRequested g1 (failed)".to_string()));
        assert!(lines
            .iter()
            .any(|l| l.starts_with("line 6 removeSession failed:")));

        let (output, _captured) = Output::capture(true);
        let err = replay(&steps, true, &config, &output).unwrap_err();
        assert!(format!("{err:#}").contains("startDirect"));
    }

    #[test]
    fn test_bad_base64_key_fails_step() {
        let (_temp, config) = config();
        let steps =
            parse_steps(r#"{"op":"addFriend","peerId":"bob","publicKey":"***"}"#.as_bytes()).unwrap();
        let summary = replay(&steps, false, &config, &Output::capture(true).0).unwrap();
        assert_eq!(summary.failed, 1);
    }
}
