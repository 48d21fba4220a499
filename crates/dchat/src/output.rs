use dchat_core::{ChatSession, DecryptedMessageEvent, ErrorKind, ErrorNotice};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

/// Something that happened while a script ran. JSON mode prints one
/// `{"event": .., "data": ..}` line per event.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Event<'a> {
    #[serde(rename_all = "camelCase")]
    TransportRequest {
        id: &'a str,
        name: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        subject_id: Option<&'a str>,
        acknowledged: bool,
    },
    SessionOpened(&'a ChatSession),
    SessionUpdated {
        session: &'a ChatSession,
        message: &'a DecryptedMessageEvent,
    },
    ErrorRaised(&'a ErrorNotice),
    Sessions(&'a [ChatSession]),
    StepError {
        line: usize,
        op: &'a str,
        error: &'a str,
    },
}

impl Event<'_> {
    fn human(&self) -> String {
        match self {
            Event::TransportRequest {
                name,
                subject_id,
                acknowledged,
                ..
            } => {
                let subject = subject_id.map(|id| format!(" {id}")).unwrap_or_default();
                let status = if *acknowledged { "" } else { " (failed)" };
                format!("-> {name}{subject}{status}")
            }
            Event::SessionOpened(session) => format!("opened {}", session_label(session)),
            Event::SessionUpdated { session, message } => format!(
                "{} {}: {}",
                session_label(session),
                message.sender_id,
                message.plaintext
            ),
            Event::ErrorRaised(notice) => {
                let kind = match notice.kind {
                    ErrorKind::Transport => "transport",
                    ErrorKind::MalformedEvent => "malformed",
                };
                format!("! {kind}: {notice}")
            }
            Event::Sessions(sessions) if sessions.is_empty() => "no sessions".to_string(),
            Event::Sessions(sessions) => sessions
                .iter()
                .map(|s| {
                    let last = s.last_message.as_deref().unwrap_or("-");
                    format!("  {} {last}", session_label(s))
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Event::StepError { line, op, error } => format!("line {line} {op} failed: {error}"),
        }
    }
}

fn session_label(session: &ChatSession) -> String {
    format!("{} [{}]", session.display_name, session.id)
}

#[derive(Serialize)]
struct JsonResponse<'a, T: Serialize> {
    status: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Lines written by a capturing [`Output`], stdout and stderr interleaved.
pub type Captured = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone)]
enum Sink {
    Stdio,
    #[cfg_attr(not(test), allow(dead_code))]
    Capture(Captured),
}

/// Human-readable or JSON output for commands and script events
#[derive(Debug, Clone)]
pub struct Output {
    json: bool,
    sink: Sink,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            sink: Sink::Stdio,
        }
    }

    /// Output that records lines instead of printing them.
    #[cfg(test)]
    pub fn capture(json: bool) -> (Self, Captured) {
        let lines = Captured::default();
        (
            Self {
                json,
                sink: Sink::Capture(lines.clone()),
            },
            lines,
        )
    }

    /// Final result of a command
    pub fn success<T: Serialize>(&self, command: &str, data: T) {
        let line = if self.json {
            to_json(&JsonResponse {
                status: "ok",
                command,
                data: Some(data),
                error: None,
            })
        } else {
            serde_json::to_string_pretty(&data)
                .unwrap_or_else(|e| format!("<unprintable {command} result: {e}>"))
        };
        self.write(line, false);
    }

    pub fn success_message(&self, command: &str, message: &str) {
        if self.json {
            self.success(command, serde_json::json!({ "message": message }));
        } else {
            self.write(message.to_string(), false);
        }
    }

    pub fn error(&self, message: &str) {
        let line = if self.json {
            to_json(&JsonResponse::<()> {
                status: "error",
                command: "",
                data: None,
                error: Some(message),
            })
        } else {
            format!("Error: {message}")
        };
        self.write(line, true);
    }

    pub fn event(&self, event: Event<'_>) {
        let line = if self.json {
            to_json(&event)
        } else {
            event.human()
        };
        self.write(line, false);
    }

    fn write(&self, line: String, to_stderr: bool) {
        match &self.sink {
            Sink::Stdio if to_stderr => eprintln!("{line}"),
            Sink::Stdio => println!("{line}"),
            Sink::Capture(lines) => lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(line),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        serde_json::json!({ "status": "error", "error": format!("unserializable output: {e}") })
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dchat_core::ConversationTarget;

    fn group_session() -> ChatSession {
        let mut session = ChatSession::new(
            "g1".to_string(),
            "Group g1".to_string(),
            ConversationTarget::group("g1"),
        );
        session.last_message = Some("hi".to_string());
        session
    }

    fn message() -> DecryptedMessageEvent {
        DecryptedMessageEvent {
            conversation_id: "g1".to_string(),
            sender_id: "bob".to_string(),
            timestamp_iso: "2024-01-01T00:00:01Z".to_string(),
            plaintext: "hi".to_string(),
            is_group: true,
            subject: String::new(),
        }
    }

    fn lines(captured: &Captured) -> Vec<String> {
        captured.lock().unwrap().clone()
    }

    #[test]
    fn test_json_events_are_tagged_lines() {
        let (output, captured) = Output::capture(true);
        output.event(Event::TransportRequest {
            id: "loop-1",
            name: "groupJoinRequested",
            subject_id: Some("g1"),
            acknowledged: true,
        });
        let session = group_session();
        let message = message();
        output.event(Event::SessionUpdated {
            session: &session,
            message: &message,
        });
        output.event(Event::StepError {
            line: 4,
            op: "send",
            error: "Unknown group: g9",
        });

        let lines = lines(&captured);
        assert_eq!(
            lines[0],
            r#"{"event":"transportRequest","data":{"id":"loop-1","name":"groupJoinRequested","subjectId":"g1","acknowledged":true}}"#
        );
        let updated: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(updated["event"], "sessionUpdated");
        assert_eq!(updated["data"]["session"]["isGroup"], true);
        assert_eq!(updated["data"]["message"]["senderId"], "bob");
        let step: serde_json::Value = serde_json::from_str(&lines[2]).unwrap();
        assert_eq!(step["event"], "stepError");
        assert_eq!(step["data"]["line"], 4);
    }

    #[test]
    fn test_human_events_are_one_liners() {
        let (output, captured) = Output::capture(false);
        let session = group_session();
        let message = message();
        output.event(Event::TransportRequest {
            id: "loop-2",
            name: "directJoinRequested",
            subject_id: Some("bob"),
            acknowledged: false,
        });
        output.event(Event::SessionOpened(&session));
        output.event(Event::SessionUpdated {
            session: &session,
            message: &message,
        });
        output.event(Event::ErrorRaised(&ErrorNotice {
            kind: ErrorKind::Transport,
            message: "link down".to_string(),
            timestamp_iso: None,
        }));
        output.event(Event::Sessions(&[]));

        assert_eq!(
            lines(&captured),
            vec![
                "-> directJoinRequested bob (failed)",
                "opened Group g1 [g1]",
                "Group g1 [g1] bob: hi",
                "! transport: link down",
                "no sessions",
            ]
        );
    }

    #[test]
    fn test_results_and_errors() {
        let (output, captured) = Output::capture(true);
        output.success_message("reset", "Identity cleared");
        output.error("No local identity");
        assert_eq!(
            lines(&captured),
            vec![
                r#"{"status":"ok","command":"reset","data":{"message":"Identity cleared"}}"#,
                r#"{"status":"error","error":"No local identity"}"#,
            ]
        );

        let (human, captured) = Output::capture(false);
        human.error("boom");
        assert_eq!(lines(&captured), vec!["Error: boom"]);
    }
}
