//! Terminal rendering of session state, transcript and tool activity.

use chrono::{DateTime, Utc};
use voice_session_core::{
    Role, SessionHandle, SessionState, SessionStatus, ToolInvocation, TranscriptEntry,
};

/// Turns transcript snapshots into printable lines without repeating itself.
///
/// An entry is printed once it is final or once a newer entry follows it.
/// A trailing assistant entry that changes after being printed is printed
/// again. A new session id or a different first entry starts over, even when
/// the snapshot of the cleared transcript was never observed.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    session_id: Option<String>,
    first: Option<DateTime<Utc>>,
    shown: usize,
    last: Option<String>,
}

impl TranscriptPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&mut self, session_id: Option<&str>, entries: &[TranscriptEntry]) -> Vec<String> {
        let first = entries.first().map(|e| e.timestamp);
        let new_session = session_id.is_some() && self.session_id.as_deref() != session_id;
        let new_transcript = self.first.is_some() && first.is_some() && self.first != first;
        if new_session || new_transcript || entries.len() < self.shown {
            self.shown = 0;
            self.last = None;
        }
        if session_id.is_some() {
            self.session_id = session_id.map(String::from);
        }
        self.first = first;

        let mut lines = Vec::new();
        if let Some(entry) = self.shown.checked_sub(1).map(|i| &entries[i]) {
            if self.last.as_deref() != Some(entry.content.as_str()) {
                lines.push(format_entry(entry));
                self.last = Some(entry.content.clone());
            }
        }

        for (i, entry) in entries.iter().enumerate().skip(self.shown) {
            if !entry.is_final && i + 1 == entries.len() {
                break;
            }
            lines.push(format_entry(entry));
            self.shown = i + 1;
            self.last = Some(entry.content.clone());
        }
        lines
    }
}

fn format_entry(entry: &TranscriptEntry) -> String {
    let speaker = match entry.role {
        Role::User => "you",
        Role::Assistant => "agent",
    };
    format!(
        "[{}] {speaker}: {}",
        entry.timestamp.format("%H:%M:%S"),
        entry.content
    )
}

pub fn format_status(status: &SessionStatus) -> String {
    let state = match status.state {
        SessionState::Idle => "idle",
        SessionState::Connecting => "connecting",
        SessionState::Connected => "connected",
        SessionState::Error => "error",
    };
    let mut line = format!("state: {state}");
    if let Some(id) = &status.session_id {
        line.push_str(&format!(" | session: {id}"));
    }
    if status.state == SessionState::Connected {
        line.push_str(if status.muted { " | muted" } else { " | live" });
    }
    if let Some(error) = &status.last_error {
        line.push_str(&format!(" | error: {error}"));
    }
    line
}

fn format_tool(tool: Option<&ToolInvocation>) -> Option<String> {
    tool.map(|t| format!("agent is using tool: {}", t.name))
}

/// Prints every observable change of `session` until the session task ends.
pub async fn render(session: SessionHandle) {
    let mut status = session.subscribe_status();
    let mut transcript = session.subscribe_transcript();
    let mut tool = session.subscribe_active_tool();
    let mut printer = TranscriptPrinter::new();

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", format_status(&status.borrow_and_update()));
            }
            changed = transcript.changed() => {
                if changed.is_err() {
                    break;
                }
                let entries = transcript.borrow_and_update().clone();
                let session_id = status.borrow().session_id.clone();
                for line in printer.lines(session_id.as_deref(), &entries) {
                    println!("{line}");
                }
            }
            changed = tool.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(line) = format_tool(tool.borrow_and_update().as_ref()) {
                    println!("{line}");
                }
            }
        }
    }
}
