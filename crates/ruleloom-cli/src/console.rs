//! A terminal stand-in for a game server

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use ruleloom_engine::{Platform, Subject};

/// A named player typed on the command line
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsoleSubject {
    name: String,
}

impl ConsoleSubject {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Subject for ConsoleSubject {
    fn id(&self) -> String {
        self.name.to_lowercase()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Something a rule asked the server to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Message { target: String, text: String },
    Command { subject: String, command: String },
}

/// Prints rule output and keeps a transcript of it
#[derive(Default)]
pub struct ConsolePlatform {
    placeholders: HashMap<String, String>,
    quiet: bool,
    transcript: Mutex<Vec<Output>>,
}

impl ConsolePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values for `%name%` placeholders
    pub fn with_placeholders(
        mut self,
        placeholders: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.placeholders.extend(placeholders);
        self
    }

    /// Record output without printing it
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn transcript(&self) -> Vec<Output> {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, output: Output) {
        if !self.quiet {
            match &output {
                Output::Message { target, text } => println!("[to {}] {}", target, text),
                Output::Command { subject, command } => println!("[{}] /{}", subject, command),
            }
        }
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(output);
    }
}

impl Platform<ConsoleSubject> for ConsolePlatform {
    fn resolve_placeholder(&self, subject: &ConsoleSubject, name: &str) -> Option<String> {
        match name {
            "player_name" => Some(subject.name()),
            _ => self.placeholders.get(name).cloned(),
        }
    }

    fn send_message(&self, target: &ConsoleSubject, message: &str) {
        self.record(Output::Message {
            target: target.name(),
            text: message.to_string(),
        });
    }

    fn run_command(&self, subject: &ConsoleSubject, command: &str) {
        self.record(Output::Command {
            subject: subject.name(),
            command: command.trim_start_matches('/').to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_id_ignores_case() {
        let subject = ConsoleSubject::new("Alice");
        assert_eq!(subject.id(), "alice");
        assert_eq!(subject.name(), "Alice");
    }

    #[test]
    fn test_placeholders() {
        let platform = ConsolePlatform::new()
            .with_placeholders([("island_level".to_string(), "12".to_string())]);
        let subject = ConsoleSubject::new("Alice");

        assert_eq!(
            platform.resolve_placeholder(&subject, "player_name").as_deref(),
            Some("Alice")
        );
        assert_eq!(
            platform.resolve_placeholder(&subject, "island_level").as_deref(),
            Some("12")
        );
        assert_eq!(platform.resolve_placeholder(&subject, "nope"), None);
    }

    #[test]
    fn test_transcript_records_in_order() {
        let platform = ConsolePlatform::new().quiet();
        let subject = ConsoleSubject::new("Bob");

        platform.send_message(&subject, "hello");
        platform.run_command(&subject, "/give Bob dirt");

        assert_eq!(
            platform.transcript(),
            vec![
                Output::Message {
                    target: "Bob".to_string(),
                    text: "hello".to_string()
                },
                Output::Command {
                    subject: "Bob".to_string(),
                    command: "give Bob dirt".to_string()
                },
            ]
        );
    }
}
