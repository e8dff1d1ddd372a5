//! Seams to the hosting game server
//!
//! The engine never talks to the game directly. A subject domain (players,
//! blocks, islands) implements [`Subject`] for its handle type, and the
//! server supplies a [`Platform`] that carries messages, console commands
//! and placeholder values back and forth.

use tracing::debug;

/// The owner of a trigger
pub trait Subject: Send + Sync + 'static {
    /// Stable identifier, used to key cooldowns and sessions
    fn id(&self) -> String;

    /// Display name
    fn name(&self) -> String {
        self.id()
    }
}

impl Subject for String {
    fn id(&self) -> String {
        self.clone()
    }
}

/// Services the hosting server provides to rules acting on `T`
pub trait Platform<T>: Send + Sync {
    /// Resolve an external `%placeholder%` for a subject
    fn resolve_placeholder(&self, _subject: &T, _name: &str) -> Option<String> {
        None
    }

    /// Deliver a chat message to a subject
    fn send_message(&self, target: &T, message: &str);

    /// Execute a console command on behalf of a subject
    fn run_command(&self, subject: &T, command: &str);
}

/// A platform that only logs what it is asked to do
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlatform;

impl<T: Subject> Platform<T> for NullPlatform {
    fn send_message(&self, target: &T, message: &str) {
        debug!(target: "rules", "message to {}: {}", target.name(), message);
    }

    fn run_command(&self, subject: &T, command: &str) {
        debug!(target: "rules", "command for {}: {}", subject.name(), command);
    }
}

/// A position in a named world
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }
}
