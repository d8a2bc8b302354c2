//! Values exchanged over the wire.
//!
//! Outgoing values are strongly typed ([`Hello`], [`Chat`], wrapped in
//! [`Envelope`]). Incoming lines are decoded into a [`Frame`], a lenient view
//! over an arbitrary JSON object, because the server must tolerate missing or
//! mistyped fields instead of dropping the connection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Display name reserved for notices generated by the server.
pub const SYSTEM_NAME: &str = "system";

/// Message content that asks the server to end the session.
pub const QUIT_SENTINEL: &str = "/quit";

/// First line a client sends: `{"type":"hello","name":...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename = "hello")]
pub struct Hello {
    pub name: String,
}

impl Hello {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A chat line: `{"name":...,"message":...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub name: String,
    pub message: String,
}

impl Chat {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// A notice from the server (welcome, join, leave).
    pub fn system(message: impl Into<String>) -> Self {
        Self::new(SYSTEM_NAME, message)
    }

    /// The disconnect request a client sends on `/quit`.
    pub fn quit(name: impl Into<String>) -> Self {
        Self::new(name, QUIT_SENTINEL)
    }

    pub fn is_quit(&self) -> bool {
        self.message == QUIT_SENTINEL
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Envelope {
    Hello(Hello),
    Chat(Chat),
}

impl From<Hello> for Envelope {
    fn from(hello: Hello) -> Self {
        Envelope::Hello(hello)
    }
}

impl From<Chat> for Envelope {
    fn from(chat: Chat) -> Self {
        Envelope::Chat(chat)
    }
}

/// A decoded JSON object received from a peer.
///
/// Accessors return `None` when a field is absent or is not a string.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame(Map<String, Value>);

impl Frame {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn kind(&self) -> Option<&str> {
        self.str_field("type")
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field("name")
    }

    pub fn message(&self) -> Option<&str> {
        self.str_field("message")
    }

    /// The requested display name, if this frame is a well-formed hello.
    pub fn hello_name(&self) -> Option<&str> {
        match self.kind() {
            Some("hello") => self.name(),
            _ => None,
        }
    }

    pub fn is_quit(&self) -> bool {
        self.message() == Some(QUIT_SENTINEL)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for Frame {
    fn from(object: Map<String, Value>) -> Self {
        Frame(object)
    }
}
