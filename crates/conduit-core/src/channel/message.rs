//! Wire envelopes exchanged by two [`Channel`](super::Channel)s.
//!
//! Every message is a JSON object tagged by `type`. Payloads that belong to
//! the application (`argument`, `return`, `error`) stay as raw JSON values
//! and default to `null` when absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single channel protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Handshake from the initiator, advertising its callable methods.
    Connect {
        /// Methods the sender exposes.
        methods: Vec<String>,
    },

    /// Handshake reply, advertising the replier's callable methods.
    Connected {
        /// Methods the sender exposes.
        methods: Vec<String>,
    },

    /// Graceful termination notice.
    Closed,

    /// Remote invocation request.
    Call {
        /// Per-channel unique call id.
        id: String,
        /// Method to invoke.
        method: String,
        /// Raw argument, `null` when the method takes none.
        #[serde(default)]
        argument: Value,
    },

    /// Receipt acknowledgement for a call.
    Ack {
        /// Id of the acknowledged call.
        id: String,
    },

    /// Successful call result.
    Return {
        /// Id of the call this answers.
        id: String,
        /// Raw result value.
        #[serde(rename = "return", default)]
        value: Value,
    },

    /// Failed call result.
    Exception {
        /// Id of the call this answers.
        id: String,
        /// Raw error value.
        #[serde(default)]
        error: Value,
    },
}

impl Message {
    /// Protocol name of this message, as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "connect",
            Message::Connected { .. } => "connected",
            Message::Closed => "closed",
            Message::Call { .. } => "call",
            Message::Ack { .. } => "ack",
            Message::Return { .. } => "return",
            Message::Exception { .. } => "exception",
        }
    }
}
