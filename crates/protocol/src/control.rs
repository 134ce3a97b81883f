//! Data-channel control messages.
//!
//! # Wire format
//!
//! ```text
//! text    {"filename", "type", "size"}      file metadata, sent once first
//! binary  [<= 16 KiB of file data]          repeated, in file order
//! text    {"done": true, "size"}            completion marker, sent last
//! ```
//!
//! Chunks carry no sequence number: the data channel is reliable and
//! ordered, so arrival order is file order.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Describes the file about to be streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(rename = "filename")]
    pub name: String,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    pub size: u64,
}

/// Final control message: the sender's total bytes sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub done: bool,
    #[serde(alias = "totalBytesSent", default)]
    pub size: u64,
}

impl CompletionMarker {
    pub fn new(size: u64) -> Self {
        Self { done: true, size }
    }
}

/// A decoded data-channel control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Metadata(FileMetadata),
    Done(CompletionMarker),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawControl {
    Done(CompletionMarker),
    Metadata(FileMetadata),
}

impl ControlMessage {
    /// Decodes a control message from the bytes of a text (or binary) frame.
    ///
    /// A marker with `done: false` is rejected: it announces nothing.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match serde_json::from_slice::<RawControl>(bytes)? {
            RawControl::Done(marker) if marker.done => Ok(ControlMessage::Done(marker)),
            RawControl::Done(marker) => Err(ProtocolError::UnexpectedControl(format!(
                "completion marker without done flag (size {})",
                marker.size
            ))),
            RawControl::Metadata(meta) => Ok(ControlMessage::Metadata(meta)),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let json = match self {
            ControlMessage::Metadata(meta) => serde_json::to_string(meta)?,
            ControlMessage::Done(marker) => serde_json::to_string(marker)?,
        };
        Ok(json)
    }
}
