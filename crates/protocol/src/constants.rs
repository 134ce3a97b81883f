use std::time::Duration;

/// Port the relay listens on when none is configured.
pub const DEFAULT_RELAY_PORT: u16 = 8765;

/// Maximum relay message size in bytes (1 MB).
///
/// Relay traffic is limited to session descriptions and ICE candidates,
/// which are a few KB at most.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// How often the relay client and server ping each other.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Read deadline: if nothing arrives within this window the relay
/// connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Largest binary message put on the data channel (16 KiB).
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Bytes the sender allows to queue in the data channel before pausing (8 MiB).
pub const MAX_BUFFERED_AMOUNT: usize = 8 * 1024 * 1024;

/// Size of one read from the outgoing file (64 KiB).
pub const READ_SLICE_SIZE: usize = 64 * 1024;

/// Length of a relay-issued room id.
pub const ROOM_ID_LEN: usize = 8;

/// Prefix of the data channel label; the file name follows it.
pub const DATA_CHANNEL_LABEL_PREFIX: &str = "file_transfer_";

/// MIME type used when the sender does not know one.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Builds the data channel label for a file.
pub fn data_channel_label(file_name: &str) -> String {
    format!("{DATA_CHANNEL_LABEL_PREFIX}{file_name}")
}
