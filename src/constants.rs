// Shared constants for the heartbeat registry protocol and polling loop

/// Body of every acknowledgement heartbeat sent back to a client.
pub const ACK_MESSAGE: &str = "ack";

/// Largest single read for an inbound heartbeat or a status reply (bytes).
pub const READ_BUFFER_SIZE: usize = 1024;

/// Default upper bound for one outbound probe, connect through reply (s).
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Default lower bound of the jittered polling interval (s).
pub const DEFAULT_POLL_INTERVAL_LOWER_SECS: u64 = 30;

/// Default upper bound of the jittered polling interval (s).
pub const DEFAULT_POLL_INTERVAL_UPPER_SECS: u64 = 35;

/// Reply written back when an inbound frame is not a heartbeat.
pub const WRONG_DECODER_REASON: &str = "incorrect decoder";

/// Deadline for writing a reply on an inbound connection (s).
pub const REPLY_WRITE_TIMEOUT_SECS: u64 = 5;

/// Deadline for the first frame on an inbound connection (s).
pub const HEARTBEAT_READ_TIMEOUT_SECS: u64 = 15;
