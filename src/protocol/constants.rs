//! Protocol constants

/// Line terminator for control lines
pub const CRLF: &[u8] = b"\r\n";

/// Default TCP port
pub const DEFAULT_PORT: u16 = 4222;

/// Default maximum payload announced in INFO (1 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Default limit on a control line still waiting for its terminator
pub const DEFAULT_MAX_CONTROL_LINE: usize = 16 * 1024;

/// Largest packed sid list (subject + 2-byte length prefixed sids)
pub const MAX_SID_LIST_BYTES: usize = 0xffff;

/// Sid prefix marking a wildcard subscription on the client side
pub const WILDCARD_SID_MARK: u8 = b'-';

/// Size of the fragment trailer appended after each fragment's bytes
pub const TRAILER_SIZE: usize = 32;

/// Marker identifying a fragment trailer
pub const TRAILER_MAGIC: u32 = 0x4e46_5247;

/// Partial fragment groups kept per connection; the oldest is evicted beyond this
pub const MAX_PENDING_GROUPS: usize = 16;

/// Version string advertised in INFO
pub const SERVER_VERSION: &str = "1.1.1";

/// Protocol level spoken
pub const PROTOCOL_VERSION: u32 = 1;

/// Length of the generated server id
pub const SERVER_ID_LEN: usize = 22;

// Canned replies
pub const OK_REPLY: &[u8] = b"+OK\r\n";
pub const PING_LINE: &[u8] = b"PING\r\n";
pub const PONG_LINE: &[u8] = b"PONG\r\n";
