/// Application name
pub const APP_NAME: &str = "Duo";

/// Profile defaults applied when a user is first seen without the field
pub const DEFAULT_NICKNAME: &str = "Anonymous";
pub const DEFAULT_AGE: &str = "?";
pub const DEFAULT_AVATAR_SEED: &str = "unknown";

/// Nickname shown for a partner whose profile cannot be resolved
pub const UNKNOWN_PARTNER_NICKNAME: &str = "Stranger";

/// Default HTTP/WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 3001;

/// Per-connection outbound event buffer
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Maximum upload size in bytes (50 MiB)
pub const MAX_UPLOAD_SIZE: usize = 50 * 1024 * 1024;

/// Maximum accepted size of a single inbound WebSocket text frame (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;
