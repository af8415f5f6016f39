pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504, 520];

/// SSE payload some upstreams send as their end-of-stream record.
pub const SSE_DONE_MARKER: &str = "[DONE]";

/// Upstream framing limits
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
pub const MAX_STREAM_LINES: usize = 100_000;

/// Client side of the relay
pub const CLIENT_CHANNEL_CAPACITY: usize = 100;
pub const SSE_KEEPALIVE_SECS: u64 = 15;

/// Session store
pub const SESSION_FILE_EXT: &str = "json";
pub const SESSION_TMP_EXT: &str = "json.tmp";
pub const MAX_SESSION_ID_LEN: usize = 128;
pub const TITLE_MAX_CHARS: usize = 48;

/// Appended to `llm_api_base` when no full completion URL is configured.
pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Keys the relay owns in the upstream request body; `llm_options` cannot override them.
pub const RESERVED_REQUEST_KEYS: &[&str] = &["messages", "model", "stream"];

pub const REQUEST_ID_HEADER: &str = "x-relay-request-id";
