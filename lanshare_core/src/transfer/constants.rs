use std::time::Duration;

/// Fixed TCP port of the private transfer protocol
pub const TRANSFER_PORT: u16 = 46000;

/// Copy chunk size for every transport (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// How often the sender refreshes the speed/ETA display strings
pub const SPEED_REPORT_INTERVAL: Duration = Duration::from_millis(700);

/// Upper bound for any length-prefixed header field (16 MiB)
pub const MAX_HEADER_FIELD_LEN: u64 = 16 * 1024 * 1024;

/// Maximum length for file names (bytes)
pub const MAX_FILENAME_LENGTH: usize = 255;
