//! Private LAN transfer protocol over TCP.
//!
//! This module provides:
//! - Length-prefixed header framing
//! - The receiving accept loop and per-connection state machine
//! - The sending side
//! - The shared rate limiter and transfer record

pub mod constants;
pub mod protocol;
pub mod receiver;
pub mod record;
pub mod sender;
pub mod server;
pub mod throttle;
pub mod utils;

// Re-export public API
pub use constants::TRANSFER_PORT;
pub use receiver::{ReceiverContext, receive_transfer};
pub use record::{Direction, TransferRecord, TransferStatus, TransferTracker};
pub use sender::{prepare_outgoing, send_file};
pub use server::{bind_listener, run_server};
