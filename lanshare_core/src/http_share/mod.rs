//! Web gateway module
//!
//! Lets any browser download the shared file or upload one to this machine.

pub mod page;
pub mod server;

pub use server::{
    GatewayState, HTTP_PORT, bind_gateway, create_router, device_label, serve_gateway,
};
