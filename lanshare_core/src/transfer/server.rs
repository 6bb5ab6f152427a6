use crate::AppEvent;
use crate::error::TransferError;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::receiver::{ReceiverContext, receive_transfer};

/// Bind the transfer listener
pub async fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind transfer listener on {}", addr))
}

/// Accept inbound transfers until cancelled, one task per connection
pub async fn run_server(listener: TcpListener, ctx: Arc<ReceiverContext>, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Transfer listener on {}", addr);
    }

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            a = listener.accept() => a,
        };

        match accepted {
            Ok((stream, remote)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    handle_connection(stream, remote, &ctx).await;
                });
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
            }
        }
    }
    tracing::debug!("Transfer listener stopped");
}

/// Failure boundary for a single connection: errors end here
async fn handle_connection(mut stream: TcpStream, remote: SocketAddr, ctx: &ReceiverContext) {
    tracing::debug!("Connection from {}", remote);
    match receive_transfer(&mut stream, remote.ip(), ctx).await {
        Ok(record) => {
            tracing::debug!("Transfer {} from {} ended {:?}", record.id, remote, record.status());
        }
        Err(TransferError::PrematureEndOfStream { field }) => {
            tracing::warn!("{} closed while sending {}", remote, field);
        }
        Err(e) => {
            tracing::warn!("Transfer from {} failed: {}", remote, e);
            let _ = ctx
                .event_tx
                .send(AppEvent::Error(format!("Receive from {} failed: {}", remote, e)))
                .await;
        }
    }
}
