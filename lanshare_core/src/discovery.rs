//! Presence beacons over UDP broadcast.
//!
//! Every node broadcasts `nickname|accentColor|base64Avatar` to the discovery
//! port every few seconds and turns the beacons it hears into
//! [`AppEvent::PeerFound`] sightings.

use crate::AppEvent;
use crate::identity::LocalIdentity;
use crate::peer::{NetworkKind, PeerSighting};
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fixed UDP port beacons are sent to and heard on
pub const DISCOVERY_PORT: u16 = 45000;

pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(3);

/// Largest payload a UDP datagram can carry
const MAX_DATAGRAM: usize = 65_507;

/// One presence announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub nickname: String,
    pub accent_color: String,
    pub avatar: Option<Vec<u8>>,
}

impl Beacon {
    /// Beacon for the local node; large avatars are left out
    pub fn from_identity(identity: &LocalIdentity) -> Self {
        Self {
            nickname: identity.nickname.clone(),
            accent_color: identity.accent_color.clone(),
            avatar: identity.beacon_avatar().map(<[u8]>::to_vec),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let avatar = self
            .avatar
            .as_deref()
            .map(|a| BASE64.encode(a))
            .unwrap_or_default();
        format!("{}|{}|{}", self.nickname, self.accent_color, avatar).into_bytes()
    }

    /// Parse a datagram; anything malformed yields `None`
    pub fn parse(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let mut fields = text.split('|');
        let nickname = fields.next()?;
        let accent_color = fields.next()?;
        let avatar = match fields.next().map(str::trim) {
            Some(b64) if !b64.is_empty() => Some(BASE64.decode(b64).ok()?),
            _ => None,
        };

        Some(Self {
            nickname: nickname.to_string(),
            accent_color: accent_color.to_string(),
            avatar,
        })
    }
}

pub struct DiscoveryService {
    sender: UdpSocket,
    listener: Option<Arc<UdpSocket>>,
    target: SocketAddr,
    beacon: RwLock<Beacon>,
}

impl DiscoveryService {
    /// Production setup: listen on [`DISCOVERY_PORT`], broadcast to the whole segment
    pub async fn new(identity: &LocalIdentity) -> Result<Self> {
        Self::bind(
            DISCOVERY_PORT,
            SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            identity,
        )
        .await
    }

    /// Bind the listener on `listen_port` and send beacons to `target`.
    ///
    /// A taken listen port is not an error: the service then only sends.
    pub async fn bind(listen_port: u16, target: SocketAddr, identity: &LocalIdentity) -> Result<Self> {
        let sender = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .context("Failed to bind beacon sender socket")?;
        sender
            .set_broadcast(true)
            .context("Failed to enable broadcast")?;

        let listener = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, listen_port))).await {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                tracing::warn!(
                    "Discovery port {} unavailable ({}), running send-only",
                    listen_port,
                    e
                );
                None
            }
        };

        Ok(Self {
            sender,
            listener,
            target,
            beacon: RwLock::new(Beacon::from_identity(identity)),
        })
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Beacons sent from now on carry the new identity
    pub async fn update_identity(&self, identity: &LocalIdentity) {
        *self.beacon.write().await = Beacon::from_identity(identity);
    }

    /// Send one beacon immediately
    pub async fn broadcast_now(&self) -> std::io::Result<()> {
        let payload = self.beacon.read().await.encode();
        self.sender.send_to(&payload, self.target).await?;
        Ok(())
    }

    /// Broadcast every [`BROADCAST_INTERVAL`] until cancelled
    pub fn start_broadcasting(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = service.broadcast_now().await {
                    tracing::debug!("Beacon send failed: {}", e);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(BROADCAST_INTERVAL) => {}
                }
            }
            tracing::debug!("Beacon broadcaster stopped");
        })
    }

    /// Turn received beacons into `PeerFound` events; `None` in send-only mode
    pub fn start_listening(
        &self,
        event_tx: mpsc::Sender<AppEvent>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let socket = self.listener.clone()?;

        Some(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = socket.recv_from(&mut buf) => r,
                };

                let (len, addr) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!("Discovery receive error: {}", e);
                        continue;
                    }
                };

                let Some(beacon) = Beacon::parse(&buf[..len]) else {
                    tracing::trace!("Dropped malformed beacon from {}", addr);
                    continue;
                };

                let sighting = PeerSighting {
                    nickname: beacon.nickname,
                    accent_color: beacon.accent_color,
                    avatar: beacon.avatar,
                    address: addr.ip(),
                    network_kind: NetworkKind::classify(addr.ip()),
                };
                if event_tx.send(AppEvent::PeerFound(sighting)).await.is_err() {
                    break;
                }
            }
            tracing::debug!("Discovery listener stopped");
        }))
    }
}
