//! Known peers and their online/offline state.

use crate::identity::LocalIdentity;
use crate::transfer::record::now_timestamp;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Identity key of the permanently-present web gateway pseudo-peer
pub const BROWSER_PEER_KEY: &str = "browser";

/// Accent colour of the web gateway pseudo-peer
pub const BROWSER_PEER_COLOR: &str = "#FF800080";

/// A peer not heard from for longer than this goes offline (seconds)
pub const PEER_TIMEOUT_SECS: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkKind {
    Lan,
    OverlayVpn,
    Unknown,
}

impl NetworkKind {
    /// Classify a sender address with private-range heuristics
    pub fn classify(ip: IpAddr) -> Self {
        let IpAddr::V4(v4) = ip else {
            return Self::Unknown;
        };
        match v4.octets() {
            [172, b, ..] if (16..=31).contains(&b) => Self::OverlayVpn,
            [192, 168, ..] => Self::Lan,
            [10, ..] => Self::Lan,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Online,
    Offline,
}

/// One sighting of a peer, produced by the discovery listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSighting {
    pub nickname: String,
    pub accent_color: String,
    pub avatar: Option<Vec<u8>>,
    pub address: IpAddr,
    pub network_kind: NetworkKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub nickname: String,
    pub address: IpAddr,
    pub network_kind: NetworkKind,
    status: PeerStatus,
    pub last_seen: u64,
    pub accent_color: String,
    #[serde(default, with = "avatar_base64")]
    pub avatar: Option<Vec<u8>>,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub is_browser_peer: bool,
}

impl Peer {
    pub fn from_sighting(sighting: PeerSighting, now: u64) -> Self {
        Self {
            nickname: sighting.nickname,
            address: sighting.address,
            network_kind: sighting.network_kind,
            status: PeerStatus::Online,
            last_seen: now,
            accent_color: sighting.accent_color,
            avatar: sighting.avatar,
            is_self: false,
            is_browser_peer: false,
        }
    }

    pub fn local(identity: &LocalIdentity, address: IpAddr) -> Self {
        Self {
            nickname: format!("{} (you)", identity.nickname),
            address,
            network_kind: NetworkKind::classify(address),
            status: PeerStatus::Online,
            last_seen: now_timestamp(),
            accent_color: identity.accent_color.clone(),
            avatar: identity.avatar.clone(),
            is_self: true,
            is_browser_peer: false,
        }
    }

    pub fn browser() -> Self {
        Self {
            nickname: "Web share".to_string(),
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            network_kind: NetworkKind::Unknown,
            status: PeerStatus::Online,
            last_seen: now_timestamp(),
            accent_color: BROWSER_PEER_COLOR.to_string(),
            avatar: None,
            is_self: false,
            is_browser_peer: true,
        }
    }

    /// IP address for native peers, the sentinel for the browser gateway
    pub fn key(&self) -> String {
        if self.is_browser_peer {
            BROWSER_PEER_KEY.to_string()
        } else {
            self.address.to_string()
        }
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn is_online(&self) -> bool {
        self.status == PeerStatus::Online
    }

    /// Self and the browser peer are pinned online
    pub fn set_status(&mut self, status: PeerStatus) -> bool {
        if self.status == status || self.is_self || self.is_browser_peer {
            return false;
        }
        self.status = status;
        true
    }

    pub fn set_nickname(&mut self, nickname: &str) -> bool {
        if self.nickname == nickname {
            return false;
        }
        self.nickname = nickname.to_string();
        true
    }

    pub fn set_accent_color(&mut self, color: &str) -> bool {
        if self.accent_color == color {
            return false;
        }
        self.accent_color = color.to_string();
        true
    }

    pub fn set_avatar(&mut self, avatar: Vec<u8>) -> bool {
        if self.avatar.as_deref() == Some(avatar.as_slice()) {
            return false;
        }
        self.avatar = Some(avatar);
        true
    }

    /// Peers loaded from a cache start offline until seen again
    pub(crate) fn into_cached(mut self) -> Self {
        self.status = PeerStatus::Offline;
        self
    }
}

/// Why a peer could not be forgotten
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ForgetError {
    #[error("no peer with key {0}")]
    Unknown(String),
    #[error("peer {0} is online")]
    Online(String),
    #[error("peer {0} cannot be removed")]
    Pinned(String),
}

/// Ordered peer collection: self first, then the browser peer, then the rest.
///
/// Owned by the backend loop; every mutation returns whether anything changed.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
}

impl PeerRegistry {
    pub fn new(self_peer: Peer, cached: Vec<Peer>) -> Self {
        let mut peers = vec![self_peer, Peer::browser()];
        for peer in cached {
            if peer.is_self || peer.is_browser_peer {
                continue;
            }
            if peers.iter().any(|p| p.key() == peer.key()) {
                continue;
            }
            peers.push(peer.into_cached());
        }
        Self { peers }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn get(&self, key: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.key() == key)
    }

    pub fn self_peer(&self) -> &Peer {
        &self.peers[0]
    }

    /// Peers worth caching on disk (everything but self and the browser peer)
    pub fn persistable(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|p| !p.is_self && !p.is_browser_peer)
            .cloned()
            .collect()
    }

    /// Fold a beacon sighting in. `is_local` marks a beacon sent by this host.
    pub fn observe(&mut self, sighting: PeerSighting, is_local: bool, now: u64) -> bool {
        if is_local {
            let me = &mut self.peers[0];
            let mut changed = me.set_accent_color(&sighting.accent_color);
            if let Some(avatar) = sighting.avatar {
                changed |= me.set_avatar(avatar);
            }
            me.last_seen = now;
            return changed;
        }

        let key = sighting.address.to_string();
        match self
            .peers
            .iter_mut()
            .find(|p| !p.is_self && !p.is_browser_peer && p.key() == key)
        {
            Some(existing) => {
                existing.last_seen = now;
                let mut changed = existing.set_status(PeerStatus::Online);
                changed |= existing.set_nickname(&sighting.nickname);
                changed |= existing.set_accent_color(&sighting.accent_color);
                if let Some(avatar) = sighting.avatar {
                    changed |= existing.set_avatar(avatar);
                }
                if existing.network_kind != sighting.network_kind {
                    existing.network_kind = sighting.network_kind;
                    changed = true;
                }
                changed
            }
            None => {
                tracing::info!("New peer {} at {}", sighting.nickname, key);
                self.peers.push(Peer::from_sighting(sighting, now));
                true
            }
        }
    }

    /// Re-derive the self entry after a settings change
    pub fn refresh_self(&mut self, identity: &LocalIdentity) -> bool {
        let me = &mut self.peers[0];
        let mut changed = me.set_nickname(&format!("{} (you)", identity.nickname));
        changed |= me.set_accent_color(&identity.accent_color);
        match &identity.avatar {
            Some(avatar) => changed |= me.set_avatar(avatar.clone()),
            None => changed |= me.avatar.take().is_some(),
        }
        changed
    }

    /// Liveness sweep: online peers silent for too long go offline
    pub fn sweep(&mut self, now: u64) -> bool {
        let mut changed = false;
        for peer in self.peers.iter_mut() {
            if peer.is_online() && now.saturating_sub(peer.last_seen) > PEER_TIMEOUT_SECS {
                if peer.set_status(PeerStatus::Offline) {
                    tracing::debug!("Peer {} went offline", peer.key());
                    changed = true;
                }
            }
        }
        changed
    }

    /// Manual refresh: everyone but self and the browser peer must re-announce
    pub fn mark_all_offline(&mut self) -> bool {
        let mut changed = false;
        for peer in self.peers.iter_mut() {
            changed |= peer.set_status(PeerStatus::Offline);
        }
        changed
    }

    /// Remove an offline native peer
    pub fn forget(&mut self, key: &str) -> Result<Peer, ForgetError> {
        let idx = self
            .peers
            .iter()
            .position(|p| p.key() == key)
            .ok_or_else(|| ForgetError::Unknown(key.to_string()))?;

        let peer = &self.peers[idx];
        if peer.is_self || peer.is_browser_peer {
            return Err(ForgetError::Pinned(key.to_string()));
        }
        if peer.is_online() {
            return Err(ForgetError::Online(key.to_string()));
        }
        Ok(self.peers.remove(idx))
    }
}

/// Serde adapter storing avatar bytes as base64 text
pub mod avatar_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(avatar: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match avatar {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| STANDARD.decode(t).map_err(serde::de::Error::custom))
            .transpose()
    }
}
