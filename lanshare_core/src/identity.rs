use crate::config::AppConfig;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use tokio::fs;

/// Beacons carry the avatar only below this size, to stay under MTU-safe limits
pub const MAX_BEACON_AVATAR_BYTES: usize = 10_000;

/// How this node presents itself to peers and browsers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub nickname: String,
    pub accent_color: String,
    pub avatar: Option<Vec<u8>>,
}

impl LocalIdentity {
    /// Build the identity from config; a missing or unreadable avatar is dropped
    pub async fn load(config: &AppConfig) -> Self {
        let avatar = match &config.avatar_path {
            Some(path) => match fs::read(path).await {
                Ok(bytes) if !bytes.is_empty() => Some(bytes),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("Cannot read avatar {:?}: {}", path, e);
                    None
                }
            },
            None => None,
        };

        Self {
            nickname: config.nickname.clone().unwrap_or_else(default_nickname),
            accent_color: config.accent_color.clone(),
            avatar,
        }
    }

    /// Avatar small enough to ride in a discovery beacon
    pub fn beacon_avatar(&self) -> Option<&[u8]> {
        self.avatar
            .as_deref()
            .filter(|a| a.len() < MAX_BEACON_AVATAR_BYTES)
    }
}

/// Host name, or a placeholder when it cannot be read
pub fn default_nickname() -> String {
    hostname::get()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "Unknown-PC".to_string())
}

/// All addresses owned by this host, used to spot our own beacons
pub fn local_addresses() -> HashSet<IpAddr> {
    let mut addrs: HashSet<IpAddr> = local_ip_address::list_afinet_netifas()
        .map(|list| list.into_iter().map(|(_, ip)| ip).collect())
        .unwrap_or_default();
    addrs.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
    addrs
}

/// Best LAN address to advertise, preferring 192.168.x.x, then 10.x.x.x, then 172.x.x.x
pub fn best_local_ipv4() -> IpAddr {
    let mut best: Option<(u8, IpAddr)> = None;
    if let Ok(list) = local_ip_address::list_afinet_netifas() {
        for (_name, ip) in list {
            let IpAddr::V4(v4) = ip else { continue };
            if v4.is_loopback() {
                continue;
            }
            let rank = match v4.octets() {
                [192, 168, ..] => 0,
                [10, ..] => 1,
                [172, ..] => 2,
                _ => 3,
            };
            if best.is_none_or(|(r, _)| rank < r) {
                best = Some((rank, ip));
            }
        }
    }
    best.map(|(_, ip)| ip)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_avatar_size_limit() {
        let mut identity = LocalIdentity {
            nickname: "me".into(),
            accent_color: "#FF000000".into(),
            avatar: Some(vec![0u8; MAX_BEACON_AVATAR_BYTES - 1]),
        };
        assert!(identity.beacon_avatar().is_some());

        identity.avatar = Some(vec![0u8; MAX_BEACON_AVATAR_BYTES]);
        assert!(identity.beacon_avatar().is_none());
    }

    #[tokio::test]
    async fn test_load_uses_config_nickname_and_avatar() {
        let dir = tempfile::tempdir().unwrap();
        let avatar_path = dir.path().join("me.jpg");
        std::fs::write(&avatar_path, [1u8, 2, 3]).unwrap();

        let config = AppConfig {
            nickname: Some("Alice".into()),
            avatar_path: Some(avatar_path),
            ..AppConfig::default()
        };
        let identity = LocalIdentity::load(&config).await;
        assert_eq!(identity.nickname, "Alice");
        assert_eq!(identity.avatar, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_missing_avatar_is_dropped() {
        let config = AppConfig {
            avatar_path: Some("/definitely/not/here.png".into()),
            ..AppConfig::default()
        };
        let identity = LocalIdentity::load(&config).await;
        assert!(identity.avatar.is_none());
        assert!(!identity.nickname.is_empty());
    }
}
