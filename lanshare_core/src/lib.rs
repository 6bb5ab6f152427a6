use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod confirm;
pub mod discovery;
pub mod error;
pub mod history;
pub mod http_share;
pub mod identity;
pub mod peer;
pub mod storage;
pub mod transfer;

use config::{AppConfig, SharedConfig};
use confirm::ConfirmationGate;
use discovery::{DISCOVERY_PORT, DiscoveryService};
use history::{HistoryChange, TransferHistory};
use http_share::{GatewayState, HTTP_PORT};
use identity::{LocalIdentity, best_local_ipv4, local_addresses};
use peer::{Peer, PeerRegistry, PeerSighting};
use storage::Storage;
use transfer::record::now_timestamp;
use transfer::{ReceiverContext, TRANSFER_PORT, TransferRecord, TransferTracker};

/// How often silent peers are checked for
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// Capacity of the backend's internal and outgoing event channels
const EVENT_CHANNEL_CAPACITY: usize = 256;

//Command from the presentation layer to Core
#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    /// Manual refresh: mark peers offline and beacon immediately
    BroadcastNow,
    /// Send a file to a peer by key; the browser key shares it on the gateway
    SendFile { peer_key: String, path: PathBuf },
    /// Offer a file on the web gateway
    ShareFile { path: PathBuf },
    ClearShare,
    /// Answer a confirmation ticket
    RespondConfirmation { transfer_id: String, accepted: bool },
    /// Remove an offline peer
    ForgetPeer { key: String },
    /// Clear one peer's history, or everything with `None`
    ClearHistory { peer_key: Option<String> },
    /// Replace and persist the settings
    UpdateConfig(AppConfig),
    Shutdown,
}

//Report from Core to the presentation layer
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(String),
    Error(String),

    /// Raw beacon sighting; folded into the registry by the backend
    PeerFound(PeerSighting),
    /// Full peer list after any change, self first
    PeersChanged(Vec<Peer>),

    /// Snapshot of a transfer after any change
    TransferUpdated(TransferRecord),
    /// Full history after a bulk change (start-up, clearing)
    HistoryChanged(Vec<TransferRecord>),

    /// An inbound transfer waits for accept/decline
    ConfirmationRequested {
        transfer_id: String,
        file_name: String,
        from: String,
    },
    /// Still unanswered after the patience ran out: prompt synchronously
    ConfirmationEscalated {
        transfer_id: String,
        file_name: String,
        from: String,
    },

    /// Web gateway URL for browsers on the LAN
    GatewayStarted { url: String },
    /// Discovery port taken: this instance is send-only
    DiscoveryDegraded { port: u16 },
    Stopped,
}

/// Where the backend binds and stores things
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub config: AppConfig,
    pub storage: Storage,
    pub discovery_port: u16,
    pub discovery_target: SocketAddr,
    pub transfer_addr: SocketAddr,
    /// Port peers listen on for the private protocol
    pub peer_transfer_port: u16,
    pub gateway_addr: SocketAddr,
    /// Write settings changes back to the config file
    pub persist_config: bool,
}

impl BackendOptions {
    /// Fixed production ports, settings and storage from the config directory
    pub fn from_environment() -> Self {
        Self {
            config: AppConfig::load(),
            storage: Storage::default_location(),
            discovery_port: DISCOVERY_PORT,
            discovery_target: SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            transfer_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, TRANSFER_PORT)),
            peer_transfer_port: TRANSFER_PORT,
            gateway_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, HTTP_PORT)),
            persist_config: true,
        }
    }
}

pub async fn run_backend(cmd_rx: mpsc::Receiver<AppCommand>, event_tx: mpsc::Sender<AppEvent>) {
    // Load environment variables from .env file (LANSHARE_CONFIG_DIR, RUST_LOG)
    let _ = dotenvy::dotenv();
    run_backend_with(BackendOptions::from_environment(), cmd_rx, event_tx).await;
}

/// Backend state owned by the loop; the single writer of peers and history
struct Backend {
    options: BackendOptions,
    config: SharedConfig,
    identity: LocalIdentity,
    local_addrs: HashSet<IpAddr>,
    registry: PeerRegistry,
    history: TransferHistory,
    gate: Arc<ConfirmationGate>,
    discovery: Option<Arc<DiscoveryService>>,
    gateway: Arc<GatewayState>,
    /// Everything spawned tasks report goes through the loop first
    internal_tx: mpsc::Sender<AppEvent>,
    event_tx: mpsc::Sender<AppEvent>,
}

pub async fn run_backend_with(
    options: BackendOptions,
    mut cmd_rx: mpsc::Receiver<AppCommand>,
    event_tx: mpsc::Sender<AppEvent>,
) {
    let cancel = CancellationToken::new();
    let (internal_tx, mut internal_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let config = options.config.clone().shared();
    let identity = LocalIdentity::load(&options.config).await;
    let local_addrs = local_addresses();
    let self_peer = Peer::local(&identity, best_local_ipv4());
    tracing::info!("Peers and history stored in {:?}", options.storage.dir());
    let registry = PeerRegistry::new(self_peer, options.storage.load_peers().await);
    let history = TransferHistory::new(options.storage.load_history().await);

    let gate = Arc::new(ConfirmationGate::new());
    let receiver_ctx = ReceiverContext {
        config: config.clone(),
        gate: gate.clone(),
        event_tx: internal_tx.clone(),
    };
    let gateway = Arc::new(GatewayState::new(identity.clone(), receiver_ctx.clone()));

    let mut backend = Backend {
        options,
        config,
        identity,
        local_addrs,
        registry,
        history,
        gate,
        discovery: None,
        gateway,
        internal_tx,
        event_tx,
    };

    let _ = backend
        .event_tx
        .send(AppEvent::Status(format!("Name: {}", backend.identity.nickname)))
        .await;
    backend.publish_peers().await;
    backend.publish_history().await;

    backend.start_discovery(&cancel).await;
    backend.start_transfer_server(receiver_ctx, &cancel).await;
    backend.start_gateway(&cancel).await;

    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(AppCommand::Shutdown) | None => break,
                Some(cmd) => backend.handle_command(cmd).await,
            },
            Some(event) = internal_rx.recv() => backend.handle_internal(event).await,
            _ = sweep.tick() => backend.sweep().await,
        }
    }

    tracing::info!("Backend shutting down");
    cancel.cancel();
    let declined = backend.gate.decline_all().await;
    if declined > 0 {
        tracing::info!("Declined {} unanswered transfers", declined);
    }
    backend.persist_peers().await;
    backend.persist_history().await;
    let _ = backend.event_tx.send(AppEvent::Stopped).await;
}

impl Backend {
    async fn start_discovery(&mut self, cancel: &CancellationToken) {
        let service = match DiscoveryService::bind(
            self.options.discovery_port,
            self.options.discovery_target,
            &self.identity,
        )
        .await
        {
            Ok(s) => Arc::new(s),
            Err(e) => {
                tracing::error!("Discovery unavailable: {:#}", e);
                self.emit(AppEvent::Error(format!("Discovery unavailable: {}", e)))
                    .await;
                return;
            }
        };

        if service
            .start_listening(self.internal_tx.clone(), cancel.child_token())
            .is_none()
        {
            self.emit(AppEvent::DiscoveryDegraded {
                port: self.options.discovery_port,
            })
            .await;
        }
        service.start_broadcasting(cancel.child_token());
        self.discovery = Some(service);
    }

    async fn start_transfer_server(&self, ctx: ReceiverContext, cancel: &CancellationToken) {
        match transfer::bind_listener(self.options.transfer_addr).await {
            Ok(listener) => {
                tokio::spawn(transfer::run_server(
                    listener,
                    Arc::new(ctx),
                    cancel.child_token(),
                ));
            }
            Err(e) => {
                tracing::error!("{:#}", e);
                self.emit(AppEvent::Error(format!("Cannot receive files: {}", e)))
                    .await;
            }
        }
    }

    async fn start_gateway(&self, cancel: &CancellationToken) {
        let listener = match http_share::bind_gateway(self.options.gateway_addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!("{:#}", e);
                self.emit(AppEvent::Error(format!("Web gateway unavailable: {}", e)))
                    .await;
                return;
            }
        };

        let port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.options.gateway_addr.port());
        let url = format!("http://{}:{}/", best_local_ipv4(), port);

        let state = self.gateway.clone();
        let event_tx = self.internal_tx.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = http_share::serve_gateway(listener, state, cancel).await {
                tracing::error!("Web gateway error: {}", e);
                let _ = event_tx
                    .send(AppEvent::Error(format!("Web gateway failed: {}", e)))
                    .await;
            }
        });

        tracing::info!("Web gateway at {}", url);
        self.emit(AppEvent::GatewayStarted { url }).await;
    }

    async fn emit(&self, event: AppEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn publish_peers(&self) {
        self.emit(AppEvent::PeersChanged(self.registry.peers().to_vec()))
            .await;
    }

    async fn publish_history(&self) {
        self.emit(AppEvent::HistoryChanged(self.history.records().to_vec()))
            .await;
    }

    async fn persist_peers(&self) {
        if let Err(e) = self
            .options
            .storage
            .save_peers(&self.registry.persistable())
            .await
        {
            tracing::warn!("Cannot save peers: {:#}", e);
        }
    }

    async fn persist_history(&self) {
        if let Err(e) = self.options.storage.save_history(self.history.records()).await {
            tracing::warn!("Cannot save history: {:#}", e);
        }
    }

    async fn peers_changed(&self) {
        self.publish_peers().await;
        self.persist_peers().await;
    }

    /// Fold task reports into owned state, then pass them on
    async fn handle_internal(&mut self, event: AppEvent) {
        match event {
            AppEvent::PeerFound(sighting) => {
                let is_local = self.local_addrs.contains(&sighting.address);
                if self.registry.observe(sighting, is_local, now_timestamp()) {
                    self.peers_changed().await;
                }
            }
            AppEvent::TransferUpdated(record) => {
                let terminal = record.status().is_terminal();
                let change = self.history.upsert(record.clone());
                if change == HistoryChange::Inserted
                    || (change == HistoryChange::Updated && terminal)
                {
                    self.persist_history().await;
                }
                self.emit(AppEvent::TransferUpdated(record)).await;
            }
            other => self.emit(other).await,
        }
    }

    async fn sweep(&mut self) {
        if self.registry.sweep(now_timestamp()) {
            self.peers_changed().await;
        }
    }

    async fn handle_command(&mut self, cmd: AppCommand) {
        match cmd {
            AppCommand::BroadcastNow => {
                if self.registry.mark_all_offline() {
                    self.publish_peers().await;
                }
                if let Some(discovery) = &self.discovery {
                    if let Err(e) = discovery.broadcast_now().await {
                        tracing::warn!("Manual beacon failed: {}", e);
                    }
                }
                self.emit(AppEvent::Status("Scanning...".to_string())).await;
            }
            AppCommand::SendFile { peer_key, path } => self.send_file(&peer_key, path).await,
            AppCommand::ShareFile { path } => self.share_file(path).await,
            AppCommand::ClearShare => self.gateway.clear_share().await,
            AppCommand::RespondConfirmation {
                transfer_id,
                accepted,
            } => {
                if !self.gate.respond(&transfer_id, accepted).await {
                    self.emit(AppEvent::Error(format!(
                        "No pending confirmation for {}",
                        transfer_id
                    )))
                    .await;
                } else if let Some(record) = self.history.get(&transfer_id) {
                    tracing::info!(
                        "{} {} from {}",
                        if accepted { "Accepted" } else { "Declined" },
                        record.file_name,
                        record.counterparty.display_name()
                    );
                }
            }
            AppCommand::ForgetPeer { key } => match self.registry.forget(&key) {
                Ok(peer) => {
                    tracing::info!("Forgot peer {}", peer.key());
                    self.peers_changed().await;
                }
                Err(e) => self.emit(AppEvent::Error(e.to_string())).await,
            },
            AppCommand::ClearHistory { peer_key } => {
                let removed = match &peer_key {
                    Some(key) => self.history.clear_for_peer(key),
                    None => self.history.clear_all(),
                };
                if removed > 0 {
                    self.persist_history().await;
                    self.publish_history().await;
                }
            }
            AppCommand::UpdateConfig(new_config) => self.update_config(new_config).await,
            AppCommand::Shutdown => {}
        }
    }

    async fn send_file(&mut self, peer_key: &str, path: PathBuf) {
        let Some(peer) = self.registry.get(peer_key).cloned() else {
            self.emit(AppEvent::Error(format!("Unknown peer {}", peer_key)))
                .await;
            return;
        };
        if peer.is_browser_peer {
            self.share_file(path).await;
            return;
        }

        let target = SocketAddr::new(peer.address, self.options.peer_transfer_port);
        let identity = self.identity.clone();
        let config = self.config.clone();
        let event_tx = self.internal_tx.clone();
        tracing::info!("Sending {:?} to {} ({})", path, peer.nickname, target);

        tokio::spawn(async move {
            let record = match transfer::prepare_outgoing(&path, &peer).await {
                Ok(r) => r,
                Err(e) => {
                    let _ = event_tx
                        .send(AppEvent::Error(format!("Cannot send {:?}: {}", path, e)))
                        .await;
                    return;
                }
            };
            let mut tracker = TransferTracker::new(record, event_tx.clone());
            if let Err(e) =
                transfer::send_file(target, &path, &mut tracker, &identity, &config).await
            {
                let _ = event_tx
                    .send(AppEvent::Error(format!(
                        "Sending {} to {} failed: {}",
                        tracker.record().file_name,
                        peer.nickname,
                        e
                    )))
                    .await;
            }
        });
    }

    async fn share_file(&mut self, path: PathBuf) {
        let browser = Peer::browser();
        match transfer::prepare_outgoing(&path, &browser).await {
            Ok(record) => self.gateway.share_file(path, record).await,
            Err(e) => {
                self.emit(AppEvent::Error(format!("Cannot share {:?}: {}", path, e)))
                    .await
            }
        }
    }

    async fn update_config(&mut self, new_config: AppConfig) {
        if self.options.persist_config {
            if let Err(e) = new_config.save() {
                tracing::warn!("Cannot save settings: {:#}", e);
                self.emit(AppEvent::Error(format!("Cannot save settings: {}", e)))
                    .await;
            }
        }

        self.identity = LocalIdentity::load(&new_config).await;
        *self.config.write().await = new_config;

        if let Some(discovery) = &self.discovery {
            discovery.update_identity(&self.identity).await;
        }
        self.gateway.update_identity(self.identity.clone()).await;
        if self.registry.refresh_self(&self.identity) {
            self.publish_peers().await;
        }
    }
}
