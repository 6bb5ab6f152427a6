use lanshare_core::config::AppConfig;
use lanshare_core::confirm::ConfirmationGate;
use lanshare_core::peer::{NetworkKind, Peer, PeerSighting};
use lanshare_core::storage::Storage;
use lanshare_core::transfer::record::Direction;
use lanshare_core::transfer::{ReceiverContext, TransferStatus, bind_listener, run_server};
use lanshare_core::{AppCommand, AppEvent, BackendOptions, run_backend_with};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const REMOTE_KEY: &str = "127.0.0.2";

/// A remote node that accepts everything; returns its transfer port
async fn start_remote(save_dir: &Path, cancel: CancellationToken) -> u16 {
    let (event_tx, mut event_rx) = mpsc::channel(1024);
    let config = AppConfig {
        save_dir: save_dir.to_path_buf(),
        ..AppConfig::default()
    };
    let ctx = Arc::new(ReceiverContext {
        config: config.shared(),
        gate: Arc::new(ConfirmationGate::new()),
        event_tx,
    });
    let gate = ctx.gate.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let AppEvent::ConfirmationRequested { transfer_id, .. } = event {
                gate.respond(&transfer_id, true).await;
            }
        }
    });

    let listener = bind_listener("0.0.0.0:0".parse().unwrap()).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(run_server(listener, ctx, cancel));
    port
}

fn options(storage_dir: &Path, save_dir: &Path, peer_transfer_port: u16) -> BackendOptions {
    let localhost = |port: u16| SocketAddr::from(([127, 0, 0, 1], port));
    BackendOptions {
        config: AppConfig {
            save_dir: save_dir.to_path_buf(),
            nickname: Some("Tess".into()),
            ..AppConfig::default()
        },
        storage: Storage::new(storage_dir),
        discovery_port: 0,
        discovery_target: localhost(9),
        transfer_addr: localhost(0),
        peer_transfer_port,
        gateway_addr: localhost(0),
        persist_config: false,
    }
}

/// Skip events until one matches
async fn wait_for<F>(rx: &mut mpsc::Receiver<AppEvent>, mut pred: F) -> AppEvent
where
    F: FnMut(&AppEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let event = rx.recv().await.expect("backend event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

async fn seed_remote_peer(storage: &Storage) {
    let remote = Peer::from_sighting(
        PeerSighting {
            nickname: "Remy".into(),
            accent_color: "#FF00AA00".into(),
            avatar: None,
            address: REMOTE_KEY.parse().unwrap(),
            network_kind: NetworkKind::Unknown,
        },
        0,
    );
    storage.save_peers(&[remote]).await.unwrap();
}

#[tokio::test]
async fn test_backend_sends_file_and_records_history() {
    // 1. A remote receiver and a cached entry pointing at it
    let storage_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let port = start_remote(remote_dir.path(), cancel.clone()).await;
    seed_remote_peer(&Storage::new(storage_dir.path())).await;

    // 2. Start the backend
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(1024);
    let own_save = tempfile::tempdir().unwrap();
    let backend = tokio::spawn(run_backend_with(
        options(storage_dir.path(), own_save.path(), port),
        cmd_rx,
        event_tx,
    ));

    let event = wait_for(&mut event_rx, |e| matches!(e, AppEvent::PeersChanged(_))).await;
    let AppEvent::PeersChanged(peers) = event else { unreachable!() };
    assert!(peers[0].is_self);
    assert_eq!(peers[0].nickname, "Tess (you)");
    assert!(peers[1].is_browser_peer);
    let cached = peers.iter().find(|p| p.key() == REMOTE_KEY).unwrap();
    assert!(!cached.is_online());

    let event = wait_for(&mut event_rx, |e| matches!(e, AppEvent::GatewayStarted { .. })).await;
    let AppEvent::GatewayStarted { url } = event else { unreachable!() };
    assert!(url.starts_with("http://"));

    // 3. Send a file through the backend
    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("minutes.txt");
    std::fs::write(&src, b"meeting at noon").unwrap();
    cmd_tx
        .send(AppCommand::SendFile {
            peer_key: REMOTE_KEY.into(),
            path: src.clone(),
        })
        .await
        .unwrap();

    let event = wait_for(&mut event_rx, |e| {
        matches!(e, AppEvent::TransferUpdated(r)
            if r.direction == Direction::Outgoing && r.status().is_terminal())
    })
    .await;
    let AppEvent::TransferUpdated(record) = event else { unreachable!() };
    assert_eq!(record.status(), TransferStatus::Completed);
    assert_eq!(record.counterparty.key, REMOTE_KEY);

    // The remote may still be flushing when the sender reports completion
    let saved = remote_dir.path().join("minutes.txt");
    tokio::time::timeout(Duration::from_secs(10), async {
        while std::fs::read(&saved).ok().as_deref() != Some(&b"meeting at noon"[..]) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("remote never saved the file");

    // 4. Shut down; the finished transfer is on disk
    cmd_tx.send(AppCommand::Shutdown).await.unwrap();
    wait_for(&mut event_rx, |e| matches!(e, AppEvent::Stopped)).await;
    backend.await.unwrap();

    let history = Storage::new(storage_dir.path()).load_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, record.id);
    assert_eq!(history[0].status(), TransferStatus::Completed);

    cancel.cancel();
}

#[tokio::test]
async fn test_backend_commands_update_state() {
    let storage_dir = tempfile::tempdir().unwrap();
    seed_remote_peer(&Storage::new(storage_dir.path())).await;

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(1024);
    let own_save = tempfile::tempdir().unwrap();
    let backend = tokio::spawn(run_backend_with(
        options(storage_dir.path(), own_save.path(), 9),
        cmd_rx,
        event_tx,
    ));
    wait_for(&mut event_rx, |e| matches!(e, AppEvent::GatewayStarted { .. })).await;

    // Unknown ticket
    cmd_tx
        .send(AppCommand::RespondConfirmation {
            transfer_id: "nope".into(),
            accepted: true,
        })
        .await
        .unwrap();
    wait_for(&mut event_rx, |e| matches!(e, AppEvent::Error(_))).await;

    // Forgetting the offline cached peer
    cmd_tx
        .send(AppCommand::ForgetPeer {
            key: REMOTE_KEY.into(),
        })
        .await
        .unwrap();
    let event = wait_for(&mut event_rx, |e| matches!(e, AppEvent::PeersChanged(_))).await;
    let AppEvent::PeersChanged(peers) = event else { unreachable!() };
    assert!(peers.iter().all(|p| p.key() != REMOTE_KEY));

    // Renaming shows up on the self entry
    let mut config = AppConfig {
        save_dir: own_save.path().to_path_buf(),
        ..AppConfig::default()
    };
    config.nickname = Some("Theo".into());
    cmd_tx.send(AppCommand::UpdateConfig(config)).await.unwrap();
    let event = wait_for(&mut event_rx, |e| matches!(e, AppEvent::PeersChanged(_))).await;
    let AppEvent::PeersChanged(peers) = event else { unreachable!() };
    assert_eq!(peers[0].nickname, "Theo (you)");

    // Closing the command channel stops the backend too
    drop(cmd_tx);
    wait_for(&mut event_rx, |e| matches!(e, AppEvent::Stopped)).await;
    backend.await.unwrap();

    assert!(Storage::new(storage_dir.path()).load_peers().await.is_empty());
}
