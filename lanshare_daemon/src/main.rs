use lanshare_core::config::AppConfig;
use lanshare_core::peer::{Peer, PeerStatus};
use lanshare_core::transfer::{TransferRecord, TransferStatus};
use lanshare_core::{AppCommand, AppEvent, run_backend};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod console;

use console::{HELP, Input, parse_line};

/// What the console remembers from the event stream
#[derive(Default)]
struct ConsoleState {
    peers: Vec<Peer>,
    history: Vec<TransferRecord>,
}

impl ConsoleState {
    fn apply(&mut self, event: &AppEvent) {
        match event {
            AppEvent::PeersChanged(peers) => self.peers = peers.clone(),
            AppEvent::HistoryChanged(records) => self.history = records.clone(),
            AppEvent::TransferUpdated(record) => {
                match self.history.iter_mut().find(|r| r.id == record.id) {
                    Some(existing) => *existing = record.clone(),
                    None => self.history.insert(0, record.clone()),
                }
            }
            _ => {}
        }
    }

    fn print_peers(&self) {
        for peer in &self.peers {
            let status = match peer.status() {
                PeerStatus::Online => "online",
                PeerStatus::Offline => "offline",
            };
            println!("  {:<16} {:<24} {}", peer.key(), peer.nickname, status);
        }
    }

    fn print_history(&self) {
        if self.history.is_empty() {
            println!("  (no transfers)");
        }
        for record in &self.history {
            println!(
                "  {} {:?} {} {} {:.0}% {}",
                record.id,
                record.direction,
                record.file_name,
                record.counterparty.display_name(),
                record.progress(),
                record.status().label()
            );
        }
    }
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::Status(msg) => println!("{}", msg),
        AppEvent::Error(msg) => eprintln!("error: {}", msg),
        AppEvent::ConfirmationRequested {
            transfer_id,
            file_name,
            from,
        } => println!(
            "{} wants to send you {}. Type 'accept {}' or 'decline {}'",
            from, file_name, transfer_id, transfer_id
        ),
        AppEvent::ConfirmationEscalated {
            transfer_id,
            file_name,
            from,
        } => println!(
            "Still waiting: {} from {} ({}). Answer now or the sender keeps waiting",
            file_name, from, transfer_id
        ),
        AppEvent::TransferUpdated(record) => match record.status() {
            TransferStatus::Sending | TransferStatus::Receiving => {
                tracing::debug!(
                    "{} {:.0}% {} {}",
                    record.file_name,
                    record.progress(),
                    record.speed,
                    record.eta
                );
            }
            status => println!("{}: {}", record.file_name, status.label()),
        },
        AppEvent::GatewayStarted { url } => println!("Browsers can open {}", url),
        AppEvent::DiscoveryDegraded { port } => println!(
            "Port {} is in use by another instance: this one can send but will not see other devices",
            port
        ),
        AppEvent::PeerFound(_) | AppEvent::PeersChanged(_) | AppEvent::HistoryChanged(_) => {}
        AppEvent::Stopped => println!("Stopped"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 0. Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // 1. Create channels (bounded with capacity 1000 for backpressure)
    let (tx_cmd, rx_cmd) = mpsc::channel::<AppCommand>(1000);
    let (tx_event, mut rx_event) = mpsc::channel::<AppEvent>(1000);

    // 2. Spawn Backend
    let backend = tokio::spawn(run_backend(rx_cmd, tx_event));

    println!("{}", HELP);
    let mut state = ConsoleState::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = rx_event.recv() => {
                let Some(event) = event else { break };
                state.apply(&event);
                print_event(&event);
                if matches!(event, AppEvent::Stopped) {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                let line = match line? {
                    Some(l) => l,
                    None => {
                        // stdin closed: keep serving until interrupted
                        stdin_open = false;
                        continue;
                    }
                };
                match parse_line(&line) {
                    Ok(None) => {}
                    Ok(Some(Input::Command(cmd))) => tx_cmd.send(cmd).await?,
                    Ok(Some(Input::ListPeers)) => state.print_peers(),
                    Ok(Some(Input::ListHistory)) => state.print_history(),
                    Ok(Some(Input::Rename(nickname))) => {
                        let mut config = AppConfig::load();
                        config.nickname = Some(nickname);
                        tx_cmd.send(AppCommand::UpdateConfig(config)).await?;
                    }
                    Ok(Some(Input::Help)) => println!("{}", HELP),
                    Ok(Some(Input::Quit)) => tx_cmd.send(AppCommand::Shutdown).await?,
                    Err(hint) => eprintln!("{}", hint),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tx_cmd.send(AppCommand::Shutdown).await?;
            }
        }
    }

    backend.await?;
    Ok(())
}
