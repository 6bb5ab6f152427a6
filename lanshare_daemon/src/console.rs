//! Line commands typed on stdin

use lanshare_core::AppCommand;
use std::path::PathBuf;

/// What a typed line asks for
#[derive(Debug, PartialEq)]
pub enum Input {
    /// Forward to the backend
    Command(AppCommand),
    ListPeers,
    ListHistory,
    /// Change the nickname in the settings
    Rename(String),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  peers                      list known devices
  refresh                    mark everyone offline and re-scan
  send <peer> <path>         send a file (peer = IP address or 'browser')
  share <path>               offer a file on the web gateway
  unshare                    stop offering it
  accept <id> | decline <id> answer a pending transfer
  forget <peer>              remove an offline device
  history                    list transfers
  history clear [peer]       clear all history, or one device's
  name <nickname>            change the display name
  quit";

/// Parse one line; `Err` carries a usage hint
pub fn parse_line(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };

    let input = match (word, rest) {
        ("peers", _) => Input::ListPeers,
        ("history", "") => Input::ListHistory,
        ("history", r) if r == "clear" => Input::Command(AppCommand::ClearHistory { peer_key: None }),
        ("history", r) => match r.strip_prefix("clear ") {
            Some(key) => Input::Command(AppCommand::ClearHistory {
                peer_key: Some(key.trim().to_string()),
            }),
            None => return Err("usage: history [clear [peer]]".into()),
        },
        ("refresh", _) => Input::Command(AppCommand::BroadcastNow),
        ("unshare", _) => Input::Command(AppCommand::ClearShare),
        ("help", _) | ("?", _) => Input::Help,
        ("quit", _) | ("exit", _) => Input::Quit,
        (_, "") => return Err(format!("unknown or incomplete command '{}', try 'help'", word)),
        ("send", r) => {
            let Some((peer_key, path)) = r.split_once(char::is_whitespace) else {
                return Err("usage: send <peer> <path>".into());
            };
            Input::Command(AppCommand::SendFile {
                peer_key: peer_key.to_string(),
                path: PathBuf::from(path.trim()),
            })
        }
        ("share", r) => Input::Command(AppCommand::ShareFile {
            path: PathBuf::from(r),
        }),
        ("accept", id) | ("decline", id) => Input::Command(AppCommand::RespondConfirmation {
            transfer_id: id.to_string(),
            accepted: word == "accept",
        }),
        ("name", nickname) => Input::Rename(nickname.to_string()),
        ("forget", key) => Input::Command(AppCommand::ForgetPeer {
            key: key.to_string(),
        }),
        _ => return Err(format!("unknown command '{}', try 'help'", word)),
    };
    Ok(Some(input))
}
