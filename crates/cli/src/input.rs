use parley_sync::Command;

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    Help,
    Quit,
    Ignored,
}

pub const HELP: &str = "\
/connect          connect to the chat server
/reconnect        drop the channel and connect again
/select <user-id> open the conversation with a user
/logout           log out and forget the saved session
/quit             exit without logging out
anything else     sends a message to the open conversation";

pub fn parse_line(line: &str) -> Input {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Input::Ignored;
    }

    let Some(rest) = line.trim_start().strip_prefix('/') else {
        return Input::Command(Command::SendMessage(line.to_string()));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };

    match (name, argument) {
        ("connect", _) => Input::Command(Command::Connect),
        ("reconnect", _) => Input::Command(Command::Reconnect),
        ("select", peer_id) if !peer_id.is_empty() => {
            Input::Command(Command::SelectPeer(peer_id.to_string()))
        }
        ("logout", _) => Input::Command(Command::Logout),
        ("quit" | "exit", _) => Input::Quit,
        _ => Input::Help,
    }
}
