//! Line commands typed at the prompt.

use shared::{
    domain::{ConversationId, UserId},
    protocol::OverlayPatch,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Search(String),
    Open(ConversationId),
    Close,
    Older,
    /// Plain text goes to the open conversation.
    Say(String),
    Retry(String),
    Direct(UserId),
    Group { name: String, members: Vec<UserId> },
    Add(UserId),
    Remove(UserId),
    Admin(UserId),
    Unadmin(UserId),
    Overlay(OverlayPatch),
    Online,
    Reconnect,
    Help,
    Quit,
}

pub const HELP: &str = "\
/list                     conversations, most recent first
/search <text>            filter by name or last message
/open <conversation>      open a thread and mark it read
/close                    close the open thread
/older                    load an older page of the open thread
/retry <temp id>          resend a failed message
/dm <user>                open a direct conversation
/group <name> <user>...   create a group
/add|/remove <user>       change group membership
/admin|/unadmin <user>    grant or revoke admin rights
/pin|/unpin|/mute|/unmute|/archive|/unarchive
/nick <name>              set a private nickname
/online                   users known to be online
/reconnect                reconnect now
/quit";

pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };
    let (verb, arg) = match rest.split_once(char::is_whitespace) {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (rest, ""),
    };

    let command = match verb {
        "list" | "ls" => Command::List,
        "search" => Command::Search(arg.to_string()),
        "open" => Command::Open(ConversationId::new(required(verb, arg)?)),
        "close" => Command::Close,
        "older" => Command::Older,
        "retry" => Command::Retry(required(verb, arg)?.to_string()),
        "dm" => Command::Direct(UserId::new(required(verb, arg)?)),
        "group" => {
            let mut words = arg.split_whitespace();
            let name = words
                .next()
                .ok_or_else(|| "usage: /group <name> <user>...".to_string())?;
            let members: Vec<UserId> = words.map(UserId::new).collect();
            if members.is_empty() {
                return Err("a group needs at least one other member".into());
            }
            Command::Group {
                name: name.to_string(),
                members,
            }
        }
        "add" => Command::Add(UserId::new(required(verb, arg)?)),
        "remove" | "kick" => Command::Remove(UserId::new(required(verb, arg)?)),
        "admin" => Command::Admin(UserId::new(required(verb, arg)?)),
        "unadmin" => Command::Unadmin(UserId::new(required(verb, arg)?)),
        "pin" | "unpin" => Command::Overlay(OverlayPatch {
            pinned: Some(verb == "pin"),
            ..OverlayPatch::default()
        }),
        "mute" | "unmute" => Command::Overlay(OverlayPatch {
            muted: Some(verb == "mute"),
            ..OverlayPatch::default()
        }),
        "archive" | "unarchive" => Command::Overlay(OverlayPatch {
            archived: Some(verb == "archive"),
            ..OverlayPatch::default()
        }),
        "nick" => Command::Overlay(OverlayPatch {
            nickname: Some(arg.to_string()),
            ..OverlayPatch::default()
        }),
        "online" => Command::Online,
        "reconnect" => Command::Reconnect,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other}; try /help")),
    };
    Ok(Some(command))
}

fn required<'a>(verb: &str, arg: &'a str) -> Result<&'a str, String> {
    if arg.is_empty() {
        Err(format!("/{verb} needs an argument"))
    } else {
        Ok(arg)
    }
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
