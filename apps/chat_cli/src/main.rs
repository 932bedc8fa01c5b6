use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use client_core::{
    load_sync_settings, ChatHandle, ChatSession, ClientEvent, ConversationSummary,
    Credentials, Delivery, HttpConversationStore, ThreadEntry, WebSocketTransport,
};
use shared::{
    conversation::GroupSettings,
    domain::{ConversationId, TempId, UserId, UserProfile},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{Command, HELP};

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from client.toml.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, env = "CHAT_TOKEN")]
    token: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    display_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_sync_settings();
    if let Some(url) = args.server_url {
        settings.server_url = url;
    }
    let user = UserProfile {
        id: UserId::new(args.user_id.as_str()),
        display_name: args.display_name.unwrap_or_else(|| args.user_id.clone()),
    };
    let transport = WebSocketTransport::from_server_url(&settings.server_url)
        .context("building websocket url")?;
    let store = HttpConversationStore::new(settings.server_url.clone(), args.token.clone());

    let handle = ChatSession::new(
        Credentials {
            token: args.token,
            user: user.clone(),
        },
        settings,
        Arc::new(transport),
        Arc::new(store),
    )
    .spawn();

    tokio::spawn(print_events(handle.clone(), user.id.clone()));
    handle.connect().await?;
    println!("signed in as {}; /help lists commands", user.display_name);

    let mut open: Option<ConversationId> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(err) = run(&handle, &mut open, command).await {
            println!("! {err}");
        }
    }

    handle.shutdown().await?;
    Ok(())
}

fn current(open: &Option<ConversationId>) -> Result<ConversationId> {
    open.clone()
        .ok_or_else(|| anyhow!("open a conversation first"))
}

async fn run(
    handle: &ChatHandle,
    open: &mut Option<ConversationId>,
    command: Command,
) -> Result<()> {
    match command {
        Command::List => print_summaries(&handle.conversations().await?),
        Command::Search(text) => print_summaries(&handle.search(text).await?),
        Command::Open(conversation_id) => {
            handle.open_conversation(conversation_id.clone()).await?;
            *open = Some(conversation_id);
        }
        Command::Close => {
            handle.close_conversation().await?;
            *open = None;
        }
        Command::Older => handle.load_older(current(open)?).await?,
        Command::Say(text) => {
            handle.send_message(current(open)?, text).await?;
        }
        Command::Retry(temp_id) => {
            handle
                .retry_message(current(open)?, TempId::new(temp_id))
                .await?
        }
        Command::Direct(user_id) => {
            let conversation_id = handle.open_direct(user_id).await?;
            handle.open_conversation(conversation_id.clone()).await?;
            println!("opened {conversation_id}");
            *open = Some(conversation_id);
        }
        Command::Group { name, members } => {
            let conversation_id = handle
                .create_group(name, members, GroupSettings::default())
                .await?;
            println!("created {conversation_id}");
        }
        Command::Add(user_id) => handle.add_participant(current(open)?, user_id).await?,
        Command::Remove(user_id) => handle.remove_participant(current(open)?, user_id).await?,
        Command::Admin(user_id) => handle.set_admin(current(open)?, user_id).await?,
        Command::Unadmin(user_id) => handle.revoke_admin(current(open)?, user_id).await?,
        Command::Overlay(patch) => handle.update_overlay(current(open)?, patch).await?,
        Command::Online => {
            let online = handle.online_users().await?;
            if online.is_empty() {
                println!("nobody else is online");
            }
            for user in online {
                println!("  {} ({})", user.display_name, user.id);
            }
        }
        Command::Reconnect => handle.reconnect().await?,
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

fn print_summaries(summaries: &[ConversationSummary]) {
    if summaries.is_empty() {
        println!("no conversations");
    }
    for summary in summaries {
        let unread = if summary.unread > 0 {
            format!(" ({} unread)", summary.unread)
        } else {
            String::new()
        };
        println!(
            "  {} {}{}: {}",
            summary.id(),
            summary.display_name,
            unread,
            summary.preview().unwrap_or("")
        );
    }
}

fn render(entry: &ThreadEntry, me: &UserId) -> String {
    let who = if &entry.message.sender_id == me {
        "you".to_string()
    } else {
        entry.message.sender_id.to_string()
    };
    let mark = match entry.delivery {
        Delivery::Confirmed => "",
        Delivery::Pending => " …",
        Delivery::Failed => " [failed]",
    };
    format!(
        "[{}] {who}: {}{mark}",
        entry.message.timestamp.format("%H:%M"),
        entry.message.content
    )
}

/// Prints thread growth and connection changes as they arrive.
async fn print_events(handle: ChatHandle, me: UserId) {
    let mut events = handle.events();
    let mut printed: HashMap<ConversationId, usize> = HashMap::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            ClientEvent::StatusChanged(status) => println!("-- {status:?}"),
            ClientEvent::ReconnectScheduled { attempt, delay } => {
                println!("-- reconnecting in {delay:?} (attempt {attempt})")
            }
            ClientEvent::ReconnectExhausted => println!("-- offline; /reconnect to try again"),
            ClientEvent::AuthenticationFailed(message) => {
                println!("-- credential rejected: {message}")
            }
            ClientEvent::ThreadUpdated(conversation_id) => {
                let Ok(thread) = handle.thread(conversation_id.clone()).await else {
                    break;
                };
                let seen = printed.entry(conversation_id.clone()).or_default();
                if thread.len() < *seen {
                    *seen = 0;
                }
                for entry in &thread[*seen..] {
                    println!("{conversation_id} {}", render(entry, &me));
                }
                *seen = thread.len();
            }
            ClientEvent::MessageFailed {
                temp_id,
                restored_draft,
                ..
            } => {
                println!("-- not delivered ({temp_id}); /retry {temp_id}");
                if let Some(draft) = restored_draft {
                    println!("-- draft: {draft}");
                }
            }
            ClientEvent::TypingChanged(conversation_id) => {
                if let Ok(typing) = handle.typing_users(conversation_id.clone()).await {
                    if !typing.is_empty() {
                        let names: Vec<String> = typing.iter().map(ToString::to_string).collect();
                        println!("-- {} typing in {conversation_id}", names.join(", "));
                    }
                }
            }
            ClientEvent::Error(err) => println!("! {err}"),
            ClientEvent::ConversationsUpdated
            | ClientEvent::PresenceChanged(_)
            | ClientEvent::PresenceReset => {}
        }
    }
}
