use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use client_core::{ChatEngine, ClientEvent, EngineConfig};
use shared::domain::{CallKind, GroupId, GroupMessageId, MessageKind, UserId};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "peerchat", about = "Chat and call client")]
#[command(group(ArgGroup::new("identity").required(true).args(["username", "user_id"])))]
struct Args {
    #[arg(long, env = "PEERCHAT_SERVER_URL")]
    server_url: Option<String>,
    /// Backing store for the direct fallback; pass an empty value to disable it.
    #[arg(long, env = "PEERCHAT_DATABASE_URL")]
    database_url: Option<String>,
    /// Sign in by username through the server.
    #[arg(long)]
    username: Option<String>,
    #[arg(long, requires = "username")]
    display_name: Option<String>,
    /// Act as an existing user without signing in.
    #[arg(long)]
    user_id: Option<i64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List one-to-one conversations.
    Chats,
    /// Send a message to a user, then follow delivery for a while.
    Send {
        to: i64,
        text: String,
        #[arg(long, default_value_t = 5)]
        follow_secs: u64,
    },
    History {
        with: i64,
        /// Defaults to the configured page size.
        #[arg(long)]
        limit: Option<u32>,
    },
    Groups,
    GroupCreate {
        name: String,
        #[arg(long)]
        description: Option<String>,
        members: Vec<i64>,
    },
    GroupSend {
        group_id: i64,
        text: String,
        #[arg(long)]
        reply_to: Option<i64>,
    },
    GroupHistory {
        group_id: i64,
        #[arg(long)]
        limit: Option<u32>,
    },
    #[command(group(ArgGroup::new("target").required(true).args(["user", "group"])))]
    Call {
        #[arg(long)]
        user: Option<i64>,
        #[arg(long)]
        group: Option<i64>,
        #[arg(long)]
        video: bool,
    },
    Calls,
    Answer {
        call_id: i64,
    },
    Hangup {
        call_id: i64,
    },
    /// Print engine events until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let mut config = EngineConfig::from_env();
    if let Some(url) = args.server_url {
        config.server_url = url.trim_end_matches('/').to_string();
    }
    if let Some(url) = args.database_url {
        config.database_url = (!url.trim().is_empty()).then_some(url);
    }

    let user_id = match (args.user_id, args.username) {
        (Some(id), _) => UserId(id),
        (None, Some(username)) => {
            client_core::login(&config.server_url, &username, args.display_name.as_deref())
                .await
                .context("sign in failed")?
        }
        (None, None) => anyhow::bail!("either --username or --user-id is required"),
    };

    let engine = ChatEngine::builder(config, user_id).build().await?;
    let online = engine.connect().await;
    eprintln!(
        "user_id={user_id} server={}",
        if online { "online" } else { "offline" }
    );

    let outcome = run(&engine, args.command).await;
    engine.shutdown().await;
    outcome
}

async fn run(engine: &ChatEngine, command: Command) -> Result<()> {
    match command {
        Command::Chats => {
            for chat in engine.conversations().list_conversations().await {
                let preview = chat
                    .last_message
                    .as_ref()
                    .map(|m| m.content.as_str())
                    .unwrap_or("");
                println!(
                    "{:>12}  {:<16} unread={:<3} {}",
                    chat.id.to_string(),
                    chat.other_participant_name(),
                    chat.unread_count,
                    preview
                );
            }
        }
        Command::Send {
            to,
            text,
            follow_secs,
        } => {
            let mut events = engine.subscribe_events();
            let chats = engine.conversations();
            chats.list_conversations().await;
            let id = chats.create_or_get_conversation(UserId(to)).await?;
            let message = chats
                .send_message(&id, &text, MessageKind::Text, None)
                .await?;
            println!("queued {} in {id}", message.client_key);
            follow(&mut events, Some(Duration::from_secs(follow_secs))).await;
        }
        Command::History { with, limit } => {
            let chats = engine.conversations();
            chats.list_conversations().await;
            let id = chats.create_or_get_conversation(UserId(with)).await?;
            let messages = match limit {
                Some(limit) => chats.load_messages(&id, limit, 0).await,
                None => chats.load_recent_messages(&id).await,
            };
            for message in messages {
                println!(
                    "{}  #{:<6} [{}] {}",
                    message.created_at.format("%Y-%m-%d %H:%M:%S"),
                    message.sender_id.to_string(),
                    message.status,
                    message.content
                );
            }
        }
        Command::Groups => {
            for group in engine.groups().list_groups().await {
                println!(
                    "{:>6}  {:<20} members={:<3} unread={}",
                    group.group_id.to_string(),
                    group.name,
                    group.member_count,
                    group.unread_count
                );
            }
        }
        Command::GroupCreate {
            name,
            description,
            members,
        } => {
            let group = engine
                .groups()
                .create_group(
                    &name,
                    description.as_deref(),
                    members.into_iter().map(UserId).collect(),
                )
                .await?;
            println!(
                "created group_id={} members={}",
                group.group_id, group.member_count
            );
        }
        Command::GroupSend {
            group_id,
            text,
            reply_to,
        } => {
            let groups = engine.groups();
            groups.list_groups().await;
            let message = groups
                .send_group_message(
                    GroupId(group_id),
                    &text,
                    MessageKind::Text,
                    None,
                    reply_to.map(GroupMessageId),
                )
                .await?;
            println!("sent {:?}", message.id);
        }
        Command::GroupHistory { group_id, limit } => {
            let groups = engine.groups();
            let messages = match limit {
                Some(limit) => groups.get_group_messages(GroupId(group_id), limit, 0).await,
                None => groups.recent_group_messages(GroupId(group_id)).await,
            };
            for message in messages {
                let sender = message
                    .sender_name
                    .clone()
                    .unwrap_or_else(|| message.sender_id.to_string());
                match &message.reply_preview {
                    Some(preview) => println!(
                        "{:<12} {}  (re: {})",
                        sender, message.content, preview.content
                    ),
                    None => println!("{:<12} {}", sender, message.content),
                }
            }
        }
        Command::Call { user, group, video } => {
            let kind = if video { CallKind::Video } else { CallKind::Voice };
            let call = engine
                .calls()
                .start_call(user.map(UserId), group.map(GroupId), kind)
                .await?;
            println!("calling call_id={} ({})", call.call_id, call.call_type);
        }
        Command::Calls => {
            for call in engine.calls().refresh_calls().await {
                println!(
                    "{:>6}  {:<6} {:<9} from={} duration={}",
                    call.call_id.to_string(),
                    call.call_type.as_str(),
                    call.status.as_str(),
                    call.caller_id,
                    call.duration_seconds
                        .map(|s| format!("{s}s"))
                        .unwrap_or_else(|| "-".into())
                );
            }
        }
        Command::Answer { call_id } => {
            engine.calls().refresh_calls().await;
            let call = engine
                .calls()
                .answer_call(shared::domain::CallId(call_id))
                .await?;
            println!("call_id={} {}", call.call_id, call.status);
        }
        Command::Hangup { call_id } => {
            engine.calls().refresh_calls().await;
            let call = engine
                .calls()
                .end_call(shared::domain::CallId(call_id))
                .await?;
            println!("call_id={} {}", call.call_id, call.status);
        }
        Command::Watch => {
            let mut events = engine.subscribe_events();
            engine.conversations().list_conversations().await;
            engine.groups().list_groups().await;
            tokio::select! {
                _ = follow(&mut events, None) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
    }
    Ok(())
}

/// Prints events for `window` (forever when `None`), or until the engine
/// goes away.
async fn follow(events: &mut broadcast::Receiver<ClientEvent>, window: Option<Duration>) {
    let deadline = window.map(|w| tokio::time::Instant::now() + w);
    loop {
        let received = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(received) => received,
                Err(_) => return,
            },
            None => events.recv().await,
        };
        let event = match received {
            Ok(event) => event,
            Err(RecvError::Closed) => return,
            Err(RecvError::Lagged(skipped)) => {
                eprintln!("(skipped {skipped} events)");
                continue;
            }
        };
        if let Some(line) = describe(&event) {
            println!("{line}");
        }
    }
}

fn describe(event: &ClientEvent) -> Option<String> {
    Some(match event {
        ClientEvent::GateChanged { available } => {
            format!("server {}", if *available { "reachable" } else { "unreachable" })
        }
        ClientEvent::ConversationRemapped {
            provisional,
            conversation_id,
        } => format!("conversation {provisional} is now {conversation_id}"),
        ClientEvent::MessageAppended(message) => format!(
            "{} #{}: {}",
            message.conversation_id, message.sender_id, message.content
        ),
        ClientEvent::MessageConfirmed {
            client_key,
            message_id,
            ..
        } => format!("{client_key} stored as {message_id}"),
        ClientEvent::MessageStatusChanged {
            client_key, status, ..
        } => format!("{client_key} {status}"),
        ClientEvent::PeerTyping {
            conversation_id,
            is_typing,
        } => format!(
            "{conversation_id} {}",
            if *is_typing { "typing..." } else { "stopped typing" }
        ),
        ClientEvent::GroupMessageAppended(message) => format!(
            "group {} #{}: {}",
            message.group_id, message.sender_id, message.content
        ),
        ClientEvent::GroupMessageFailed {
            group_id, reason, ..
        } => format!("group {group_id} send failed: {reason}"),
        ClientEvent::IncomingCall(call) => format!(
            "incoming {} call {} from {}",
            call.call_type, call.call_id, call.caller_id
        ),
        ClientEvent::CallUpdated(call) => format!("call {} {}", call.call_id, call.status),
        ClientEvent::Error(message) => format!("error: {message}"),
        _ => return None,
    })
}
