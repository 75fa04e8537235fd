use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shared::domain::{GroupRole, ParticipantPair, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/peerchat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        #[arg(long)]
        display_name: Option<String>,
    },
    CreateConversation {
        user_a: i64,
        user_b: i64,
    },
    /// Creates a group with `creator_id` as its admin.
    CreateGroup {
        creator_id: i64,
        name: String,
        #[arg(long)]
        description: Option<String>,
        members: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser {
            username,
            display_name,
        } => {
            let user_id = storage
                .create_user(&username, display_name.as_deref())
                .await?;
            println!("created user_id={}", user_id.0);
        }
        Command::CreateConversation { user_a, user_b } => {
            let pair = ParticipantPair::new(UserId(user_a), UserId(user_b))
                .context("a conversation needs two different users")?;
            for user_id in [pair.low(), pair.high()] {
                if !storage.user_exists(user_id).await? {
                    bail!("no user with id {user_id}");
                }
            }
            let conversation_id = storage.create_conversation(pair).await?;
            println!("conversation_id={}", conversation_id.0);
        }
        Command::CreateGroup {
            creator_id,
            name,
            description,
            members,
        } => {
            let creator_id = UserId(creator_id);
            let name = name.trim();
            if name.is_empty() {
                bail!("group name must not be empty");
            }
            if !storage.user_exists(creator_id).await? {
                bail!("no user with id {creator_id}");
            }
            let group_id = storage
                .create_group(name, description.as_deref(), creator_id)
                .await?;
            storage
                .add_group_member(group_id, creator_id, GroupRole::Admin)
                .await?;
            let mut added = 1;
            for member_id in members.into_iter().map(UserId) {
                if member_id == creator_id || !storage.user_exists(member_id).await? {
                    eprintln!("skipping user {member_id}");
                    continue;
                }
                if storage.group_member(group_id, member_id).await?.is_some() {
                    continue;
                }
                storage
                    .add_group_member(group_id, member_id, GroupRole::Member)
                    .await?;
                added += 1;
            }
            println!("created group_id={} members={added}", group_id.0);
        }
    }

    Ok(())
}
