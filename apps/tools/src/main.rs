use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use server_api::auth::{issue_token, AuthConfig};
use shared::{
    conversation::GroupSettings,
    domain::{UserId, UserProfile},
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates or renames a user profile.
    SeedUser {
        user_id: String,
        display_name: String,
    },
    /// Prints a bearer credential for an existing user.
    MintToken {
        user_id: String,
        #[arg(long, env = "APP__JWT_SECRET", default_value = "devsecret")]
        secret: String,
        #[arg(long, default_value_t = 86_400)]
        ttl_seconds: i64,
    },
    CreateGroup {
        creator: String,
        name: String,
        #[arg(required = true)]
        members: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::SeedUser {
            user_id,
            display_name,
        } => {
            let profile = UserProfile {
                id: UserId::new(user_id),
                display_name,
            };
            storage.upsert_user(&profile).await?;
            println!("seeded user_id={}", profile.id);
        }
        Command::MintToken {
            user_id,
            secret,
            ttl_seconds,
        } => {
            let Some(profile) = storage.user_profile(&UserId::new(user_id.as_str())).await? else {
                bail!("unknown user {user_id}; run seed-user first");
            };
            let cfg = AuthConfig {
                secret,
                ttl_seconds,
            };
            println!("{}", issue_token(&cfg, &profile, Utc::now())?);
        }
        Command::CreateGroup {
            creator,
            name,
            members,
        } => {
            let conversation = storage
                .create_group(
                    &UserId::new(creator),
                    members.into_iter().map(UserId::new).collect(),
                    &name,
                    GroupSettings::default(),
                    Utc::now(),
                )
                .await?;
            println!("created conversation_id={}", conversation.id);
        }
    }

    Ok(())
}
