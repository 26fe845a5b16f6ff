use anyhow::Context;
use clap::{Parser, Subcommand};

mod commands;
mod config;
mod nostr_client;
mod output;

use output::Output;

#[derive(Parser)]
#[command(name = "nrooms")]
#[command(version)]
#[command(about = "CLI for encrypted Nostr rooms")]
#[command(long_about = "A command-line tool for end-to-end encrypted group rooms over Nostr.\n\nDesigned for humans, AI agents, and automation.")]
struct Cli {
    /// Output in JSON format (for agents/scripts)
    #[arg(short, long, global = true)]
    json: bool,

    /// Data directory (default: platform data dir/nrooms)
    #[arg(long, global = true, env = "NROOMS_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log more (-v info, -vv debug, -vvv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Login with a private key
    Login {
        /// Private key (nsec or hex)
        key: String,
    },

    /// Logout and clear all data
    Logout,

    /// Show current identity
    Whoami,

    /// Room management
    #[command(subcommand)]
    Room(RoomCommands),

    /// Invite management
    #[command(subcommand)]
    Invite(InviteCommands),

    /// Leave a room
    Leave {
        /// Room ID
        room_id: String,
    },

    /// Remove a member from a room (owner/admin)
    Remove {
        /// Room ID
        room_id: String,
        /// Member public key (hex or npub)
        pubkey: String,
    },

    /// Room key management
    #[command(subcommand)]
    Key(KeyCommands),

    /// Send a message to a room
    Send {
        /// Room ID
        room_id: String,
        /// Message content
        message: String,
    },

    /// Read messages from a room
    Read {
        /// Room ID
        room_id: String,
        /// Maximum number of messages to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Listen for invites and new messages
    Listen {
        /// Specific room ID (optional, listens to all known rooms if not specified)
        #[arg(short, long)]
        room: Option<String>,
    },

    /// Encrypted direct messages
    #[command(subcommand)]
    Dm(DmCommands),
}

#[derive(Subcommand)]
enum RoomCommands {
    /// Create a room
    Create {
        /// Room name
        name: String,
        /// Room description
        #[arg(long)]
        about: Option<String>,
        /// Initial admin (repeatable)
        #[arg(long = "admin")]
        admins: Vec<String>,
        /// Initial member (repeatable)
        #[arg(long = "member")]
        members: Vec<String>,
    },

    /// List known rooms
    List,

    /// Show room details
    Show {
        /// Room ID
        id: String,
    },

    /// List room members
    Members {
        /// Room ID
        id: String,
    },

    /// Archive a room (owner)
    Archive {
        /// Room ID
        id: String,
    },
}

#[derive(Subcommand)]
enum InviteCommands {
    /// Invite someone to a room
    Send {
        /// Room ID
        room_id: String,
        /// Invitee public key (hex or npub)
        pubkey: String,
    },

    /// List invites
    List {
        /// Show invites we sent instead of received ones
        #[arg(long)]
        sent: bool,
    },

    /// Accept an invite and join its room
    Accept {
        /// Invite ID
        invite_id: String,
    },

    /// Reject an invite
    Reject {
        /// Invite ID
        invite_id: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Fetch room keys addressed to us
    Refresh {
        /// Room ID (all rooms if not specified)
        room_id: Option<String>,
        /// Decrypt and overwrite keys that are already cached
        #[arg(long)]
        force: bool,
    },

    /// Distribute a new room key to current members (owner/admin)
    Rotate {
        /// Room ID
        room_id: String,
    },
}

#[derive(Subcommand)]
enum DmCommands {
    /// Fetch and cache encrypted DMs addressed to us
    Sync,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let output = Output::new(cli.json);

    let result = run(cli, &output).await;

    if let Err(e) = result {
        output.error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("Could not find data directory")?
            .join("nrooms"),
    };
    std::fs::create_dir_all(&data_dir)?;

    let mut config = config::Config::load(&data_dir)?;

    let command = match cli.command {
        Commands::Login { key } => return commands::identity::login(&key, &config, output).await,
        Commands::Logout => return commands::identity::logout(&data_dir, output).await,
        Commands::Whoami => return commands::identity::whoami(&config, output).await,
        command => command,
    };

    // Everything else needs an identity; generate one on first use.
    let (pubkey, was_generated) = config.ensure_identity()?;
    if was_generated {
        let pk = nostr::PublicKey::from_hex(&pubkey)?;
        let npub = nostr::ToBech32::to_bech32(&pk)?;
        eprintln!("Generated new identity: {}", npub);
    }

    let sync = commands::connect(&config, &data_dir).await?;
    let result = match command {
        Commands::Room(cmd) => match cmd {
            RoomCommands::Create {
                name,
                about,
                admins,
                members,
            } => commands::room::create(&sync, &name, about, &admins, &members, output).await,
            RoomCommands::List => commands::room::list(&sync, output).await,
            RoomCommands::Show { id } => commands::room::show(&sync, &id, output).await,
            RoomCommands::Members { id } => commands::room::members(&sync, &id, output).await,
            RoomCommands::Archive { id } => commands::room::archive(&sync, &id, output).await,
        },
        Commands::Invite(cmd) => match cmd {
            InviteCommands::Send { room_id, pubkey } => {
                commands::invite::send(&sync, &room_id, &pubkey, output).await
            }
            InviteCommands::List { sent } => commands::invite::list(&sync, sent, output).await,
            InviteCommands::Accept { invite_id } => {
                commands::invite::accept(&sync, &invite_id, output).await
            }
            InviteCommands::Reject { invite_id } => {
                commands::invite::reject(&sync, &invite_id, output).await
            }
        },
        Commands::Leave { room_id } => commands::room::leave(&sync, &room_id, output).await,
        Commands::Remove { room_id, pubkey } => {
            commands::room::remove(&sync, &room_id, &pubkey, output).await
        }
        Commands::Key(cmd) => match cmd {
            KeyCommands::Refresh { room_id, force } => {
                commands::key::refresh(&sync, room_id.as_deref(), force, output).await
            }
            KeyCommands::Rotate { room_id } => {
                commands::key::rotate(&sync, &room_id, output).await
            }
        },
        Commands::Send { room_id, message } => {
            commands::message::send(&sync, &room_id, &message, output).await
        }
        Commands::Read { room_id, limit } => {
            commands::message::read(&sync, &room_id, limit, output).await
        }
        Commands::Listen { room } => {
            commands::message::listen(&sync, room.as_deref(), output).await
        }
        Commands::Dm(DmCommands::Sync) => commands::dm::sync_dms(&sync, output).await,
        Commands::Login { .. } | Commands::Logout | Commands::Whoami => Ok(()),
    };

    sync.transport().shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_room_create() {
        let cli = Cli::try_parse_from([
            "nrooms", "--json", "room", "create", "Plans", "--about", "weekend", "--admin", "a",
            "--member", "b", "--member", "c",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Room(RoomCommands::Create {
                name,
                about,
                admins,
                members,
            }) => {
                assert_eq!(name, "Plans");
                assert_eq!(about.as_deref(), Some("weekend"));
                assert_eq!(admins, vec!["a".to_string()]);
                assert_eq!(members, vec!["b".to_string(), "c".to_string()]);
            }
            _ => panic!("expected room create"),
        }
    }

    #[test]
    fn test_parse_verbosity_and_key_refresh() {
        let cli = Cli::try_parse_from(["nrooms", "-vv", "key", "refresh", "--force"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Key(KeyCommands::Refresh {
                room_id: None,
                force: true
            })
        ));
    }
}
