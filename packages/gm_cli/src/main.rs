use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

mod cli;

use cli::Workspace;

#[derive(Parser)]
#[command(name = "gm")]
#[command(about = "Hold a live tabletop session from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.gm_link)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with an account
    Login(LoginArgs),
    /// Create an account and sign in
    Register(RegisterArgs),
    /// Forget every stored credential
    Logout,
    /// Open a new game session as its game master
    Create,
    /// Join a game session by its code
    Join(JoinArgs),
    /// Check that a previous session can be resumed
    Rejoin,
    /// Start play in the session this client runs as game master
    Start,
    /// Show the service's view of the current session
    Info(InfoArgs),
    /// Follow the current session until it ends
    Watch,
    /// Leave the current session, keeping the account sign-in
    Leave,
    /// Show stored identity and effective configuration
    Status(StatusArgs),
}

#[derive(Parser)]
struct LoginArgs {
    username: String,
    /// Read from stdin when omitted
    #[arg(long)]
    password: Option<String>,
}

#[derive(Parser)]
struct RegisterArgs {
    username: String,
    /// Name shown to other players (defaults to the username)
    #[arg(long)]
    display_name: Option<String>,
    /// Read from stdin when omitted
    #[arg(long)]
    password: Option<String>,
}

#[derive(Parser)]
struct JoinArgs {
    /// Session code given by the game master
    code: String,
    /// Player name in this session
    name: String,
}

#[derive(Parser)]
struct InfoArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "gm=debug,gm_link=debug,info"
    } else {
        "gm=info,gm_link=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let workspace = Workspace::open(cli.data_dir)?;

    match cli.command {
        Commands::Login(args) => {
            cli::account::login_command(&workspace, &args.username, args.password).await
        }
        Commands::Register(args) => {
            cli::account::register_command(
                &workspace,
                &args.username,
                args.display_name.as_deref(),
                args.password,
            )
            .await
        }
        Commands::Logout => cli::account::logout_command(&workspace),
        Commands::Create => cli::session::create_command(&workspace).await,
        Commands::Join(args) => cli::session::join_command(&workspace, &args.code, &args.name).await,
        Commands::Rejoin => cli::session::rejoin_command(&workspace),
        Commands::Start => cli::session::start_command(&workspace).await,
        Commands::Info(args) => cli::session::info_command(&workspace, args.json).await,
        Commands::Watch => cli::watch::watch_command(&workspace).await,
        Commands::Leave => cli::session::leave_command(&workspace),
        Commands::Status(args) => cli::status::status_command(&workspace, args.json),
    }
}
