//! bookmarket server entry point.

use bookmarket::{
    auth::AuthService,
    config::{Cli, Command, Config, UserCommand},
    db::Database,
    server,
};
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::from_defaults()
    };

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force).await,
        Some(Command::User { action }) => cmd_user(action, &config).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => cmd_serve(config, None).await,
    }
}

/// Initialize config and database.
async fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    let config = Config::from_defaults();
    let _db = Database::open(&config.database.path)?;
    println!("Initialized database: {}", config.database.path.display());

    println!("\nEdit config.toml to configure your server.");
    println!("Then create an admin: bookmarket user add <username> --email <email> --role admin");

    Ok(())
}

/// User management commands.
async fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;
    let auth = AuthService::new(db, &config.auth.secret, config.auth.token_minutes);

    match action {
        UserCommand::Add {
            username,
            email,
            password,
            role,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("Password: ")?,
            };

            let user = auth.create_user(&username, &email, &password, &role)?;
            println!(
                "Created user: {} (role: {}, id: {})",
                user.username, user.role, user.id
            );
        }

        UserCommand::Del { username } => {
            if auth.delete_user(&username)? {
                println!("Deleted user: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }

        UserCommand::List => {
            let users = auth.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!(
                    "{:<20} {:<10} {:<36} {:>8}  CREATED",
                    "USERNAME", "ROLE", "ID", "POINTS"
                );
                println!("{}", "-".repeat(96));
                for user in users {
                    let created = chrono::DateTime::from_timestamp(user.created_at, 0)
                        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    println!(
                        "{:<20} {:<10} {:<36} {:>8}  {}",
                        user.username, user.role, user.id, user.points, created
                    );
                }
            }
        }

        UserCommand::Passwd { username, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("New password: ")?,
            };

            if auth.change_password(&username, &password)? {
                println!("Password changed for: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }
    }

    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bookmarket=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.auth.secret == "change-me" {
        tracing::warn!(
            "Using the default token secret. Set [auth].secret or BOOKMARKET_SECRET in production."
        );
    }
    if config.payment.phone.is_empty() {
        tracing::warn!(
            "No payment phone configured; voucher redemption is disabled until [payment].phone is set."
        );
    }

    let db = Database::open(&config.database.path)?;

    tracing::info!(
        bind = %config.server.bind,
        database = %config.database.path.display(),
        "Starting bookmarket server"
    );

    let bind_addr = config.server.bind;
    let state = server::AppState::new(config, db)?;
    let app = server::create_router(state);

    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(address = %bind_addr, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Prompt for password input.
fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}
