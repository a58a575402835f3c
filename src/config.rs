use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Book marketplace and reading platform server.
#[derive(Parser, Debug, Clone)]
#[command(name = "bookmarket")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "BOOKMARKET_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Initialize database and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new user.
    Add {
        /// Username.
        username: String,
        /// Email address.
        #[arg(short, long)]
        email: String,
        /// Password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
        /// User role (reader, creator or admin).
        #[arg(short, long, default_value = "reader")]
        role: String,
    },

    /// Delete a user.
    Del {
        /// Username to delete.
        username: String,
    },

    /// List all users.
    List,

    /// Change user password.
    Passwd {
        /// Username.
        username: String,
        /// New password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Payment gateway configuration.
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Upload limits.
    #[serde(default)]
    pub uploads: UploadConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// CORS allowed origins (empty = allow any).
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8000,
    )
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/bookmarket.db")
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for signing bearer tokens.
    #[serde(default = "default_secret")]
    pub secret: String,

    /// Token lifetime in minutes.
    #[serde(default = "default_token_minutes")]
    pub token_minutes: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            token_minutes: default_token_minutes(),
        }
    }
}

fn default_secret() -> String {
    // Placeholder for local development only. Override via config file
    // or the BOOKMARKET_SECRET environment variable.
    "change-me".to_string()
}

fn default_token_minutes() -> u64 {
    60 * 24
}

/// Payment gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Base URL of the voucher redemption gateway.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Recipient phone number registered with the gateway.
    #[serde(default)]
    pub phone: String,

    /// Gateway request timeout in seconds.
    #[serde(default = "default_gateway_timeout")]
    pub timeout_seconds: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            phone: String::new(),
            timeout_seconds: default_gateway_timeout(),
        }
    }
}

fn default_gateway_url() -> String {
    "https://gift.truemoney.com".to_string()
}

fn default_gateway_timeout() -> u64 {
    10
}

/// Upload size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum PDF size in megabytes.
    #[serde(default = "default_max_pdf_mb")]
    pub max_pdf_mb: u64,

    /// Maximum cover image size in megabytes.
    #[serde(default = "default_max_cover_mb")]
    pub max_cover_mb: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_pdf_mb: default_max_pdf_mb(),
            max_cover_mb: default_max_cover_mb(),
        }
    }
}

fn default_max_pdf_mb() -> u64 {
    50
}

fn default_max_cover_mb() -> u64 {
    5
}

impl UploadConfig {
    /// Maximum PDF size in bytes.
    pub fn max_pdf_bytes(&self) -> usize {
        (self.max_pdf_mb * 1024 * 1024) as usize
    }

    /// Maximum cover image size in bytes.
    pub fn max_cover_bytes(&self) -> usize {
        (self.max_cover_mb * 1024 * 1024) as usize
    }
}

impl Config {
    /// Load configuration from file and apply environment overrides.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env();
        Ok(config)
    }

    /// Default config with environment overrides applied.
    pub fn from_defaults() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Environment overrides for deployment secrets.
    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var("BOOKMARKET_SECRET") {
            self.auth.secret = secret;
        }
        if let Ok(db) = std::env::var("BOOKMARKET_DB") {
            self.database.path = PathBuf::from(db);
        }
        if let Ok(phone) = std::env::var("BOOKMARKET_PAYMENT_PHONE") {
            self.payment.phone = phone;
        }
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("bookmarket.toml"),
            PathBuf::from("/etc/bookmarket/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# bookmarket configuration

[server]
bind = "0.0.0.0:8000"
# cors_origins = ["http://localhost:5173"]

[database]
# path = "/var/lib/bookmarket/bookmarket.db"

[auth]
# HMAC secret for bearer tokens (or set BOOKMARKET_SECRET)
secret = "change-me"
# Token lifetime in minutes
token_minutes = 1440

[payment]
# Voucher redemption gateway
gateway_url = "https://gift.truemoney.com"
# Recipient phone number (or set BOOKMARKET_PAYMENT_PHONE)
phone = ""
timeout_seconds = 10

[uploads]
max_pdf_mb = 50
max_cover_mb = 5
"#
        .to_string()
    }
}

/// Fixed set of book categories.
pub const CATEGORIES: &[&str] = &[
    "knowledge",
    "fiction",
    "manga",
    "art",
    "science",
    "history",
    "business",
    "education",
    "technology",
    "health",
    "finance",
    "psychology",
    "other",
];

/// Check whether a category is part of the fixed set.
pub fn is_valid_category(category: &str) -> bool {
    CATEGORIES.contains(&category)
}
