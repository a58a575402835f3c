mod schema;

pub use schema::Database;

use crate::error::{AppError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// User account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: String,
    /// Username for login (unique).
    pub username: String,
    /// Email address (unique).
    pub email: String,
    /// Argon2 password hash.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// User role: "reader", "creator" or "admin".
    pub role: String,
    /// Points balance (never negative).
    pub points: i64,
    /// Reader settings.
    pub settings: UserSettings,
    /// Display name.
    pub full_name: Option<String>,
    /// Free-text bio.
    pub bio: Option<String>,
    /// Avatar image URL.
    pub avatar_url: Option<String>,
    /// Country.
    pub country: Option<String>,
    /// Contact phone.
    pub phone: Option<String>,
    /// Account creation timestamp.
    pub created_at: i64,
}

/// Per-user reader settings with a fixed key set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserSettings {
    /// Scroll (true) vs paged (false) reading mode.
    pub reading_mode_scroll: bool,
    /// Theme: "light", "dark" or "sepia".
    pub dark_mode_option: String,
    /// Whether notifications are enabled.
    pub notifications: bool,
    /// Whether reading position is auto-saved.
    pub auto_save: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            reading_mode_scroll: true,
            dark_mode_option: "dark".to_string(),
            notifications: true,
            auto_save: true,
        }
    }
}

/// The settings keys accepted by the per-key endpoints.
pub const SETTINGS_KEYS: &[&str] = &[
    "readingModeScroll",
    "darkModeOption",
    "notifications",
    "autoSave",
];

impl UserSettings {
    /// Set a single key from a JSON value, validating key and value type.
    pub fn set_key(&mut self, key: &str, value: &serde_json::Value) -> Result<()> {
        match key {
            "readingModeScroll" => self.reading_mode_scroll = expect_bool(key, value)?,
            "darkModeOption" => {
                let v = value
                    .as_str()
                    .ok_or_else(|| AppError::Validation(format!("'{}' must be a string", key)))?;
                if !["light", "dark", "sepia"].contains(&v) {
                    return Err(AppError::Validation(format!(
                        "'{}' must be one of: light, dark, sepia",
                        key
                    )));
                }
                self.dark_mode_option = v.to_string();
            }
            "notifications" => self.notifications = expect_bool(key, value)?,
            "autoSave" => self.auto_save = expect_bool(key, value)?,
            _ => {
                return Err(AppError::Validation(format!(
                    "Unknown settings key '{}'. Valid keys: {}",
                    key,
                    SETTINGS_KEYS.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Reset a single key to its default value.
    pub fn reset_key(&mut self, key: &str) -> Result<()> {
        let defaults = UserSettings::default();
        match key {
            "readingModeScroll" => self.reading_mode_scroll = defaults.reading_mode_scroll,
            "darkModeOption" => self.dark_mode_option = defaults.dark_mode_option,
            "notifications" => self.notifications = defaults.notifications,
            "autoSave" => self.auto_save = defaults.auto_save,
            _ => {
                return Err(AppError::Validation(format!(
                    "Unknown settings key '{}'",
                    key
                )));
            }
        }
        Ok(())
    }
}

fn expect_bool(key: &str, value: &serde_json::Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| AppError::Validation(format!("'{}' must be a boolean", key)))
}

/// Book in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Unique book ID.
    pub id: String,
    /// Book title.
    pub title: String,
    /// Author (the uploader's username).
    pub author: String,
    /// Book description.
    pub description: String,
    /// Category from the fixed list.
    pub category: String,
    /// Price in points (0 = free).
    pub price: i64,
    /// Mean review rating, one decimal place (0 when unreviewed).
    pub rating: f64,
    /// PDF blob ID, if a PDF was uploaded.
    pub pdf_blob_id: Option<String>,
    /// Cover image blob ID, if a cover was uploaded.
    pub cover_blob_id: Option<String>,
    /// Uploading user's ID.
    pub uploader_id: String,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Binary asset stored in the blob table.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    /// Unique blob ID.
    pub id: String,
    /// Original filename.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Size in bytes.
    pub size: i64,
    /// Raw content.
    pub data: Vec<u8>,
    /// Upload timestamp.
    pub uploaded_at: i64,
}

/// Purchase record in a user's library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryEntry {
    /// Owning user's ID.
    pub user_id: String,
    /// Purchased book ID.
    pub book_id: String,
    /// Book title at purchase time.
    pub title: String,
    /// Book author at purchase time.
    pub author: String,
    /// Points actually paid (0 for free books).
    pub price_paid: i64,
    /// Purchase timestamp.
    pub purchased_at: i64,
    /// Whether the book had a PDF at purchase time.
    pub has_pdf: bool,
    /// Whether the book had a cover at purchase time.
    pub has_cover: bool,
}

/// Payment record produced by a successful voucher redemption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Record ID (auto-increment).
    pub id: i64,
    /// User credited.
    pub user_id: String,
    /// Payment source, e.g. "truemoney".
    pub source: String,
    /// External voucher identifier.
    pub voucher_ref: String,
    /// Monetary amount redeemed (baht).
    pub amount: f64,
    /// Points credited.
    pub points: i64,
    /// Outcome status.
    pub status: String,
    /// Timestamp.
    pub created_at: i64,
}

/// Book review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    /// Unique review ID.
    pub id: String,
    /// Reviewed book ID.
    pub book_id: String,
    /// Reviewer's username.
    pub user_id: String,
    /// Rating 1-5.
    pub rating: i64,
    /// Review text.
    pub body: String,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Reading session for one user and book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingSession {
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Current page number.
    pub current_page: Option<i64>,
    /// Reading percentage (0.0 - 100.0).
    pub percentage: Option<f64>,
    /// Status: "reading", "paused" or "completed".
    pub status: String,
    /// Started reading timestamp.
    pub started_at: i64,
    /// Last read timestamp.
    pub last_read_at: i64,
    /// Completion timestamp.
    pub finished_at: Option<i64>,
    /// Number of times the book was opened.
    pub read_count: i64,
}

/// Valid reading session statuses.
pub const READING_STATUSES: &[&str] = &["reading", "paused", "completed"];

/// Catalog listing query.
#[derive(Debug, Clone, Default)]
pub struct BookQuery {
    /// Number of books to skip.
    pub skip: u32,
    /// Maximum number of books to return.
    pub limit: u32,
    /// Optional category filter (pre-validated).
    pub category: Option<String>,
    /// Optional case-insensitive substring search.
    pub search: Option<String>,
    /// Sort key (resolved against the allow-list).
    pub sort_by: String,
    /// Descending order when true.
    pub descending: bool,
}

/// Aggregated creator dashboard numbers.
#[derive(Debug, Clone, Serialize)]
pub struct CreatorStats {
    /// Users following this creator.
    pub total_followers: i64,
    /// Unique users owning at least one of the creator's books.
    pub total_readers: i64,
    /// Library entries across the creator's books.
    pub total_sales: i64,
    /// Sum of points paid for the creator's books.
    pub total_revenue: i64,
    /// Number of books by this creator.
    pub total_books: i64,
}

/// One month of sales.
#[derive(Debug, Clone, Serialize)]
pub struct MonthlySales {
    /// Month label, e.g. "Jan".
    pub month: String,
    /// Sales count.
    pub value: i64,
}

/// Per-user account statistics.
#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    /// Books in the library.
    pub owned_books: i64,
    /// Total points spent on purchases.
    pub points_spent: i64,
    /// Reviews written.
    pub reviews_written: i64,
    /// Books marked completed.
    pub books_completed: i64,
}

/// Reading activity totals by status.
#[derive(Debug, Clone, Serialize)]
pub struct ReadingStats {
    /// Sessions in "reading" state.
    pub reading: i64,
    /// Sessions in "paused" state.
    pub paused: i64,
    /// Sessions in "completed" state.
    pub completed: i64,
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}
