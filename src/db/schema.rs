use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::Path;
use std::sync::Arc;

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| AppError::Internal(format!("Failed to enable foreign keys: {}", e)))?;

        conn.execute_batch(
            r#"
            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'reader',
                points INTEGER NOT NULL DEFAULT 0 CHECK (points >= 0),
                settings_json TEXT NOT NULL,
                full_name TEXT,
                bio TEXT,
                avatar_url TEXT,
                country TEXT,
                phone TEXT,
                created_at INTEGER NOT NULL
            );

            -- Social graph (follower -> creator username)
            CREATE TABLE IF NOT EXISTS follows (
                user_id TEXT NOT NULL,
                creator TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, creator),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Binary assets (PDF bodies, cover images)
            CREATE TABLE IF NOT EXISTS blobs (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                data BLOB NOT NULL,
                uploaded_at INTEGER NOT NULL
            );

            -- Book catalog
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT 'other',
                price INTEGER NOT NULL DEFAULT 0 CHECK (price >= 0),
                rating REAL NOT NULL DEFAULT 0,
                pdf_blob_id TEXT,
                cover_blob_id TEXT,
                uploader_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Purchase library (denormalized; survives book deletion)
            CREATE TABLE IF NOT EXISTS library (
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                price_paid INTEGER NOT NULL,
                purchased_at INTEGER NOT NULL,
                has_pdf INTEGER NOT NULL DEFAULT 0,
                has_cover INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, book_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Payment history (append-only)
            CREATE TABLE IF NOT EXISTS payments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                source TEXT NOT NULL,
                voucher_ref TEXT NOT NULL,
                amount REAL NOT NULL,
                points INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Reviews (one per user and book)
            CREATE TABLE IF NOT EXISTS reviews (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (book_id, user_id),
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Reading sessions
            CREATE TABLE IF NOT EXISTS reading (
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                current_page INTEGER,
                percentage REAL,
                status TEXT NOT NULL DEFAULT 'reading',
                started_at INTEGER NOT NULL,
                last_read_at INTEGER NOT NULL,
                finished_at INTEGER,
                read_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, book_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_books_category ON books(category);
            CREATE INDEX IF NOT EXISTS idx_books_author ON books(author);
            CREATE INDEX IF NOT EXISTS idx_library_book ON library(book_id);
            CREATE INDEX IF NOT EXISTS idx_payments_user ON payments(user_id);
            CREATE INDEX IF NOT EXISTS idx_reviews_book ON reviews(book_id);
            CREATE INDEX IF NOT EXISTS idx_reviews_user ON reviews(user_id);
            CREATE INDEX IF NOT EXISTS idx_follows_creator ON follows(creator);
            "#,
        )
        .map_err(|e| AppError::Internal(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========== USER OPERATIONS ==========

    /// Create a new user.
    pub fn create_user(&self, user: &User) -> Result<()> {
        let settings_json = serde_json::to_string(&user.settings)
            .map_err(|e| AppError::Internal(format!("Failed to serialize settings: {}", e)))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash, role, points, settings_json,
                                full_name, bio, avatar_url, country, phone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                user.id,
                user.username,
                user.email,
                user.password_hash,
                user.role,
                user.points,
                settings_json,
                user.full_name,
                user.bio,
                user.avatar_url,
                user.country,
                user.phone,
                user.created_at,
            ],
        )
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("users.username") {
                AppError::Conflict(format!("Username '{}' already registered", user.username))
            } else if msg.contains("users.email") {
                AppError::Conflict(format!("Email '{}' already registered", user.email))
            } else {
                AppError::Internal(format!("Failed to create user: {}", e))
            }
        })?;
        Ok(())
    }

    /// Get user by username.
    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{} WHERE username = ?1", SELECT_USER),
            params![username],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// Get user by ID.
    pub fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_USER),
            params![id],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// Get user by email.
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{} WHERE email = ?1", SELECT_USER),
            params![email],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("{} ORDER BY username", SELECT_USER))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let users = stmt
            .query_map([], Self::row_to_user)
            .map_err(|e| AppError::Internal(format!("Failed to list users: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect users: {}", e)))?;

        Ok(users)
    }

    /// Update user password.
    pub fn update_user_password(&self, username: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET password_hash = ?1 WHERE username = ?2",
                params![password_hash, username],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update password: {}", e)))?;
        Ok(rows > 0)
    }

    /// Replace a user's settings.
    pub fn update_settings(&self, user_id: &str, settings: &UserSettings) -> Result<()> {
        let settings_json = serde_json::to_string(settings)
            .map_err(|e| AppError::Internal(format!("Failed to serialize settings: {}", e)))?;

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET settings_json = ?1 WHERE id = ?2",
            params![settings_json, user_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to update settings: {}", e)))?;
        Ok(())
    }

    /// Update profile fields. Only the allowed free-text fields and email.
    #[allow(clippy::too_many_arguments)]
    pub fn update_profile(
        &self,
        user_id: &str,
        email: Option<&str>,
        full_name: Option<&str>,
        bio: Option<&str>,
        avatar_url: Option<&str>,
        country: Option<&str>,
        phone: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET
                email = COALESCE(?1, email),
                full_name = COALESCE(?2, full_name),
                bio = COALESCE(?3, bio),
                avatar_url = COALESCE(?4, avatar_url),
                country = COALESCE(?5, country),
                phone = COALESCE(?6, phone)
             WHERE id = ?7",
            params![email, full_name, bio, avatar_url, country, phone, user_id],
        )
        .map_err(|e| {
            if e.to_string().contains("users.email") {
                AppError::Conflict("Email already registered".to_string())
            } else {
                AppError::Internal(format!("Failed to update profile: {}", e))
            }
        })?;
        Ok(())
    }

    /// Change a user's username.
    ///
    /// Reviews, authored books, denormalized library rows and follow edges
    /// store the username, so the rename cascades in one transaction.
    pub fn update_username(&self, user_id: &str, new_username: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Internal(format!("Failed to start transaction: {}", e)))?;

        let old_username: String = tx
            .query_row(
                "SELECT username FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        tx.execute(
            "UPDATE users SET username = ?1 WHERE id = ?2",
            params![new_username, user_id],
        )
        .map_err(|e| {
            if e.to_string().contains("users.username") {
                AppError::Conflict(format!("Username '{}' already registered", new_username))
            } else {
                AppError::Internal(format!("Failed to update username: {}", e))
            }
        })?;

        for (sql, what) in [
            ("UPDATE reviews SET user_id = ?1 WHERE user_id = ?2", "reviews"),
            ("UPDATE books SET author = ?1 WHERE author = ?2", "books"),
            ("UPDATE library SET author = ?1 WHERE author = ?2", "library"),
            ("UPDATE follows SET creator = ?1 WHERE creator = ?2", "follows"),
        ] {
            tx.execute(sql, params![new_username, old_username])
                .map_err(|e| AppError::Internal(format!("Failed to rename in {}: {}", what, e)))?;
        }

        tx.commit()
            .map_err(|e| AppError::Internal(format!("Failed to commit rename: {}", e)))?;
        Ok(())
    }

    /// Delete user.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM users WHERE username = ?1", params![username])
            .map_err(|e| AppError::Internal(format!("Failed to delete user: {}", e)))?;
        Ok(rows > 0)
    }

    /// Helper to convert a row to User.
    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        let settings_json: String = row.get(6)?;
        let settings = serde_json::from_str(&settings_json).unwrap_or_default();

        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            password_hash: row.get(3)?,
            role: row.get(4)?,
            points: row.get(5)?,
            settings,
            full_name: row.get(7)?,
            bio: row.get(8)?,
            avatar_url: row.get(9)?,
            country: row.get(10)?,
            phone: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    // ========== LEDGER OPERATIONS ==========

    /// Credit points from a successful voucher redemption.
    ///
    /// The balance increment and the payment record are one transaction: the
    /// record exists if and only if the points were applied.
    pub fn credit_points(
        &self,
        user_id: &str,
        source: &str,
        voucher_ref: &str,
        amount: f64,
        points: i64,
    ) -> Result<PaymentRecord> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Internal(format!("Failed to start transaction: {}", e)))?;

        let now = now_timestamp();

        let rows = tx
            .execute(
                "UPDATE users SET points = points + ?1 WHERE id = ?2",
                params![points, user_id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to credit points: {}", e)))?;
        if rows == 0 {
            return Err(AppError::NotFound("User not found".to_string()));
        }

        tx.execute(
            "INSERT INTO payments (user_id, source, voucher_ref, amount, points, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'success', ?6)",
            params![user_id, source, voucher_ref, amount, points, now],
        )
        .map_err(|e| AppError::Internal(format!("Failed to record payment: {}", e)))?;

        let id = tx.last_insert_rowid();

        tx.commit()
            .map_err(|e| AppError::Internal(format!("Failed to commit payment: {}", e)))?;

        Ok(PaymentRecord {
            id,
            user_id: user_id.to_string(),
            source: source.to_string(),
            voucher_ref: voucher_ref.to_string(),
            amount,
            points,
            status: "success".to_string(),
            created_at: now,
        })
    }

    /// Purchase a book with points.
    ///
    /// Ownership check, balance check, library append and points decrement
    /// run inside one transaction, so concurrent purchases of the same book
    /// by the same user cannot both commit.
    pub fn purchase_book(&self, user_id: &str, book_id: &str) -> Result<LibraryEntry> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Internal(format!("Failed to start transaction: {}", e)))?;

        let book = tx
            .query_row(
                "SELECT title, author, price, pdf_blob_id, cover_blob_id
                 FROM books WHERE id = ?1",
                params![book_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| AppError::Internal(format!("Failed to get book: {}", e)))?
            .ok_or_else(|| AppError::NotFound("Book not found".to_string()))?;

        let (title, author, price, pdf_blob_id, cover_blob_id) = book;

        let owned: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM library WHERE user_id = ?1 AND book_id = ?2",
                params![user_id, book_id],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Internal(format!("Failed to check ownership: {}", e)))?;
        if owned > 0 {
            return Err(AppError::Conflict(
                "You already own this book".to_string(),
            ));
        }

        if price > 0 {
            let available: i64 = tx
                .query_row(
                    "SELECT points FROM users WHERE id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| AppError::Internal(format!("Failed to get balance: {}", e)))?
                .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

            if available < price {
                return Err(AppError::InsufficientPoints {
                    required: price,
                    available,
                });
            }

            // Conditional decrement; the WHERE clause is the storage-level guard.
            let rows = tx
                .execute(
                    "UPDATE users SET points = points - ?1 WHERE id = ?2 AND points >= ?1",
                    params![price, user_id],
                )
                .map_err(|e| AppError::Internal(format!("Failed to deduct points: {}", e)))?;
            if rows == 0 {
                return Err(AppError::InsufficientPoints {
                    required: price,
                    available,
                });
            }
        }

        let entry = LibraryEntry {
            user_id: user_id.to_string(),
            book_id: book_id.to_string(),
            title,
            author,
            price_paid: price,
            purchased_at: now_timestamp(),
            has_pdf: pdf_blob_id.is_some(),
            has_cover: cover_blob_id.is_some(),
        };

        tx.execute(
            "INSERT INTO library (user_id, book_id, title, author, price_paid, purchased_at, has_pdf, has_cover)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.user_id,
                entry.book_id,
                entry.title,
                entry.author,
                entry.price_paid,
                entry.purchased_at,
                entry.has_pdf,
                entry.has_cover,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to add library entry: {}", e)))?;

        tx.commit()
            .map_err(|e| AppError::Internal(format!("Failed to commit purchase: {}", e)))?;

        Ok(entry)
    }

    /// Check whether a user owns a book.
    pub fn has_book(&self, user_id: &str, book_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM library WHERE user_id = ?1 AND book_id = ?2",
                params![user_id, book_id],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Internal(format!("Failed to check ownership: {}", e)))?;
        Ok(count > 0)
    }

    /// Get a user's library, newest purchase first.
    pub fn get_library(&self, user_id: &str, skip: u32, limit: u32) -> Result<Vec<LibraryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT user_id, book_id, title, author, price_paid, purchased_at, has_pdf, has_cover
                 FROM library WHERE user_id = ?1
                 ORDER BY purchased_at DESC, book_id
                 LIMIT ?2 OFFSET ?3",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let entries = stmt
            .query_map(params![user_id, limit, skip], |row| {
                Ok(LibraryEntry {
                    user_id: row.get(0)?,
                    book_id: row.get(1)?,
                    title: row.get(2)?,
                    author: row.get(3)?,
                    price_paid: row.get(4)?,
                    purchased_at: row.get(5)?,
                    has_pdf: row.get(6)?,
                    has_cover: row.get(7)?,
                })
            })
            .map_err(|e| AppError::Internal(format!("Failed to get library: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect library: {}", e)))?;

        Ok(entries)
    }

    /// Remove a book from a user's library. No refund.
    pub fn remove_library_entry(&self, user_id: &str, book_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM library WHERE user_id = ?1 AND book_id = ?2",
                params![user_id, book_id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to remove library entry: {}", e)))?;
        Ok(rows > 0)
    }

    /// Get a user's payment history, newest first.
    pub fn payment_history(
        &self,
        user_id: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<PaymentRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, source, voucher_ref, amount, points, status, created_at
                 FROM payments WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let records = stmt
            .query_map(params![user_id, limit, skip], |row| {
                Ok(PaymentRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    source: row.get(2)?,
                    voucher_ref: row.get(3)?,
                    amount: row.get(4)?,
                    points: row.get(5)?,
                    status: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .map_err(|e| AppError::Internal(format!("Failed to get payments: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect payments: {}", e)))?;

        Ok(records)
    }

    // ========== BOOK OPERATIONS ==========

    /// Create a book.
    pub fn create_book(&self, book: &Book) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO books (id, title, author, description, category, price, rating,
                                pdf_blob_id, cover_blob_id, uploader_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                book.id,
                book.title,
                book.author,
                book.description,
                book.category,
                book.price,
                book.rating,
                book.pdf_blob_id,
                book.cover_blob_id,
                book.uploader_id,
                book.created_at,
                book.updated_at,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to create book: {}", e)))?;
        Ok(())
    }

    /// Get book by ID.
    pub fn get_book(&self, id: &str) -> Result<Option<Book>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_BOOK),
            params![id],
            Self::row_to_book,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get book: {}", e)))
    }

    /// List books with pagination, filtering, search and sorting.
    ///
    /// The sort key is resolved against an allow-list; unrecognized keys fall
    /// back to created_at. Category must be validated by the caller.
    pub fn list_books(&self, query: &BookQuery) -> Result<Vec<Book>> {
        let sort_key = match query.sort_by.as_str() {
            "rating" => "rating",
            "title" => "title",
            "author" => "author",
            "price" => "price",
            _ => "created_at",
        };
        let direction = if query.descending { "DESC" } else { "ASC" };

        let mut sql = format!("{} WHERE 1=1", SELECT_BOOK);
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref category) = query.category {
            sql.push_str(&format!(" AND category = ?{}", args.len() + 1));
            args.push(Box::new(category.clone()));
        }

        if let Some(ref search) = query.search {
            let pattern = format!("%{}%", search.to_lowercase());
            let idx = args.len() + 1;
            sql.push_str(&format!(
                " AND (LOWER(title) LIKE ?{i} OR LOWER(author) LIKE ?{i} OR LOWER(description) LIKE ?{i})",
                i = idx
            ));
            args.push(Box::new(pattern));
        }

        sql.push_str(&format!(
            " ORDER BY {} {} LIMIT ?{} OFFSET ?{}",
            sort_key,
            direction,
            args.len() + 1,
            args.len() + 2
        ));
        args.push(Box::new(query.limit));
        args.push(Box::new(query.skip));

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                Self::row_to_book,
            )
            .map_err(|e| AppError::Internal(format!("Failed to list books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// Delete a book and its blobs. Library entries survive (denormalized);
    /// reviews and reading sessions cascade.
    pub fn delete_book(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Internal(format!("Failed to start transaction: {}", e)))?;

        let blob_ids = tx
            .query_row(
                "SELECT pdf_blob_id, cover_blob_id FROM books WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| AppError::Internal(format!("Failed to get book: {}", e)))?;

        let Some((pdf_blob_id, cover_blob_id)) = blob_ids else {
            return Ok(false);
        };

        for blob_id in [pdf_blob_id, cover_blob_id].into_iter().flatten() {
            tx.execute("DELETE FROM blobs WHERE id = ?1", params![blob_id])
                .map_err(|e| AppError::Internal(format!("Failed to delete blob: {}", e)))?;
        }

        tx.execute("DELETE FROM books WHERE id = ?1", params![id])
            .map_err(|e| AppError::Internal(format!("Failed to delete book: {}", e)))?;

        tx.commit()
            .map_err(|e| AppError::Internal(format!("Failed to commit delete: {}", e)))?;

        Ok(true)
    }

    /// Book count per category (categories with no books are absent).
    pub fn count_by_category(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT category, COUNT(*) FROM books GROUP BY category ORDER BY COUNT(*) DESC")
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| AppError::Internal(format!("Failed to count categories: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect counts: {}", e)))?;

        Ok(counts)
    }

    /// Blob count and total size in bytes.
    pub fn storage_stats(&self) -> Result<(i64, i64)> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM blobs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| AppError::Internal(format!("Failed to get storage stats: {}", e)))
    }

    /// Helper to convert a row to Book.
    fn row_to_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
        Ok(Book {
            id: row.get(0)?,
            title: row.get(1)?,
            author: row.get(2)?,
            description: row.get(3)?,
            category: row.get(4)?,
            price: row.get(5)?,
            rating: row.get(6)?,
            pdf_blob_id: row.get(7)?,
            cover_blob_id: row.get(8)?,
            uploader_id: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    // ========== BLOB OPERATIONS ==========

    /// Store a blob.
    pub fn put_blob(&self, blob: &StoredBlob) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO blobs (id, filename, content_type, size, data, uploaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                blob.id,
                blob.filename,
                blob.content_type,
                blob.size,
                blob.data,
                blob.uploaded_at,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to store blob: {}", e)))?;
        Ok(())
    }

    /// Get a blob by ID.
    pub fn get_blob(&self, id: &str) -> Result<Option<StoredBlob>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, filename, content_type, size, data, uploaded_at
             FROM blobs WHERE id = ?1",
            params![id],
            |row| {
                Ok(StoredBlob {
                    id: row.get(0)?,
                    filename: row.get(1)?,
                    content_type: row.get(2)?,
                    size: row.get(3)?,
                    data: row.get(4)?,
                    uploaded_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get blob: {}", e)))
    }

    /// Delete a blob.
    pub fn delete_blob(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM blobs WHERE id = ?1", params![id])
            .map_err(|e| AppError::Internal(format!("Failed to delete blob: {}", e)))?;
        Ok(rows > 0)
    }

    // ========== REVIEW OPERATIONS ==========

    /// Add a review and recompute the book's rating in one transaction.
    pub fn add_review(&self, review: &Review) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Internal(format!("Failed to start transaction: {}", e)))?;

        tx.execute(
            "INSERT INTO reviews (id, book_id, user_id, rating, body, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                review.id,
                review.book_id,
                review.user_id,
                review.rating,
                review.body,
                review.created_at,
                review.updated_at,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::Conflict(
                    "You have already reviewed this book. Use PATCH to update your review."
                        .to_string(),
                )
            } else {
                AppError::Internal(format!("Failed to create review: {}", e))
            }
        })?;

        Self::recompute_rating(&tx, &review.book_id)?;

        tx.commit()
            .map_err(|e| AppError::Internal(format!("Failed to commit review: {}", e)))?;
        Ok(())
    }

    /// Update a review (author only) and recompute the book's rating.
    pub fn update_review(
        &self,
        book_id: &str,
        review_id: &str,
        username: &str,
        rating: Option<i64>,
        body: Option<&str>,
    ) -> Result<Review> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Internal(format!("Failed to start transaction: {}", e)))?;

        let mut review = Self::get_review_tx(&tx, book_id, review_id)?
            .ok_or_else(|| AppError::NotFound("Review not found".to_string()))?;

        if review.user_id != username {
            return Err(AppError::Forbidden(
                "You can only update your own reviews".to_string(),
            ));
        }

        if let Some(rating) = rating {
            review.rating = rating;
        }
        if let Some(body) = body {
            review.body = body.to_string();
        }
        review.updated_at = now_timestamp();

        tx.execute(
            "UPDATE reviews SET rating = ?1, body = ?2, updated_at = ?3 WHERE id = ?4",
            params![review.rating, review.body, review.updated_at, review_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to update review: {}", e)))?;

        Self::recompute_rating(&tx, book_id)?;

        tx.commit()
            .map_err(|e| AppError::Internal(format!("Failed to commit review: {}", e)))?;
        Ok(review)
    }

    /// Delete a review (author only) and recompute the book's rating.
    pub fn delete_review(&self, book_id: &str, review_id: &str, username: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Internal(format!("Failed to start transaction: {}", e)))?;

        let review = Self::get_review_tx(&tx, book_id, review_id)?
            .ok_or_else(|| AppError::NotFound("Review not found".to_string()))?;

        if review.user_id != username {
            return Err(AppError::Forbidden(
                "You can only delete your own reviews".to_string(),
            ));
        }

        tx.execute("DELETE FROM reviews WHERE id = ?1", params![review_id])
            .map_err(|e| AppError::Internal(format!("Failed to delete review: {}", e)))?;

        Self::recompute_rating(&tx, book_id)?;

        tx.commit()
            .map_err(|e| AppError::Internal(format!("Failed to commit delete: {}", e)))?;
        Ok(())
    }

    /// Reviews for a book, newest first.
    pub fn list_reviews(&self, book_id: &str, skip: u32, limit: u32) -> Result<Vec<Review>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, book_id, user_id, rating, body, created_at, updated_at
                 FROM reviews WHERE book_id = ?1
                 ORDER BY created_at DESC, id
                 LIMIT ?2 OFFSET ?3",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let reviews = stmt
            .query_map(params![book_id, limit, skip], Self::row_to_review)
            .map_err(|e| AppError::Internal(format!("Failed to get reviews: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect reviews: {}", e)))?;

        Ok(reviews)
    }

    /// Review count and mean rating (0.0 when there are none).
    pub fn review_aggregate(&self, book_id: &str) -> Result<(i64, f64)> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*), COALESCE(ROUND(AVG(rating), 1), 0)
             FROM reviews WHERE book_id = ?1",
            params![book_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| AppError::Internal(format!("Failed to aggregate reviews: {}", e)))
    }

    /// All reviews written by a user, with book title and author, newest first.
    pub fn user_reviews(
        &self,
        username: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<(Review, String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT r.id, r.book_id, r.user_id, r.rating, r.body, r.created_at, r.updated_at,
                        b.title, b.author
                 FROM reviews r JOIN books b ON r.book_id = b.id
                 WHERE r.user_id = ?1
                 ORDER BY r.created_at DESC, r.id
                 LIMIT ?2 OFFSET ?3",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let reviews = stmt
            .query_map(params![username, limit, skip], |row| {
                Ok((
                    Review {
                        id: row.get(0)?,
                        book_id: row.get(1)?,
                        user_id: row.get(2)?,
                        rating: row.get(3)?,
                        body: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    },
                    row.get(7)?,
                    row.get(8)?,
                ))
            })
            .map_err(|e| AppError::Internal(format!("Failed to get user reviews: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect reviews: {}", e)))?;

        Ok(reviews)
    }

    /// Recompute a book's derived rating from its current review set.
    fn recompute_rating(tx: &Transaction<'_>, book_id: &str) -> Result<()> {
        tx.execute(
            "UPDATE books SET
                rating = COALESCE((SELECT ROUND(AVG(rating), 1) FROM reviews WHERE book_id = ?1), 0),
                updated_at = ?2
             WHERE id = ?1",
            params![book_id, now_timestamp()],
        )
        .map_err(|e| AppError::Internal(format!("Failed to recompute rating: {}", e)))?;
        Ok(())
    }

    fn get_review_tx(
        tx: &Transaction<'_>,
        book_id: &str,
        review_id: &str,
    ) -> Result<Option<Review>> {
        tx.query_row(
            "SELECT id, book_id, user_id, rating, body, created_at, updated_at
             FROM reviews WHERE id = ?1 AND book_id = ?2",
            params![review_id, book_id],
            Self::row_to_review,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get review: {}", e)))
    }

    fn row_to_review(row: &rusqlite::Row<'_>) -> rusqlite::Result<Review> {
        Ok(Review {
            id: row.get(0)?,
            book_id: row.get(1)?,
            user_id: row.get(2)?,
            rating: row.get(3)?,
            body: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    // ========== READING OPERATIONS ==========

    /// Save or update a reading session.
    ///
    /// started_at is preserved on conflict; finished_at is set the first time
    /// the status becomes "completed".
    pub fn save_progress(
        &self,
        user_id: &str,
        book_id: &str,
        current_page: Option<i64>,
        percentage: Option<f64>,
        status: &str,
    ) -> Result<()> {
        let now = now_timestamp();
        let finished_at = if status == "completed" { Some(now) } else { None };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reading
             (user_id, book_id, current_page, percentage, status, started_at, last_read_at, finished_at, read_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, 0)
             ON CONFLICT (user_id, book_id) DO UPDATE SET
                current_page = excluded.current_page,
                percentage = excluded.percentage,
                status = excluded.status,
                started_at = reading.started_at,
                last_read_at = excluded.last_read_at,
                finished_at = COALESCE(reading.finished_at, excluded.finished_at)",
            params![user_id, book_id, current_page, percentage, status, now, finished_at],
        )
        .map_err(|e| AppError::Internal(format!("Failed to save progress: {}", e)))?;
        Ok(())
    }

    /// Record that a book was opened for reading.
    pub fn bump_read(&self, user_id: &str, book_id: &str) -> Result<()> {
        let now = now_timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reading
             (user_id, book_id, current_page, percentage, status, started_at, last_read_at, finished_at, read_count)
             VALUES (?1, ?2, NULL, NULL, 'reading', ?3, ?3, NULL, 1)
             ON CONFLICT (user_id, book_id) DO UPDATE SET
                last_read_at = excluded.last_read_at,
                read_count = reading.read_count + 1",
            params![user_id, book_id, now],
        )
        .map_err(|e| AppError::Internal(format!("Failed to record read: {}", e)))?;
        Ok(())
    }

    /// Get the reading session for one book.
    pub fn get_progress(&self, user_id: &str, book_id: &str) -> Result<Option<ReadingSession>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, book_id, current_page, percentage, status,
                    started_at, last_read_at, finished_at, read_count
             FROM reading WHERE user_id = ?1 AND book_id = ?2",
            params![user_id, book_id],
            Self::row_to_session,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get progress: {}", e)))
    }

    /// Sessions with the given status, joined with book title/author.
    pub fn sessions_by_status(
        &self,
        user_id: &str,
        status: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<(ReadingSession, String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT r.user_id, r.book_id, r.current_page, r.percentage, r.status,
                        r.started_at, r.last_read_at, r.finished_at, r.read_count,
                        b.title, b.author
                 FROM reading r JOIN books b ON r.book_id = b.id
                 WHERE r.user_id = ?1 AND r.status = ?2
                 ORDER BY r.last_read_at DESC
                 LIMIT ?3 OFFSET ?4",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let sessions = stmt
            .query_map(params![user_id, status, limit, skip], |row| {
                Ok((
                    ReadingSession {
                        user_id: row.get(0)?,
                        book_id: row.get(1)?,
                        current_page: row.get(2)?,
                        percentage: row.get(3)?,
                        status: row.get(4)?,
                        started_at: row.get(5)?,
                        last_read_at: row.get(6)?,
                        finished_at: row.get(7)?,
                        read_count: row.get(8)?,
                    },
                    row.get(9)?,
                    row.get(10)?,
                ))
            })
            .map_err(|e| AppError::Internal(format!("Failed to get sessions: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect sessions: {}", e)))?;

        Ok(sessions)
    }

    /// Reading totals by status.
    pub fn reading_stats(&self, user_id: &str) -> Result<ReadingStats> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT
                COALESCE(SUM(status = 'reading'), 0),
                COALESCE(SUM(status = 'paused'), 0),
                COALESCE(SUM(status = 'completed'), 0)
             FROM reading WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(ReadingStats {
                    reading: row.get(0)?,
                    paused: row.get(1)?,
                    completed: row.get(2)?,
                })
            },
        )
        .map_err(|e| AppError::Internal(format!("Failed to get reading stats: {}", e)))
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReadingSession> {
        Ok(ReadingSession {
            user_id: row.get(0)?,
            book_id: row.get(1)?,
            current_page: row.get(2)?,
            percentage: row.get(3)?,
            status: row.get(4)?,
            started_at: row.get(5)?,
            last_read_at: row.get(6)?,
            finished_at: row.get(7)?,
            read_count: row.get(8)?,
        })
    }

    // ========== USER STATS ==========

    /// Per-account statistics for the profile page.
    pub fn user_stats(&self, user_id: &str, username: &str) -> Result<UserStats> {
        let conn = self.conn.lock();

        let (owned_books, points_spent): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(price_paid), 0) FROM library WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| AppError::Internal(format!("Failed to get library stats: {}", e)))?;

        let reviews_written: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM reviews WHERE user_id = ?1",
                params![username],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Internal(format!("Failed to count reviews: {}", e)))?;

        let books_completed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM reading WHERE user_id = ?1 AND status = 'completed'",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Internal(format!("Failed to count completed: {}", e)))?;

        Ok(UserStats {
            owned_books,
            points_spent,
            reviews_written,
            books_completed,
        })
    }

    // ========== CREATOR OPERATIONS ==========

    /// Follow a creator. Returns false when already following.
    pub fn follow(&self, user_id: &str, creator: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "INSERT OR IGNORE INTO follows (user_id, creator, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, creator, now_timestamp()],
            )
            .map_err(|e| AppError::Internal(format!("Failed to follow: {}", e)))?;
        Ok(rows > 0)
    }

    /// Unfollow a creator. Returns false when not following.
    pub fn unfollow(&self, user_id: &str, creator: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM follows WHERE user_id = ?1 AND creator = ?2",
                params![user_id, creator],
            )
            .map_err(|e| AppError::Internal(format!("Failed to unfollow: {}", e)))?;
        Ok(rows > 0)
    }

    /// Whether a user follows a creator.
    pub fn is_following(&self, user_id: &str, creator: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM follows WHERE user_id = ?1 AND creator = ?2",
                params![user_id, creator],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Internal(format!("Failed to check following: {}", e)))?;
        Ok(count > 0)
    }

    /// Number of users following a creator.
    pub fn follower_count(&self, creator: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM follows WHERE creator = ?1",
            params![creator],
            |row| row.get(0),
        )
        .map_err(|e| AppError::Internal(format!("Failed to count followers: {}", e)))
    }

    /// Number of creators a user follows.
    pub fn following_count(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM follows WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .map_err(|e| AppError::Internal(format!("Failed to count following: {}", e)))
    }

    /// Aggregated dashboard numbers for a creator (matched by book author).
    pub fn creator_stats(&self, username: &str) -> Result<CreatorStats> {
        let conn = self.conn.lock();

        let total_followers: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM follows WHERE creator = ?1",
                params![username],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Internal(format!("Failed to count followers: {}", e)))?;

        let total_books: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM books WHERE author = ?1",
                params![username],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Internal(format!("Failed to count books: {}", e)))?;

        let (total_sales, total_revenue, total_readers): (i64, i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(price_paid), 0), COUNT(DISTINCT user_id)
                 FROM library WHERE author = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| AppError::Internal(format!("Failed to get sales: {}", e)))?;

        Ok(CreatorStats {
            total_followers,
            total_readers,
            total_sales,
            total_revenue,
            total_books,
        })
    }

    /// Sales counts grouped by calendar month ("YYYY-MM") since a timestamp.
    pub fn sales_by_month(&self, username: &str, since: i64) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT strftime('%Y-%m', purchased_at, 'unixepoch') AS ym, COUNT(*)
                 FROM library
                 WHERE author = ?1 AND purchased_at >= ?2
                 GROUP BY ym ORDER BY ym",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let sales = stmt
            .query_map(params![username, since], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(|e| AppError::Internal(format!("Failed to get sales history: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect sales: {}", e)))?;

        Ok(sales)
    }

    /// A creator's books with per-book reader counts, newest first.
    pub fn creator_books(
        &self,
        username: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<(Book, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{}, (SELECT COUNT(*) FROM library l WHERE l.book_id = books.id)
                 FROM books WHERE author = ?1
                 ORDER BY created_at DESC
                 LIMIT ?2 OFFSET ?3",
                SELECT_BOOK_COLS
            ))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map(params![username, limit, skip], |row| {
                Ok((Self::row_to_book(row)?, row.get(12)?))
            })
            .map_err(|e| AppError::Internal(format!("Failed to get creator books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// Total revenue earned by a creator (for the public profile).
    pub fn creator_revenue(&self, username: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(SUM(price_paid), 0) FROM library WHERE author = ?1",
            params![username],
            |row| row.get(0),
        )
        .map_err(|e| AppError::Internal(format!("Failed to get revenue: {}", e)))
    }
}

/// Shared user column list.
const SELECT_USER: &str = "SELECT id, username, email, password_hash, role, points, settings_json,
        full_name, bio, avatar_url, country, phone, created_at FROM users";

/// Shared book column list (without FROM, for queries that add columns).
const SELECT_BOOK_COLS: &str = "SELECT id, title, author, description, category, price, rating,
        pdf_blob_id, cover_blob_id, uploader_id, created_at, updated_at";

/// Shared book select.
const SELECT_BOOK: &str = "SELECT id, title, author, description, category, price, rating,
        pdf_blob_id, cover_blob_id, uploader_id, created_at, updated_at FROM books";
