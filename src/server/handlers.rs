//! HTTP request handlers.

use crate::auth::{Role, validate_username};
use crate::config::{CATEGORIES, is_valid_category};
use crate::db::{
    self, Book, BookQuery, LibraryEntry, MonthlySales, PaymentRecord, READING_STATUSES, Review,
    StoredBlob, UserSettings,
};
use crate::error::{AppError, Result};
use crate::payment;
use crate::server::AppState;
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, Response},
};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Build a binary response, returning 500 on error (which shouldn't happen).
fn blob_response(blob: StoredBlob, disposition: Option<String>) -> Response<Body> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, blob.content_type)
        .header(header::CONTENT_LENGTH, blob.size);

    if let Some(disposition) = disposition {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition);
    }

    builder.body(Body::from(blob.data)).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("Internal error"))
            .unwrap_or_default()
    })
}

// ============================================================================
// HELPERS
// ============================================================================

/// Extract bearer token from Authorization header.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Get authenticated user from token.
async fn get_authenticated_user(state: &AppState, headers: &HeaderMap) -> Result<db::User> {
    let token = extract_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;

    state.auth.authenticate(&token)
}

/// Authenticate and check the caller's role against a required role.
async fn require_role(state: &AppState, headers: &HeaderMap, required: Role) -> Result<db::User> {
    let user = get_authenticated_user(state, headers).await?;
    let role = Role::from_str(&user.role)?;
    if !role.allows(required) {
        return Err(AppError::Forbidden(format!(
            "Requires {} role",
            required.as_str()
        )));
    }
    Ok(user)
}

/// Reject malformed book/review IDs before touching storage.
fn validate_id(id: &str) -> Result<()> {
    uuid::Uuid::parse_str(id).map_err(|_| AppError::Validation("Invalid ID format".to_string()))?;
    Ok(())
}

/// Look up a book by a pre-validated ID.
fn get_book_or_404(state: &AppState, id: &str) -> Result<Book> {
    validate_id(id)?;
    state
        .db
        .get_book(id)?
        .ok_or_else(|| AppError::NotFound("Book not found".to_string()))
}

/// Whether a user may open a book's content: free books are open to
/// everyone, paid books require ownership; uploaders and admins bypass.
fn can_access_content(state: &AppState, user: &db::User, book: &Book) -> Result<bool> {
    if book.price == 0 || book.uploader_id == user.id || user.role == "admin" {
        return Ok(true);
    }
    state.db.has_book(&user.id, &book.id)
}

/// Review eligibility is stricter than content access: ownership or a free
/// book, with no uploader/admin bypass.
fn can_review(db: &crate::db::Database, user: &db::User, book: &Book) -> Result<bool> {
    if book.price == 0 {
        return Ok(true);
    }
    db.has_book(&user.id, &book.id)
}

/// Pagination query parameters.
#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    skip: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    20
}

impl Pagination {
    fn limit(&self) -> u32 {
        self.limit.min(100)
    }
}

// ============================================================================
// WEB PAGES
// ============================================================================

/// Index page (simple HTML).
pub async fn index(State(state): State<AppState>) -> Result<Html<String>> {
    let book_count: i64 = state
        .db
        .count_by_category()?
        .iter()
        .map(|(_, count)| count)
        .sum();

    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>bookmarket</title>
    <style>
        body {{ font-family: system-ui, sans-serif; max-width: 600px; margin: 2rem auto; padding: 0 1rem; }}
        h1 {{ color: #333; }}
        .stats {{ background: #f5f5f5; padding: 1rem; border-radius: 8px; margin: 1rem 0; }}
        code {{ background: #e8e8e8; padding: 0.2rem 0.4rem; border-radius: 4px; }}
    </style>
</head>
<body>
    <h1>bookmarket</h1>
    <div class="stats">
        <p><strong>{book_count}</strong> books in catalog</p>
    </div>
    <p>API endpoints are served under <code>/auth</code>, <code>/books</code>,
       <code>/users</code> and <code>/creator</code>.</p>
</body>
</html>"#,
        book_count = book_count,
    );

    Ok(Html(html))
}

/// Health check.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ============================================================================
// AUTH API
// ============================================================================

/// Register request.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

/// Login request.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

/// Login/register response.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    access_token: String,
    token_type: String,
    user_id: String,
    username: String,
    role: String,
}

/// Register a new reader account and log in.
pub async fn auth_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<TokenResponse>> {
    let user = state.auth.register(&req.username, &req.email, &req.password)?;
    let token = state.auth.issue_token(&user.username)?;

    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer".to_string(),
        user_id: user.id,
        username: user.username,
        role: user.role,
    }))
}

/// Auth login.
pub async fn auth_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenResponse>> {
    let (user, token) = state.auth.login(&req.username, &req.password)?;

    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer".to_string(),
        user_id: user.id,
        username: user.username,
        role: user.role,
    }))
}

/// Get current user info.
pub async fn auth_me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<db::User>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(user))
}

// ============================================================================
// BOOKS API
// ============================================================================

/// Catalog book representation (blob IDs reduced to availability flags).
#[derive(Debug, Serialize)]
pub struct BookResponse {
    id: String,
    title: String,
    author: String,
    description: String,
    category: String,
    price: i64,
    rating: f64,
    has_pdf: bool,
    has_cover: bool,
    uploader_id: String,
    created_at: i64,
    updated_at: i64,
}

impl From<Book> for BookResponse {
    fn from(book: Book) -> Self {
        Self {
            id: book.id,
            title: book.title,
            author: book.author,
            description: book.description,
            category: book.category,
            price: book.price,
            rating: book.rating,
            has_pdf: book.pdf_blob_id.is_some(),
            has_cover: book.cover_blob_id.is_some(),
            uploader_id: book.uploader_id,
            created_at: book.created_at,
            updated_at: book.updated_at,
        }
    }
}

/// Catalog listing parameters.
#[derive(Debug, Deserialize)]
pub struct BookListParams {
    #[serde(default)]
    skip: u32,
    #[serde(default = "default_limit")]
    limit: u32,
    category: Option<String>,
    search: Option<String>,
    #[serde(default = "default_sort")]
    sort_by: String,
    #[serde(default = "default_order")]
    order: String,
}

fn default_sort() -> String {
    "created_at".to_string()
}

fn default_order() -> String {
    "desc".to_string()
}

/// List books with filtering, search and pagination.
pub async fn books_list(
    State(state): State<AppState>,
    Query(params): Query<BookListParams>,
) -> Result<Json<Vec<BookResponse>>> {
    if let Some(ref category) = params.category
        && !is_valid_category(category)
    {
        return Err(AppError::Validation(format!(
            "Unknown category '{}'",
            category
        )));
    }

    let query = BookQuery {
        skip: params.skip,
        limit: params.limit.min(100),
        category: params.category,
        search: params.search,
        sort_by: params.sort_by,
        descending: params.order != "asc",
    };

    let books = state.db.list_books(&query)?;
    Ok(Json(books.into_iter().map(BookResponse::from).collect()))
}

/// Book detail with review count.
#[derive(Debug, Serialize)]
pub struct BookDetail {
    #[serde(flatten)]
    book: BookResponse,
    review_count: i64,
}

/// Get a single book.
pub async fn books_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BookDetail>> {
    let book = get_book_or_404(&state, &id)?;
    let (review_count, _) = state.db.review_aggregate(&book.id)?;

    Ok(Json(BookDetail {
        book: BookResponse::from(book),
        review_count,
    }))
}

/// Upload a new book (admin only). Multipart form with metadata fields plus
/// a required PDF and an optional cover image.
pub async fn books_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<BookDetail>> {
    let user = require_role(&state, &headers, Role::Admin).await?;

    let mut title = String::new();
    let mut author: Option<String> = None;
    let mut description = String::new();
    let mut category = "other".to_string();
    let mut price: i64 = 0;
    let mut pdf: Option<(String, String, Vec<u8>)> = None;
    let mut cover: Option<(String, String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Invalid multipart request: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "title" => {
                title = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("Invalid field: {}", e)))?;
            }
            "author" => {
                author = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AppError::Validation(format!("Invalid field: {}", e)))?,
                );
            }
            "description" => {
                description = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("Invalid field: {}", e)))?;
            }
            "category" => {
                category = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("Invalid field: {}", e)))?;
            }
            "price" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("Invalid field: {}", e)))?;
                price = text
                    .trim()
                    .parse()
                    .map_err(|_| AppError::Validation("Price must be an integer".to_string()))?;
            }
            "pdf" => {
                let filename = field.file_name().unwrap_or("book.pdf").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/pdf")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("Invalid file upload: {}", e)))?;
                pdf = Some((filename, content_type, data.to_vec()));
            }
            "cover" => {
                let filename = field.file_name().unwrap_or("cover").to_string();
                let content_type = field.content_type().unwrap_or("image/jpeg").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("Invalid file upload: {}", e)))?;
                cover = Some((filename, content_type, data.to_vec()));
            }
            _ => {}
        }
    }

    if title.trim().is_empty() {
        return Err(AppError::Validation("Title is required".to_string()));
    }
    if !is_valid_category(&category) {
        return Err(AppError::Validation(format!(
            "Unknown category '{}'",
            category
        )));
    }
    if price < 0 {
        return Err(AppError::Validation("Price cannot be negative".to_string()));
    }

    let (pdf_name, pdf_type, pdf_data) =
        pdf.ok_or_else(|| AppError::Validation("A PDF file is required".to_string()))?;

    if !pdf_type.contains("pdf") && !pdf_name.to_lowercase().ends_with(".pdf") {
        return Err(AppError::Validation("Book file must be a PDF".to_string()));
    }
    if pdf_data.len() > state.config.uploads.max_pdf_bytes() {
        return Err(AppError::Validation(format!(
            "PDF exceeds the {} MB limit",
            state.config.uploads.max_pdf_mb
        )));
    }

    if let Some((_, ref cover_type, ref cover_data)) = cover {
        if !cover_type.starts_with("image/") {
            return Err(AppError::Validation("Cover must be an image".to_string()));
        }
        if cover_data.len() > state.config.uploads.max_cover_bytes() {
            return Err(AppError::Validation(format!(
                "Cover exceeds the {} MB limit",
                state.config.uploads.max_cover_mb
            )));
        }
    }

    let now = db::now_timestamp();

    let pdf_blob = StoredBlob {
        id: uuid::Uuid::new_v4().to_string(),
        filename: pdf_name,
        content_type: pdf_type,
        size: pdf_data.len() as i64,
        data: pdf_data,
        uploaded_at: now,
    };
    state.db.put_blob(&pdf_blob)?;

    let cover_blob_id = match cover {
        Some((filename, content_type, data)) => {
            let blob = StoredBlob {
                id: uuid::Uuid::new_v4().to_string(),
                filename,
                content_type,
                size: data.len() as i64,
                data,
                uploaded_at: now,
            };
            state.db.put_blob(&blob)?;
            Some(blob.id)
        }
        None => None,
    };

    let book = Book {
        id: uuid::Uuid::new_v4().to_string(),
        title: title.trim().to_string(),
        author: author.unwrap_or_else(|| user.username.clone()),
        description,
        category,
        price,
        rating: 0.0,
        pdf_blob_id: Some(pdf_blob.id),
        cover_blob_id,
        uploader_id: user.id,
        created_at: now,
        updated_at: now,
    };

    state.db.create_book(&book)?;
    tracing::info!(book = %book.id, title = %book.title, "Book uploaded");

    Ok(Json(BookDetail {
        book: BookResponse::from(book),
        review_count: 0,
    }))
}

/// Delete a book (admin only).
pub async fn books_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    require_role(&state, &headers, Role::Admin).await?;
    validate_id(&id)?;

    if !state.db.delete_book(&id)? {
        return Err(AppError::NotFound("Book not found".to_string()));
    }

    tracing::info!(book = %id, "Book deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// List the fixed category set.
pub async fn books_categories() -> Json<Vec<&'static str>> {
    Json(CATEGORIES.to_vec())
}

/// List books in one category.
pub async fn books_by_category(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<BookResponse>>> {
    if !is_valid_category(&category) {
        return Err(AppError::Validation(format!(
            "Unknown category '{}'",
            category
        )));
    }

    let query = BookQuery {
        skip: pagination.skip,
        limit: pagination.limit(),
        category: Some(category),
        search: None,
        sort_by: "created_at".to_string(),
        descending: true,
    };

    let books = state.db.list_books(&query)?;
    Ok(Json(books.into_iter().map(BookResponse::from).collect()))
}

/// Book counts per category, zero-filled over the fixed set.
pub async fn books_category_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>> {
    let counts = state.db.count_by_category()?;
    let mut stats = serde_json::Map::new();

    for category in CATEGORIES {
        let count = counts
            .iter()
            .find(|(c, _)| c == category)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        stats.insert(category.to_string(), json!(count));
    }

    Ok(Json(serde_json::Value::Object(stats)))
}

/// Blob storage totals (admin only).
pub async fn books_storage_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    require_role(&state, &headers, Role::Admin).await?;

    let (blobs, total_bytes) = state.db.storage_stats()?;
    Ok(Json(json!({
        "blobs": blobs,
        "total_bytes": total_bytes,
        "total_mb": (total_bytes as f64) / (1024.0 * 1024.0),
    })))
}

/// Serve a book's cover image (public).
pub async fn books_cover(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let book = get_book_or_404(&state, &id)?;
    let blob_id = book
        .cover_blob_id
        .ok_or_else(|| AppError::NotFound("Book has no cover".to_string()))?;

    let blob = state
        .db
        .get_blob(&blob_id)?
        .ok_or_else(|| AppError::NotFound("Cover not found".to_string()))?;

    Ok(blob_response(blob, None))
}

/// Open a book's PDF for in-browser reading. Records the read.
pub async fn books_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let book = get_book_or_404(&state, &id)?;

    if !can_access_content(&state, &user, &book)? {
        return Err(AppError::Forbidden(
            "Purchase this book to read it".to_string(),
        ));
    }

    let blob_id = book
        .pdf_blob_id
        .ok_or_else(|| AppError::NotFound("Book has no PDF".to_string()))?;
    let blob = state
        .db
        .get_blob(&blob_id)?
        .ok_or_else(|| AppError::NotFound("PDF not found".to_string()))?;

    state.db.bump_read(&user.id, &book.id)?;

    Ok(blob_response(blob, Some("inline".to_string())))
}

/// Download a book's PDF as an attachment.
pub async fn books_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let book = get_book_or_404(&state, &id)?;

    if !can_access_content(&state, &user, &book)? {
        return Err(AppError::Forbidden(
            "Purchase this book to download it".to_string(),
        ));
    }

    let blob_id = book
        .pdf_blob_id
        .ok_or_else(|| AppError::NotFound("Book has no PDF".to_string()))?;
    let blob = state
        .db
        .get_blob(&blob_id)?
        .ok_or_else(|| AppError::NotFound("PDF not found".to_string()))?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        blob.filename.replace('"', "")
    );
    Ok(blob_response(blob, Some(disposition)))
}

// ============================================================================
// REVIEWS API
// ============================================================================

/// Review creation request.
#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    rating: i64,
    #[serde(default)]
    body: String,
}

/// Review update request.
#[derive(Debug, Deserialize)]
pub struct ReviewUpdateRequest {
    rating: Option<i64>,
    body: Option<String>,
}

fn validate_rating(rating: i64) -> Result<()> {
    if !(1..=5).contains(&rating) {
        return Err(AppError::Validation(
            "Rating must be between 1 and 5".to_string(),
        ));
    }
    Ok(())
}

fn validate_review_body(body: &str) -> Result<()> {
    if body.len() > 2000 {
        return Err(AppError::Validation(
            "Review must be at most 2000 characters".to_string(),
        ));
    }
    Ok(())
}

/// List a book's reviews with the derived aggregate.
pub async fn reviews_list(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<serde_json::Value>> {
    let book = get_book_or_404(&state, &id)?;
    let reviews = state
        .db
        .list_reviews(&book.id, pagination.skip, pagination.limit())?;
    let (count, average) = state.db.review_aggregate(&book.id)?;

    Ok(Json(json!({
        "reviews": reviews,
        "count": count,
        "average_rating": average,
    })))
}

/// Create a review for an owned (or free) book.
pub async fn reviews_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> Result<(StatusCode, Json<Review>)> {
    let user = get_authenticated_user(&state, &headers).await?;
    let book = get_book_or_404(&state, &id)?;

    validate_rating(req.rating)?;
    validate_review_body(&req.body)?;

    if !can_review(&state.db, &user, &book)? {
        return Err(AppError::Forbidden(
            "You can only review books you own".to_string(),
        ));
    }

    let now = db::now_timestamp();
    let review = Review {
        id: uuid::Uuid::new_v4().to_string(),
        book_id: book.id,
        user_id: user.username,
        rating: req.rating,
        body: req.body,
        created_at: now,
        updated_at: now,
    };

    state.db.add_review(&review)?;
    Ok((StatusCode::CREATED, Json(review)))
}

/// Update your own review.
pub async fn reviews_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, review_id)): Path<(String, String)>,
    Json(req): Json<ReviewUpdateRequest>,
) -> Result<Json<Review>> {
    let user = get_authenticated_user(&state, &headers).await?;
    validate_id(&id)?;
    validate_id(&review_id)?;

    if let Some(rating) = req.rating {
        validate_rating(rating)?;
    }
    if let Some(ref body) = req.body {
        validate_review_body(body)?;
    }

    let review = state.db.update_review(
        &id,
        &review_id,
        &user.username,
        req.rating,
        req.body.as_deref(),
    )?;
    Ok(Json(review))
}

/// Delete your own review.
pub async fn reviews_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, review_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let user = get_authenticated_user(&state, &headers).await?;
    validate_id(&id)?;
    validate_id(&review_id)?;

    state.db.delete_review(&id, &review_id, &user.username)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Review plus the reviewed book's title and author.
#[derive(Debug, Serialize)]
pub struct UserReview {
    #[serde(flatten)]
    review: Review,
    book_title: String,
    book_author: String,
}

/// All reviews written by the caller.
pub async fn reviews_by_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<UserReview>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let reviews = state
        .db
        .user_reviews(&user.username, pagination.skip, pagination.limit())?;

    Ok(Json(
        reviews
            .into_iter()
            .map(|(review, book_title, book_author)| UserReview {
                review,
                book_title,
                book_author,
            })
            .collect(),
    ))
}

// ============================================================================
// READING API
// ============================================================================

/// Progress update request.
#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    book_id: String,
    current_page: Option<i64>,
    percentage: Option<f64>,
    status: Option<String>,
}

/// Save reading progress for a book.
pub async fn reading_save_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProgressRequest>,
) -> Result<StatusCode> {
    let user = get_authenticated_user(&state, &headers).await?;
    let book = get_book_or_404(&state, &req.book_id)?;

    let status = req.status.unwrap_or_else(|| "reading".to_string());
    if !READING_STATUSES.contains(&status.as_str()) {
        return Err(AppError::Validation(format!(
            "Status must be one of: {}",
            READING_STATUSES.join(", ")
        )));
    }

    if let Some(percentage) = req.percentage
        && !(0.0..=100.0).contains(&percentage)
    {
        return Err(AppError::Validation(
            "Percentage must be between 0 and 100".to_string(),
        ));
    }

    state
        .db
        .save_progress(&user.id, &book.id, req.current_page, req.percentage, &status)?;
    Ok(StatusCode::OK)
}

/// Session plus the book's title and author.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    session: db::ReadingSession,
    book_title: String,
    book_author: String,
}

fn sessions_response(
    sessions: Vec<(db::ReadingSession, String, String)>,
) -> Json<Vec<SessionResponse>> {
    Json(
        sessions
            .into_iter()
            .map(|(session, book_title, book_author)| SessionResponse {
                session,
                book_title,
                book_author,
            })
            .collect(),
    )
}

/// Books currently being read.
pub async fn reading_in_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<SessionResponse>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let sessions =
        state
            .db
            .sessions_by_status(&user.id, "reading", pagination.skip, pagination.limit())?;
    Ok(sessions_response(sessions))
}

/// Completion request.
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    book_id: String,
}

/// Mark a book as completed.
pub async fn reading_mark_completed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CompleteRequest>,
) -> Result<StatusCode> {
    let user = get_authenticated_user(&state, &headers).await?;
    let book = get_book_or_404(&state, &req.book_id)?;

    let existing = state.db.get_progress(&user.id, &book.id)?;
    let (current_page, percentage) = existing
        .map(|s| (s.current_page, s.percentage))
        .unwrap_or((None, Some(100.0)));

    state
        .db
        .save_progress(&user.id, &book.id, current_page, percentage, "completed")?;
    Ok(StatusCode::OK)
}

/// Books marked completed.
pub async fn reading_completed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<SessionResponse>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let sessions =
        state
            .db
            .sessions_by_status(&user.id, "completed", pagination.skip, pagination.limit())?;
    Ok(sessions_response(sessions))
}

/// Reading totals by status.
pub async fn reading_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<db::ReadingStats>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.db.reading_stats(&user.id)?))
}

// ============================================================================
// USERS API
// ============================================================================

/// Current points balance.
pub async fn users_points(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(json!({ "points": user.points })))
}

/// Voucher redemption request.
#[derive(Debug, Deserialize)]
pub struct VoucherRequest {
    voucher: String,
}

/// Redeem a gift voucher and credit the resulting points.
pub async fn users_redeem_voucher(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VoucherRequest>,
) -> Result<Json<serde_json::Value>> {
    let user = get_authenticated_user(&state, &headers).await?;

    let code = payment::normalize_voucher(&req.voucher)?;
    let redeemed = state.payment.redeem(&code).await?;
    let points = payment::points_for_amount(redeemed.amount);

    let record = state.db.credit_points(
        &user.id,
        "truemoney",
        &redeemed.voucher_id,
        redeemed.amount,
        points,
    )?;

    tracing::info!(
        user = %user.username,
        amount = redeemed.amount,
        points = points,
        "Voucher redeemed"
    );

    Ok(Json(json!({
        "amount": record.amount,
        "points": record.points,
        "balance": user.points + points,
    })))
}

/// Payment history.
pub async fn users_payment_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<PaymentRecord>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let records = state
        .db
        .payment_history(&user.id, pagination.skip, pagination.limit())?;
    Ok(Json(records))
}

/// Purchase request.
#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    book_id: String,
}

/// Purchase a book with points.
pub async fn users_purchase_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PurchaseRequest>,
) -> Result<Json<serde_json::Value>> {
    let user = get_authenticated_user(&state, &headers).await?;
    validate_id(&req.book_id)?;

    let entry = state.db.purchase_book(&user.id, &req.book_id)?;

    tracing::info!(
        user = %user.username,
        book = %entry.book_id,
        price = entry.price_paid,
        "Book purchased"
    );

    Ok(Json(json!({
        "book_id": entry.book_id,
        "title": entry.title,
        "price_paid": entry.price_paid,
        "balance": user.points - entry.price_paid,
    })))
}

/// The caller's library.
pub async fn users_library(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<LibraryEntry>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let entries = state
        .db
        .get_library(&user.id, pagination.skip, pagination.limit())?;
    Ok(Json(entries))
}

/// Check whether the caller owns a book.
pub async fn users_library_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let user = get_authenticated_user(&state, &headers).await?;
    validate_id(&id)?;
    let owned = state.db.has_book(&user.id, &id)?;
    Ok(Json(json!({ "owned": owned })))
}

/// Remove a book from the caller's library. No refund.
pub async fn users_library_remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let user = get_authenticated_user(&state, &headers).await?;
    validate_id(&id)?;

    if !state.db.remove_library_entry(&user.id, &id)? {
        return Err(AppError::NotFound("Book not in library".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Get the caller's settings.
pub async fn users_settings_get(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserSettings>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(user.settings))
}

/// Replace the caller's settings wholesale.
pub async fn users_settings_put(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(settings): Json<UserSettings>,
) -> Result<Json<UserSettings>> {
    let user = get_authenticated_user(&state, &headers).await?;

    if !["light", "dark", "sepia"].contains(&settings.dark_mode_option.as_str()) {
        return Err(AppError::Validation(
            "'darkModeOption' must be one of: light, dark, sepia".to_string(),
        ));
    }

    state.db.update_settings(&user.id, &settings)?;
    Ok(Json(settings))
}

/// Single-setting update body.
#[derive(Debug, Deserialize)]
pub struct SettingValue {
    value: serde_json::Value,
}

/// Update one setting by key.
pub async fn users_settings_patch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(req): Json<SettingValue>,
) -> Result<Json<UserSettings>> {
    let mut user = get_authenticated_user(&state, &headers).await?;
    user.settings.set_key(&key, &req.value)?;
    state.db.update_settings(&user.id, &user.settings)?;
    Ok(Json(user.settings))
}

/// Reset one setting to its default.
pub async fn users_settings_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<UserSettings>> {
    let mut user = get_authenticated_user(&state, &headers).await?;
    user.settings.reset_key(&key)?;
    state.db.update_settings(&user.id, &user.settings)?;
    Ok(Json(user.settings))
}

/// The caller's account statistics.
pub async fn users_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<db::UserStats>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.db.user_stats(&user.id, &user.username)?))
}

/// Profile update request. Absent fields are left unchanged.
#[derive(Debug, Deserialize)]
pub struct ProfileUpdateRequest {
    email: Option<String>,
    full_name: Option<String>,
    bio: Option<String>,
    avatar_url: Option<String>,
    country: Option<String>,
    phone: Option<String>,
}

/// Update the caller's profile fields.
pub async fn users_profile_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProfileUpdateRequest>,
) -> Result<Json<db::User>> {
    let user = get_authenticated_user(&state, &headers).await?;

    if let Some(ref email) = req.email
        && (!email.contains('@') || email.len() > 254)
    {
        return Err(AppError::Validation("Invalid email address".to_string()));
    }
    if let Some(ref bio) = req.bio
        && bio.len() > 1000
    {
        return Err(AppError::Validation(
            "Bio must be at most 1000 characters".to_string(),
        ));
    }
    for (field, value) in [
        ("full_name", &req.full_name),
        ("avatar_url", &req.avatar_url),
        ("country", &req.country),
        ("phone", &req.phone),
    ] {
        if let Some(value) = value
            && value.len() > 255
        {
            return Err(AppError::Validation(format!(
                "'{}' must be at most 255 characters",
                field
            )));
        }
    }

    state.db.update_profile(
        &user.id,
        req.email.as_deref(),
        req.full_name.as_deref(),
        req.bio.as_deref(),
        req.avatar_url.as_deref(),
        req.country.as_deref(),
        req.phone.as_deref(),
    )?;

    let updated = state
        .db
        .get_user_by_id(&user.id)?
        .ok_or_else(|| AppError::Internal("User disappeared during update".to_string()))?;
    Ok(Json(updated))
}

/// Username change request.
#[derive(Debug, Deserialize)]
pub struct UsernameRequest {
    username: String,
}

/// Change the caller's username. Tokens carry the username, so a fresh
/// token is issued with the response.
pub async fn users_username_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UsernameRequest>,
) -> Result<Json<serde_json::Value>> {
    let user = get_authenticated_user(&state, &headers).await?;
    validate_username(&req.username)?;

    state.db.update_username(&user.id, &req.username)?;
    let token = state.auth.issue_token(&req.username)?;

    tracing::info!(old = %user.username, new = %req.username, "Username changed");

    Ok(Json(json!({
        "username": req.username,
        "access_token": token,
        "token_type": "bearer",
    })))
}

/// Public profile by username.
pub async fn users_public_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let user = state
        .db
        .get_user_by_username(&username)?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    let stats = state.db.creator_stats(&user.username)?;
    let following = state.db.following_count(&user.id)?;

    // Viewer context is optional; unauthenticated requests still see the page
    let is_following = match extract_token(&headers) {
        Some(token) => match state.auth.authenticate(&token) {
            Ok(viewer) => Some(state.db.is_following(&viewer.id, &user.username)?),
            Err(_) => None,
        },
        None => None,
    };

    Ok(Json(json!({
        "username": user.username,
        "full_name": user.full_name,
        "bio": user.bio,
        "avatar_url": user.avatar_url,
        "country": user.country,
        "role": user.role,
        "created_at": user.created_at,
        "total_books": stats.total_books,
        "total_sales": stats.total_sales,
        "followers": stats.total_followers,
        "following": following,
        "is_following": is_following,
    })))
}

// ============================================================================
// CREATOR API
// ============================================================================

/// Creator dashboard numbers.
pub async fn creator_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<db::CreatorStats>> {
    let user = require_role(&state, &headers, Role::Creator).await?;
    Ok(Json(state.db.creator_stats(&user.username)?))
}

/// Sales history parameters.
#[derive(Debug, Deserialize)]
pub struct SalesHistoryParams {
    #[serde(default = "default_months")]
    months: u32,
}

fn default_months() -> u32 {
    6
}

/// Monthly sales counts, zero-filled over the requested window.
pub async fn creator_sales_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SalesHistoryParams>,
) -> Result<Json<Vec<MonthlySales>>> {
    let user = require_role(&state, &headers, Role::Creator).await?;
    let months = params.months.clamp(1, 12);

    let today = chrono::Utc::now().date_naive();
    let mut window = Vec::with_capacity(months as usize);
    for i in (0..months).rev() {
        let date = today
            .checked_sub_months(chrono::Months::new(i))
            .ok_or_else(|| AppError::Internal("Date arithmetic overflow".to_string()))?;
        window.push((format!("{}", date.format("%Y-%m")), date.month0() as usize));
    }

    let since_ym = window
        .first()
        .map(|(ym, _)| ym.clone())
        .unwrap_or_default();
    let since = chrono::NaiveDate::parse_from_str(&format!("{}-01", since_ym), "%Y-%m-%d")
        .map_err(|e| AppError::Internal(format!("Date parse error: {}", e)))?
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| AppError::Internal("Date arithmetic overflow".to_string()))?
        .and_utc()
        .timestamp();

    let sales = state.db.sales_by_month(&user.username, since)?;

    let history = window
        .into_iter()
        .map(|(ym, month0)| {
            let value = sales
                .iter()
                .find(|(m, _)| *m == ym)
                .map(|(_, count)| *count)
                .unwrap_or(0);
            MonthlySales {
                month: MONTH_NAMES[month0].to_string(),
                value,
            }
        })
        .collect();

    Ok(Json(history))
}

/// Book with its reader count (creator dashboard).
#[derive(Debug, Serialize)]
pub struct CreatorBook {
    #[serde(flatten)]
    book: BookResponse,
    readers: i64,
}

/// The caller's books with per-book reader counts.
pub async fn creator_books(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<CreatorBook>>> {
    let user = require_role(&state, &headers, Role::Creator).await?;
    let books = state
        .db
        .creator_books(&user.username, pagination.skip, pagination.limit())?;

    Ok(Json(
        books
            .into_iter()
            .map(|(book, readers)| CreatorBook {
                book: BookResponse::from(book),
                readers,
            })
            .collect(),
    ))
}

/// Follow/unfollow request.
#[derive(Debug, Deserialize)]
pub struct FollowRequest {
    creator: String,
}

/// Follow a creator.
pub async fn creator_follow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<FollowRequest>,
) -> Result<Json<serde_json::Value>> {
    let user = get_authenticated_user(&state, &headers).await?;

    if user.username == req.creator {
        return Err(AppError::Validation(
            "You cannot follow yourself".to_string(),
        ));
    }

    let target = state
        .db
        .get_user_by_username(&req.creator)?
        .ok_or_else(|| AppError::NotFound("Creator not found".to_string()))?;

    let target_role = Role::from_str(&target.role)?;
    if !target_role.allows(Role::Creator) {
        return Err(AppError::Validation(format!(
            "'{}' is not a creator",
            req.creator
        )));
    }

    state.db.follow(&user.id, &target.username)?;
    let followers = state.db.follower_count(&target.username)?;

    Ok(Json(json!({ "following": true, "followers": followers })))
}

/// Unfollow a creator.
pub async fn creator_unfollow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<FollowRequest>,
) -> Result<Json<serde_json::Value>> {
    let user = get_authenticated_user(&state, &headers).await?;

    state.db.unfollow(&user.id, &req.creator)?;
    let followers = state.db.follower_count(&req.creator)?;

    Ok(Json(json!({ "following": false, "followers": followers })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, UserSettings, now_timestamp};

    fn test_user(db: &Database, username: &str, role: &str) -> db::User {
        let user = db::User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: format!("{}@example.com", username),
            password_hash: "x".to_string(),
            role: role.to_string(),
            points: 0,
            settings: UserSettings::default(),
            full_name: None,
            bio: None,
            avatar_url: None,
            country: None,
            phone: None,
            created_at: now_timestamp(),
        };
        db.create_user(&user).unwrap();
        user
    }

    fn test_book(db: &Database, title: &str, price: i64, uploader_id: &str) -> Book {
        let now = now_timestamp();
        let book = Book {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            author: "writer".to_string(),
            description: String::new(),
            category: "fiction".to_string(),
            price,
            rating: 0.0,
            pdf_blob_id: None,
            cover_blob_id: None,
            uploader_id: uploader_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        db.create_book(&book).unwrap();
        book
    }

    #[test]
    fn test_validate_id_rejects_malformed_ids() {
        assert!(matches!(
            validate_id("not-a-uuid").unwrap_err(),
            AppError::Validation(_)
        ));
        assert!(matches!(
            validate_id("").unwrap_err(),
            AppError::Validation(_)
        ));
        assert!(matches!(
            validate_id("12345").unwrap_err(),
            AppError::Validation(_)
        ));

        validate_id(&uuid::Uuid::new_v4().to_string()).unwrap();
    }

    #[test]
    fn test_review_gate_has_no_role_bypass() {
        let db = Database::open_memory().unwrap();
        let admin = test_user(&db, "admin", "admin");
        let uploader = test_user(&db, "uploader", "creator");
        let paid = test_book(&db, "Paid", 50, &uploader.id);

        // Neither admin nor uploader may review a paid book they do not own
        assert!(!can_review(&db, &admin, &paid).unwrap());
        assert!(!can_review(&db, &uploader, &paid).unwrap());

        // Ownership unlocks it
        db.credit_points(&admin.id, "truemoney", "seed", 5.0, 50)
            .unwrap();
        db.purchase_book(&admin.id, &paid.id).unwrap();
        assert!(can_review(&db, &admin, &paid).unwrap());
    }

    #[test]
    fn test_free_books_are_reviewable_without_purchase() {
        let db = Database::open_memory().unwrap();
        let reader = test_user(&db, "reader", "reader");
        let free = test_book(&db, "Free", 0, "someone");

        assert!(can_review(&db, &reader, &free).unwrap());
    }
}
