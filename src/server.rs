//! HTTP server and routes.

mod handlers;
mod state;

pub use state::AppState;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{delete, get, patch, post, put},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/register", post(handlers::auth_register))
        .route("/login", post(handlers::auth_login))
        .route("/me", get(handlers::auth_me));

    let book_routes = Router::new()
        .route("/", get(handlers::books_list))
        .route("/", post(handlers::books_upload))
        .route("/categories", get(handlers::books_categories))
        .route("/category/{category}", get(handlers::books_by_category))
        .route("/stats/categories", get(handlers::books_category_stats))
        .route("/stats/storage", get(handlers::books_storage_stats))
        .route("/stats/reading", get(handlers::reading_stats))
        .route("/reading/progress", post(handlers::reading_save_progress))
        .route("/reading/in-progress", get(handlers::reading_in_progress))
        .route("/reading/completed", get(handlers::reading_completed))
        .route("/reading/completed", post(handlers::reading_mark_completed))
        .route("/user/reviews", get(handlers::reviews_by_user))
        .route("/{id}", get(handlers::books_get))
        .route("/{id}", delete(handlers::books_delete))
        .route("/{id}/cover", get(handlers::books_cover))
        .route("/{id}/read", get(handlers::books_read))
        .route("/{id}/download", get(handlers::books_download))
        .route("/{id}/reviews", get(handlers::reviews_list))
        .route("/{id}/reviews", post(handlers::reviews_create))
        .route("/{id}/reviews/{review_id}", patch(handlers::reviews_update))
        .route(
            "/{id}/reviews/{review_id}",
            delete(handlers::reviews_delete),
        );

    let user_routes = Router::new()
        .route("/me", get(handlers::auth_me))
        .route("/me/points", get(handlers::users_points))
        .route("/me/payment/truemoney", post(handlers::users_redeem_voucher))
        .route("/me/payment/history", get(handlers::users_payment_history))
        .route("/me/purchase/book", post(handlers::users_purchase_book))
        .route("/me/library", get(handlers::users_library))
        .route("/me/library/check/{id}", get(handlers::users_library_check))
        .route("/me/library/{id}", delete(handlers::users_library_remove))
        .route("/me/settings", get(handlers::users_settings_get))
        .route("/me/settings", put(handlers::users_settings_put))
        .route("/me/settings/{key}", patch(handlers::users_settings_patch))
        .route(
            "/me/settings/{key}",
            delete(handlers::users_settings_reset),
        )
        .route("/me/stats", get(handlers::users_stats))
        .route("/me/profile", patch(handlers::users_profile_update))
        .route("/me/username", patch(handlers::users_username_update))
        .route("/profile/{username}", get(handlers::users_public_profile));

    let creator_routes = Router::new()
        .route("/stats", get(handlers::creator_stats))
        .route("/sales/history", get(handlers::creator_sales_history))
        .route("/books", get(handlers::creator_books))
        .route("/follow", post(handlers::creator_follow))
        .route("/unfollow", post(handlers::creator_unfollow));

    let body_limit = state.config.uploads.max_pdf_bytes() + state.config.uploads.max_cover_bytes();

    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .nest("/auth", auth_routes)
        .nest("/books", book_routes)
        .nest("/users", user_routes)
        .nest("/creator", creator_routes)
        .layer(DefaultBodyLimit::max(body_limit + 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state))
        .with_state(state)
}

/// CORS layer from the configured origin allow-list (permissive when empty).
fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .server
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
