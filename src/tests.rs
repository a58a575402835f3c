//! Integration tests for storage, ledger and auth behavior.

use crate::auth::AuthService;
use crate::db::{
    Book, BookQuery, Database, Review, StoredBlob, User, UserSettings, now_timestamp,
};
use crate::error::AppError;
use crate::payment::{normalize_voucher, points_for_amount};

fn make_user(db: &Database, username: &str, points: i64) -> User {
    let user = User {
        id: uuid::Uuid::new_v4().to_string(),
        username: username.to_string(),
        email: format!("{}@example.com", username),
        password_hash: "x".to_string(),
        role: "reader".to_string(),
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
    if points > 0 {
        db.credit_points(&user.id, "truemoney", "seed", points as f64 / 10.0, points)
            .unwrap();
    }
    db.get_user_by_id(&user.id).unwrap().unwrap()
}

fn make_book(db: &Database, title: &str, author: &str, price: i64) -> Book {
    let now = now_timestamp();
    let book = Book {
        id: uuid::Uuid::new_v4().to_string(),
        title: title.to_string(),
        author: author.to_string(),
        description: String::new(),
        category: "fiction".to_string(),
        price,
        rating: 0.0,
        pdf_blob_id: None,
        cover_blob_id: None,
        uploader_id: "admin".to_string(),
        created_at: now,
        updated_at: now,
    };
    db.create_book(&book).unwrap();
    book
}

fn make_review(db: &Database, book: &Book, username: &str, rating: i64) -> Review {
    let now = now_timestamp();
    let review = Review {
        id: uuid::Uuid::new_v4().to_string(),
        book_id: book.id.clone(),
        user_id: username.to_string(),
        rating,
        body: "nice".to_string(),
        created_at: now,
        updated_at: now,
    };
    db.add_review(&review).unwrap();
    review
}

// ===== Purchases and points =====

#[test]
fn test_purchase_deducts_points_and_adds_library_entry() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "buyer", 100);
    let book = make_book(&db, "Paid Book", "author", 60);

    let entry = db.purchase_book(&user.id, &book.id).unwrap();
    assert_eq!(entry.price_paid, 60);
    assert_eq!(entry.title, "Paid Book");

    let after = db.get_user_by_id(&user.id).unwrap().unwrap();
    assert_eq!(after.points, 40);
    assert!(db.has_book(&user.id, &book.id).unwrap());
}

#[test]
fn test_purchase_insufficient_points_changes_nothing() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "poor", 30);
    let book = make_book(&db, "Pricey", "author", 50);

    let err = db.purchase_book(&user.id, &book.id).unwrap_err();
    match err {
        AppError::InsufficientPoints {
            required,
            available,
        } => {
            assert_eq!(required, 50);
            assert_eq!(available, 30);
        }
        other => panic!("expected InsufficientPoints, got {:?}", other),
    }

    let after = db.get_user_by_id(&user.id).unwrap().unwrap();
    assert_eq!(after.points, 30);
    assert!(!db.has_book(&user.id, &book.id).unwrap());
    assert!(db.get_library(&user.id, 0, 10).unwrap().is_empty());
}

#[test]
fn test_duplicate_purchase_is_conflict() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "repeat", 200);
    let book = make_book(&db, "Once", "author", 50);

    db.purchase_book(&user.id, &book.id).unwrap();
    let err = db.purchase_book(&user.id, &book.id).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    // Only the first purchase was charged
    let after = db.get_user_by_id(&user.id).unwrap().unwrap();
    assert_eq!(after.points, 150);
}

#[test]
fn test_free_book_purchase_with_zero_balance() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "broke", 0);
    let book = make_book(&db, "Freebie", "author", 0);

    let entry = db.purchase_book(&user.id, &book.id).unwrap();
    assert_eq!(entry.price_paid, 0);

    let after = db.get_user_by_id(&user.id).unwrap().unwrap();
    assert_eq!(after.points, 0);
}

#[test]
fn test_purchase_missing_book_is_not_found() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "nobook", 100);

    let missing = uuid::Uuid::new_v4().to_string();
    let err = db.purchase_book(&user.id, &missing).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[test]
fn test_credit_points_writes_exactly_one_payment_record() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "topup", 0);

    let record = db
        .credit_points(&user.id, "truemoney", "voucher-1", 15.5, 155)
        .unwrap();
    assert_eq!(record.points, 155);
    assert_eq!(record.status, "success");

    let after = db.get_user_by_id(&user.id).unwrap().unwrap();
    assert_eq!(after.points, 155);

    let history = db.payment_history(&user.id, 0, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].voucher_ref, "voucher-1");
}

#[test]
fn test_points_conversion_floors() {
    assert_eq!(points_for_amount(9.99), 99);
    assert_eq!(points_for_amount(10.0), 100);
    assert_eq!(points_for_amount(0.04), 0);
}

#[test]
fn test_library_remove_is_not_a_refund() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "remover", 100);
    let book = make_book(&db, "Gone", "author", 40);

    db.purchase_book(&user.id, &book.id).unwrap();
    assert!(db.remove_library_entry(&user.id, &book.id).unwrap());
    assert!(!db.remove_library_entry(&user.id, &book.id).unwrap());

    let after = db.get_user_by_id(&user.id).unwrap().unwrap();
    assert_eq!(after.points, 60);
}

// ===== Reviews and ratings =====

#[test]
fn test_review_aggregation_rounds_to_one_decimal() {
    let db = Database::open_memory().unwrap();
    let book = make_book(&db, "Rated", "author", 0);

    make_review(&db, &book, "alice", 5);
    make_review(&db, &book, "bob", 4);
    make_review(&db, &book, "carol", 4);

    // mean of 5,4,4 = 4.333... -> 4.3
    let loaded = db.get_book(&book.id).unwrap().unwrap();
    assert_eq!(loaded.rating, 4.3);

    let (count, average) = db.review_aggregate(&book.id).unwrap();
    assert_eq!(count, 3);
    assert_eq!(average, 4.3);
}

#[test]
fn test_rating_resets_to_zero_when_last_review_deleted() {
    let db = Database::open_memory().unwrap();
    let book = make_book(&db, "Ephemeral", "author", 0);

    let review = make_review(&db, &book, "alice", 5);
    assert_eq!(db.get_book(&book.id).unwrap().unwrap().rating, 5.0);

    db.delete_review(&book.id, &review.id, "alice").unwrap();
    assert_eq!(db.get_book(&book.id).unwrap().unwrap().rating, 0.0);
}

#[test]
fn test_one_review_per_user_per_book() {
    let db = Database::open_memory().unwrap();
    let book = make_book(&db, "Opinionated", "author", 0);

    make_review(&db, &book, "alice", 5);

    let now = now_timestamp();
    let second = Review {
        id: uuid::Uuid::new_v4().to_string(),
        book_id: book.id.clone(),
        user_id: "alice".to_string(),
        rating: 1,
        body: "changed my mind".to_string(),
        created_at: now,
        updated_at: now,
    };
    let err = db.add_review(&second).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[test]
fn test_review_mutation_is_author_only() {
    let db = Database::open_memory().unwrap();
    let book = make_book(&db, "Guarded", "author", 0);
    let review = make_review(&db, &book, "alice", 4);

    let err = db
        .update_review(&book.id, &review.id, "mallory", Some(1), None)
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let err = db.delete_review(&book.id, &review.id, "mallory").unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    // The author can update, and the rating follows
    let updated = db
        .update_review(&book.id, &review.id, "alice", Some(2), Some("meh"))
        .unwrap();
    assert_eq!(updated.rating, 2);
    assert_eq!(db.get_book(&book.id).unwrap().unwrap().rating, 2.0);
}

#[test]
fn test_user_reviews_join_book_metadata() {
    let db = Database::open_memory().unwrap();
    let book = make_book(&db, "Joined", "writer", 0);
    make_review(&db, &book, "alice", 3);

    let reviews = db.user_reviews("alice", 0, 10).unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].1, "Joined");
    assert_eq!(reviews[0].2, "writer");
}

// ===== Catalog =====

#[test]
fn test_list_books_filters_and_paginates() {
    let db = Database::open_memory().unwrap();
    for i in 0..5 {
        make_book(&db, &format!("Fiction {}", i), "author", 10);
    }
    let now = now_timestamp();
    let science = Book {
        id: uuid::Uuid::new_v4().to_string(),
        title: "Science Book".to_string(),
        author: "author".to_string(),
        description: String::new(),
        category: "science".to_string(),
        price: 10,
        rating: 0.0,
        pdf_blob_id: None,
        cover_blob_id: None,
        uploader_id: "admin".to_string(),
        created_at: now,
        updated_at: now,
    };
    db.create_book(&science).unwrap();

    let query = BookQuery {
        skip: 0,
        limit: 3,
        category: Some("fiction".to_string()),
        search: None,
        sort_by: "title".to_string(),
        descending: false,
    };
    let page = db.list_books(&query).unwrap();
    assert_eq!(page.len(), 3);
    assert_eq!(page[0].title, "Fiction 0");

    let query = BookQuery {
        skip: 3,
        limit: 3,
        category: Some("fiction".to_string()),
        search: None,
        sort_by: "title".to_string(),
        descending: false,
    };
    assert_eq!(db.list_books(&query).unwrap().len(), 2);
}

#[test]
fn test_list_books_search_is_case_insensitive() {
    let db = Database::open_memory().unwrap();
    make_book(&db, "The Rust Book", "steve", 0);
    make_book(&db, "Gardening", "alice", 0);

    let query = BookQuery {
        skip: 0,
        limit: 10,
        category: None,
        search: Some("RUST".to_string()),
        sort_by: "created_at".to_string(),
        descending: true,
    };
    let found = db.list_books(&query).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].title, "The Rust Book");
}

#[test]
fn test_unknown_sort_key_falls_back() {
    let db = Database::open_memory().unwrap();
    make_book(&db, "A", "author", 0);
    make_book(&db, "B", "author", 0);

    let query = BookQuery {
        skip: 0,
        limit: 10,
        category: None,
        search: None,
        sort_by: "uploader_id; DROP TABLE books".to_string(),
        descending: true,
    };
    // Falls back to created_at instead of erroring or injecting
    assert_eq!(db.list_books(&query).unwrap().len(), 2);
}

#[test]
fn test_delete_book_removes_blobs_but_keeps_library() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "keeper", 100);

    let blob = StoredBlob {
        id: uuid::Uuid::new_v4().to_string(),
        filename: "book.pdf".to_string(),
        content_type: "application/pdf".to_string(),
        size: 4,
        data: vec![1, 2, 3, 4],
        uploaded_at: now_timestamp(),
    };
    db.put_blob(&blob).unwrap();

    let now = now_timestamp();
    let book = Book {
        id: uuid::Uuid::new_v4().to_string(),
        title: "Doomed".to_string(),
        author: "author".to_string(),
        description: String::new(),
        category: "fiction".to_string(),
        price: 20,
        rating: 0.0,
        pdf_blob_id: Some(blob.id.clone()),
        cover_blob_id: None,
        uploader_id: "admin".to_string(),
        created_at: now,
        updated_at: now,
    };
    db.create_book(&book).unwrap();

    db.purchase_book(&user.id, &book.id).unwrap();
    assert!(db.delete_book(&book.id).unwrap());

    assert!(db.get_book(&book.id).unwrap().is_none());
    assert!(db.get_blob(&blob.id).unwrap().is_none());
    // Purchase history survives the catalog removal
    assert_eq!(db.get_library(&user.id, 0, 10).unwrap().len(), 1);
}

// ===== Reading progress =====

#[test]
fn test_progress_upsert_preserves_started_at() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "reader1", 0);
    let book = make_book(&db, "Long Read", "author", 0);

    db.save_progress(&user.id, &book.id, Some(10), Some(12.5), "reading")
        .unwrap();
    let first = db.get_progress(&user.id, &book.id).unwrap().unwrap();

    db.save_progress(&user.id, &book.id, Some(50), Some(62.0), "reading")
        .unwrap();
    let second = db.get_progress(&user.id, &book.id).unwrap().unwrap();

    assert_eq!(second.started_at, first.started_at);
    assert_eq!(second.current_page, Some(50));
}

#[test]
fn test_completing_sets_finished_at_once() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "finisher", 0);
    let book = make_book(&db, "Done", "author", 0);

    db.save_progress(&user.id, &book.id, Some(1), Some(1.0), "reading")
        .unwrap();
    assert!(
        db.get_progress(&user.id, &book.id)
            .unwrap()
            .unwrap()
            .finished_at
            .is_none()
    );

    db.save_progress(&user.id, &book.id, Some(100), Some(100.0), "completed")
        .unwrap();
    let done = db.get_progress(&user.id, &book.id).unwrap().unwrap();
    let finished_at = done.finished_at;
    assert!(finished_at.is_some());

    // Re-saving keeps the original completion time
    db.save_progress(&user.id, &book.id, Some(100), Some(100.0), "completed")
        .unwrap();
    assert_eq!(
        db.get_progress(&user.id, &book.id)
            .unwrap()
            .unwrap()
            .finished_at,
        finished_at
    );
}

#[test]
fn test_bump_read_increments_count() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "rereader", 0);
    let book = make_book(&db, "Again", "author", 0);

    db.bump_read(&user.id, &book.id).unwrap();
    db.bump_read(&user.id, &book.id).unwrap();
    db.bump_read(&user.id, &book.id).unwrap();

    let session = db.get_progress(&user.id, &book.id).unwrap().unwrap();
    assert_eq!(session.read_count, 3);
}

#[test]
fn test_reading_stats_counts_by_status() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "tracker", 0);
    let a = make_book(&db, "A", "author", 0);
    let b = make_book(&db, "B", "author", 0);
    let c = make_book(&db, "C", "author", 0);

    db.save_progress(&user.id, &a.id, None, None, "reading").unwrap();
    db.save_progress(&user.id, &b.id, None, None, "paused").unwrap();
    db.save_progress(&user.id, &c.id, None, None, "completed").unwrap();

    let stats = db.reading_stats(&user.id).unwrap();
    assert_eq!(stats.reading, 1);
    assert_eq!(stats.paused, 1);
    assert_eq!(stats.completed, 1);

    let in_progress = db.sessions_by_status(&user.id, "reading", 0, 10).unwrap();
    assert_eq!(in_progress.len(), 1);
    assert_eq!(in_progress[0].1, "A");
}

// ===== Creator analytics =====

#[test]
fn test_creator_stats_aggregate_sales() {
    let db = Database::open_memory().unwrap();
    let buyer1 = make_user(&db, "fan1", 100);
    let buyer2 = make_user(&db, "fan2", 100);
    let book1 = make_book(&db, "First", "writer", 30);
    let book2 = make_book(&db, "Second", "writer", 20);

    db.purchase_book(&buyer1.id, &book1.id).unwrap();
    db.purchase_book(&buyer1.id, &book2.id).unwrap();
    db.purchase_book(&buyer2.id, &book1.id).unwrap();

    db.follow(&buyer1.id, "writer").unwrap();

    let stats = db.creator_stats("writer").unwrap();
    assert_eq!(stats.total_books, 2);
    assert_eq!(stats.total_sales, 3);
    assert_eq!(stats.total_revenue, 80);
    assert_eq!(stats.total_readers, 2);
    assert_eq!(stats.total_followers, 1);
}

#[test]
fn test_follow_is_idempotent() {
    let db = Database::open_memory().unwrap();
    let fan = make_user(&db, "fan", 0);

    assert!(db.follow(&fan.id, "writer").unwrap());
    assert!(!db.follow(&fan.id, "writer").unwrap());
    assert_eq!(db.follower_count("writer").unwrap(), 1);

    assert!(db.unfollow(&fan.id, "writer").unwrap());
    assert!(!db.unfollow(&fan.id, "writer").unwrap());
    assert_eq!(db.follower_count("writer").unwrap(), 0);
}

#[test]
fn test_creator_books_include_reader_counts() {
    let db = Database::open_memory().unwrap();
    let buyer = make_user(&db, "fan", 100);
    let book = make_book(&db, "Counted", "writer", 10);
    make_book(&db, "Unsold", "writer", 10);

    db.purchase_book(&buyer.id, &book.id).unwrap();

    let books = db.creator_books("writer", 0, 10).unwrap();
    assert_eq!(books.len(), 2);
    let counted = books.iter().find(|(b, _)| b.title == "Counted").unwrap();
    assert_eq!(counted.1, 1);
    let unsold = books.iter().find(|(b, _)| b.title == "Unsold").unwrap();
    assert_eq!(unsold.1, 0);
}

#[test]
fn test_sales_by_month_groups_current_purchases() {
    let db = Database::open_memory().unwrap();
    let buyer = make_user(&db, "fan", 100);
    let book = make_book(&db, "Monthly", "writer", 10);
    db.purchase_book(&buyer.id, &book.id).unwrap();

    let sales = db.sales_by_month("writer", 0).unwrap();
    assert_eq!(sales.len(), 1);
    assert_eq!(sales[0].1, 1);
}

// ===== Users, settings, profiles =====

#[test]
fn test_duplicate_username_and_email_conflict() {
    let db = Database::open_memory().unwrap();
    make_user(&db, "taken", 0);

    let dup = User {
        id: uuid::Uuid::new_v4().to_string(),
        username: "taken".to_string(),
        email: "other@example.com".to_string(),
        password_hash: "x".to_string(),
        role: "reader".to_string(),
        points: 0,
        settings: UserSettings::default(),
        full_name: None,
        bio: None,
        avatar_url: None,
        country: None,
        phone: None,
        created_at: now_timestamp(),
    };
    assert!(matches!(
        db.create_user(&dup).unwrap_err(),
        AppError::Conflict(_)
    ));

    let dup_email = User {
        username: "different".to_string(),
        email: "taken@example.com".to_string(),
        ..dup
    };
    assert!(matches!(
        db.create_user(&dup_email).unwrap_err(),
        AppError::Conflict(_)
    ));
}

#[test]
fn test_settings_round_trip_and_key_validation() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "tweaker", 0);

    let mut settings = user.settings.clone();
    settings
        .set_key("darkModeOption", &serde_json::json!("sepia"))
        .unwrap();
    settings
        .set_key("readingModeScroll", &serde_json::json!(false))
        .unwrap();
    db.update_settings(&user.id, &settings).unwrap();

    let loaded = db.get_user_by_id(&user.id).unwrap().unwrap();
    assert_eq!(loaded.settings.dark_mode_option, "sepia");
    assert!(!loaded.settings.reading_mode_scroll);

    let mut bad = loaded.settings.clone();
    assert!(bad.set_key("darkModeOption", &serde_json::json!("neon")).is_err());
    assert!(bad.set_key("notifications", &serde_json::json!("yes")).is_err());
    assert!(bad.set_key("fontSize", &serde_json::json!(14)).is_err());

    bad.reset_key("darkModeOption").unwrap();
    assert_eq!(bad.dark_mode_option, "dark");
}

#[test]
fn test_username_rename_cascades() {
    let db = Database::open_memory().unwrap();
    let writer = make_user(&db, "oldname", 0);
    let fan = make_user(&db, "fan", 100);
    let book = make_book(&db, "Authored", "oldname", 10);

    db.purchase_book(&fan.id, &book.id).unwrap();
    db.follow(&fan.id, "oldname").unwrap();
    make_review(&db, &book, "oldname", 5);

    db.update_username(&writer.id, "newname").unwrap();

    assert!(db.get_user_by_username("oldname").unwrap().is_none());
    assert!(db.get_user_by_username("newname").unwrap().is_some());
    assert_eq!(db.get_book(&book.id).unwrap().unwrap().author, "newname");
    assert_eq!(db.follower_count("newname").unwrap(), 1);
    assert_eq!(db.user_reviews("newname", 0, 10).unwrap().len(), 1);
    assert_eq!(db.creator_stats("newname").unwrap().total_sales, 1);
}

#[test]
fn test_user_stats() {
    let db = Database::open_memory().unwrap();
    let user = make_user(&db, "statty", 100);
    let book = make_book(&db, "Tracked", "writer", 25);

    db.purchase_book(&user.id, &book.id).unwrap();
    make_review(&db, &book, "statty", 4);
    db.save_progress(&user.id, &book.id, None, Some(100.0), "completed")
        .unwrap();

    let stats = db.user_stats(&user.id, "statty").unwrap();
    assert_eq!(stats.owned_books, 1);
    assert_eq!(stats.points_spent, 25);
    assert_eq!(stats.reviews_written, 1);
    assert_eq!(stats.books_completed, 1);
}

// ===== End-to-end flow =====

#[test]
fn test_register_login_purchase_flow() {
    let db = Database::open_memory().unwrap();
    let auth = AuthService::new(db.clone(), "test-secret", 60);

    let user = auth
        .register("newreader", "newreader@example.com", "password")
        .unwrap();
    assert_eq!(user.role, "reader");
    assert_eq!(user.points, 0);

    let (logged_in, token) = auth.login("newreader", "password").unwrap();
    assert_eq!(logged_in.id, user.id);

    let from_token = auth.authenticate(&token).unwrap();
    assert_eq!(from_token.username, "newreader");

    db.credit_points(&user.id, "truemoney", "v1", 10.0, 100)
        .unwrap();
    let book = make_book(&db, "Flow", "writer", 50);
    db.purchase_book(&user.id, &book.id).unwrap();

    let after = auth.authenticate(&token).unwrap();
    assert_eq!(after.points, 50);
}

#[test]
fn test_login_rejects_bad_credentials() {
    let db = Database::open_memory().unwrap();
    let auth = AuthService::new(db, "test-secret", 60);
    auth.register("alice", "alice@example.com", "correct").unwrap();

    assert!(matches!(
        auth.login("alice", "wrong").unwrap_err(),
        AppError::Unauthorized(_)
    ));
    assert!(matches!(
        auth.login("nobody", "whatever").unwrap_err(),
        AppError::Unauthorized(_)
    ));
}

#[test]
fn test_database_persists_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("test.db");

    {
        let db = Database::open(&path).unwrap();
        make_user(&db, "durable", 42);
    }

    let db = Database::open(&path).unwrap();
    let user = db.get_user_by_username("durable").unwrap().unwrap();
    assert_eq!(user.points, 42);
}

// ===== Voucher normalization =====

#[test]
fn test_voucher_normalization_is_idempotent() {
    let shapes = [
        "ABC123",
        "https://gift.truemoney.com/campaign/?v=ABC123",
        "https://gift.truemoney.com/campaign/vouchers/ABC123/redeem",
        "https%3A%2F%2Fgift.truemoney.com%2Fcampaign%2F%3Fv%3DABC123",
    ];
    for shape in shapes {
        let code = normalize_voucher(shape).unwrap();
        assert_eq!(code, "ABC123");
        // A normalized code normalizes to itself
        assert_eq!(normalize_voucher(&code).unwrap(), code);
    }
}
