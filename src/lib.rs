//! bookmarket: book marketplace and reading platform backend.
//!
//! A points-based book marketplace: readers top up points by redeeming
//! payment vouchers, spend them on books uploaded by admins, track reading
//! progress and write reviews; creators get follower and sales analytics.
//!
//! # Features
//!
//! - User accounts with JWT bearer authentication
//! - Role-based authorization (reader, creator, admin)
//! - Book catalog with search, category filtering and pagination
//! - PDF and cover storage in a SQLite-backed blob store
//! - Points ledger: voucher redemption and atomic purchases
//! - Reviews with derived mean ratings
//! - Reading progress tracking
//! - Creator analytics (followers, sales history)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Authentication, tokens and authorization policy.
pub mod auth;
/// Configuration and CLI.
pub mod config;
/// Database operations.
pub mod db;
/// Error types.
pub mod error;
/// Voucher normalization and payment gateway client.
pub mod payment;
/// HTTP server.
pub mod server;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use db::Database;
pub use error::{AppError, Result};
pub use server::AppState;
