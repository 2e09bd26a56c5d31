//! Export a date window of an IMAP folder to CSV.

pub mod auth;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod mail;
pub mod providers;
pub mod store;
