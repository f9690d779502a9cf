//! Gator - a command-line RSS aggregator
//!
//! Users follow feeds; the `agg` command periodically fetches the most overdue
//! feed and stores its entries as posts that followers can browse.

pub mod commands;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod handlers;
pub mod ingest;
pub mod scheduler;
