//! gator - a personal RSS feed aggregator
//!
//! Users register and follow RSS feeds; the `agg` command runs a scheduler
//! that polls the least recently fetched feed on a fixed interval and stores
//! the items it finds.

pub mod commands;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod scheduler;
