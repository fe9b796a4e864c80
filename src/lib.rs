// ABOUTME: Library root for offspot-demo - exposes the lifecycle building blocks for testing.
// ABOUTME: The main binary is in main.rs.

pub mod blockdev;
pub mod checksum;
pub mod compose;
pub mod config;
pub mod deploy;
pub mod diagnostics;
pub mod download;
pub mod engine;
pub mod error;
pub mod host;
pub mod imager;
pub mod manifest;
pub mod output;
pub mod proxy;
pub mod registry;
pub mod toggle;
pub mod types;
