//! Integration tests for tickrelay.
//!
//! These tests verify the interaction between components:
//! - Feed connection lifecycle against a local WebSocket server
//! - Price flow from the feed through the lanes to the downstream service

pub mod common;
