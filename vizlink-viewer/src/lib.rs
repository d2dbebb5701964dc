//! # vizlink-viewer — headless session driver
//!
//! Connects to a remote rendering server, keeps one session (or the
//! standard four-view layout) alive, and logs the incoming frame
//! stream. Useful for soak-testing a server and as a worked example of
//! the `vizlink-core` API.

pub mod config;
