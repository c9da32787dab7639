//! crawl-pacer - adaptive request pacing for crawlers.
//!
//! Decides how long a crawler should wait before each request to a
//! rate-limited host, tracks how the host responds, and backs off through an
//! anti-blocking state machine before the host bans the client outright.

pub mod config;
pub mod pacing;
