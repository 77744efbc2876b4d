//! ATO kernel: device-polling scheduler and traffic aggregation engine for
//! a MikroTik management system.
//!
//! The scheduler owns the set of known devices and polls them through an
//! abstract transport under a global concurrency cap; completed polls feed
//! the traffic analyzer, which keeps a sliding-window top-talkers ranking.
//! The HTTP layer in [`http`] is a thin control surface over both.

pub mod analyzer;
pub mod config;
pub mod devices;
pub mod error;
pub mod health;
pub mod http;
pub mod scheduler;
pub mod state;
pub mod transport;
