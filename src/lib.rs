//! Resilient Postgres client leasing for serverless execution environments.
//!
//! Serverless runtimes (Lambda, Cloud Functions, edge workers) freeze and
//! resume processes without warning, which leaves ordinary connection pools
//! holding sockets the database thinks are idle-but-alive and the runtime
//! will never touch again -- a zombie connection. This crate labels every
//! session with a signed, self-expiring lease embedded in
//! `application_name`, heartbeats it while in use, and runs a distributed
//! reaper that verifies and terminates expired zombies from any instance
//! that happens to win a Postgres advisory lock.
//!
//! The [`Client`] is the main entry point; [`Config`] controls leasing,
//! retry, and heartbeat behavior.

pub mod client;
pub mod config;
pub mod error;
pub mod hooks;
pub mod lease;
pub mod reaper;
pub mod retry;
pub mod session;

pub use client::Client;
pub use config::{Config, ConfigBuilder, HeartbeatErrorMode, LeaseMode, ProbabilityGating, ReaperErrorMode};
pub use error::{Error, ErrorMeta};
pub use hooks::{Hooks, NoopHooks, SharedHooks, TracingHooks};
pub use lease::{LeaseManager, ParsedLease};
pub use reaper::Reaper;
pub use session::{PgSessionConnector, Session, SessionConnector, SessionEvent};
