//! lazy-upstream - on-demand supervision of a server process behind a
//! reverse-proxy upstream.
//!
//! A [`ProcessSupervisor`] owns one external server process per logical site:
//! it starts the process the first time traffic needs it, hands out the
//! loopback address to dial, and stops the process again once no activity has
//! been recorded for the configured idle timeout. Crashes are detected by a
//! background wait task and surface only as "not running" to the next caller.
//!
//! The reverse-proxy host talks to the crate through [`LazyUpstream`]:
//! `ensure_running()` once per inbound request, `shutdown()` on teardown.
//! `ensure_running()` blocks on a cold start (preparation step, port
//! allocation, spawn) and returns as soon as the process handle exists; it
//! does not wait for the server to accept connections, so callers should
//! retry dialing briefly after a cold start.

pub mod activity;
pub mod config;
pub mod errors;
mod monitor;
pub mod port;
pub mod state;
pub mod supervisor;
pub mod upstream;

pub use crate::activity::ActivityTracker;
pub use crate::config::UpstreamConfig;
pub use crate::errors::SupervisorError;
pub use crate::state::{ProcessState, SupervisorStatus};
pub use crate::supervisor::ProcessSupervisor;
pub use crate::upstream::LazyUpstream;
