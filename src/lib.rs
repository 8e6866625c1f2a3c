//! Recovery-partition builder and device-lifecycle state machine for
//! installer hosts.
//!
//! A hosting installer drives [`orchestrator::RecoveryOrchestrator`] through
//! `prepare`, `commit_selection` and `cleanup` (or `cancel`); every change to
//! the disk goes through a [`cmd::CommandRunner`].

pub mod cmd;
pub mod config;
pub mod device;
pub mod error;
pub mod mode;
pub mod orchestrator;
pub mod plan;
pub mod reboot;
pub mod store;
pub mod swap;
pub mod ui;
pub mod util;
pub mod writer;

#[cfg(test)]
mod testutil;

pub use error::{RecoveryError, Result, Step};
pub use mode::RecoveryMode;
pub use orchestrator::{Prepared, RecoveryOrchestrator, RunConfig, Terminal};
