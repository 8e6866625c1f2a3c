// ============================================================================
// src/cmd/mod.rs – command subsystem root
// ============================================================================
pub mod base; // allowlisted runner (SystemRunner, Invocation, OutputData)

// Re-export common types for convenience:
pub use base::{
    pipe_checked, run_checked, CommandRunner, Invocation, OutputData, Privilege, SystemRunner,
};
