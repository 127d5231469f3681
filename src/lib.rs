// src/lib.rs

// Import the top-level `council` module.
pub mod council;

// Re-exporting key items for easier external access.
pub use council::config::{CouncilConfig, CredentialPatch, CredentialStore};
pub use council::event::{CouncilEvent, EventHandler};
pub use council::orchestrator::Council;
pub use council::providers::{CompletionResult, ProviderAdapter, ProviderKind};
pub use council::state::{AgentId, AgentProfile, Message, Source, TokenUsage};

/// Initialise `env_logger` once for binaries, examples, and tests.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(false).try_init();
}
