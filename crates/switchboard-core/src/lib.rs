//! # switchboard-core
//!
//! Provider, session and transport layer for AI coding agents.
//!
//! Three structurally different backends sit behind one contract:
//! - Claude, driven through its stream-json stdio protocol
//! - Codex, a persistent JSON-RPC `app-server` shared by many sessions
//! - OpenCode, a plain interactive CLI
//!
//! ## Key Concepts
//!
//! - **Provider**: a backend, looked up by name in the [`ProviderRegistry`]
//! - **Headless session**: a message-stream conversation ([`HeadlessSession`])
//! - **Interactive session**: a CLI running in a PTY ([`InteractiveSession`])
//! - **Server manager**: ref-counted owner of the shared app-server process
//!
//! ```ignore
//! use switchboard_core::{HeadlessSpawnOptions, ProviderRegistry, ProvidersConfig};
//!
//! let registry = ProviderRegistry::with_builtin_providers(&ProvidersConfig::default())?;
//! let provider = registry.get_or_throw("codex")?;
//! let session = provider
//!     .spawn_headless(HeadlessSpawnOptions::new("/path/to/repo").initial_prompt("Run the tests"))
//!     .await?;
//! while let Some(message) = session.recv().await {
//!     println!("{:?}: {:?}", message.kind, message.content);
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod providers;
pub mod queue;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod session;
pub mod shell;
pub mod spawn;

// Re-export commonly used types
pub use config::{AgentProviderConfig, HeadlessSpawnOptions, InteractiveSpawnOptions, ProvidersConfig};
pub use error::ProviderError;
pub use message::{AgentMessage, AgentMessageType, ToolInfo};
pub use providers::{AgentProvider, ModelInfo, ProviderCapabilities};
pub use queue::MessageQueue;
pub use registry::ProviderRegistry;
pub use server::ServerManager;
pub use session::{HeadlessSession, InteractiveSession, PtyEvent};
