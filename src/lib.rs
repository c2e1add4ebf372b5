//! # a3s-sync
//!
//! Real-time conversation state synchronization for chat clients driving
//! an AI coding backend.
//!
//! ## Overview
//!
//! `a3s-sync` keeps a local mirror of sessions and messages consistent
//! with a backend that streams incremental updates. Actions (start, list,
//! create, send, abort) go through an [`ActionGateway`]; their effects come
//! back as events on an [`EventTransport`] and are reconciled into the
//! local stores.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_sync::{MemoryBackend, MemoryTransport, Synchronizer};
//!
//! # async fn example() -> a3s_sync::Result<()> {
//! let transport = MemoryTransport::new();
//! let backend = Arc::new(MemoryBackend::new(transport.clone()));
//! let sync = Synchronizer::new(backend, Arc::new(transport));
//!
//! sync.start_server().await?;
//! let session = sync.create_session().await?;
//! sync.load_session(&session.id).await?;
//! sync.send_message("Explain this repo", "claude", "anthropic").await?;
//!
//! // Apply whatever the backend streamed back
//! sync.drain().await;
//! println!("{} messages", sync.messages().await.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **ActionGateway** trait: request/response calls to the backend
//! - **EventTransport** trait: topic subscriptions delivering events
//! - **ChannelManager**: owns subscription handles; one scoped set at a time
//! - **SyncContext**: stores, liveness flag, single dispatch point
//! - **Synchronizer**: high-level API tying the above together
//! - **bridge**: decodes the backend's SSE stream onto a transport

pub mod backlog;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod gateway;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod types;

// Re-export core types
pub use channel::{ChannelManager, EventTransport, SubscribeReport, Subscription};
pub use config::{BackgroundPolicy, SyncConfig};
pub use context::{ConnectionState, Disposition, IgnoreReason, ObserverId, SyncSnapshot};
pub use error::{ActionError, ChannelError, Result};
pub use event::{Delivery, DeliverySink, SyncEvent, Topic, TopicKind};
pub use gateway::ActionGateway;
pub use reconcile::{merge_part, reconcile, PartMerge};
pub use sync::Synchronizer;
pub use types::{
    ChatRequest, FilePart, Message, Part, Role, ServerInfo, ServerStatus, Session, TextPart,
    ToolInvocationPart, ToolState, UserMessagePart,
};

// Re-export in-memory implementations for convenience
pub use channel::memory::MemoryTransport;
pub use gateway::memory::{BackendAction, MemoryBackend};
