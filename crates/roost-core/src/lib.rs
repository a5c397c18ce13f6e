// ABOUTME: Core library for roost - store, engine, relay, coordinator
// ABOUTME: Shared by every front-end (terminal, web, CLI) that drives assistant sessions

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod registry;
pub mod relay;
pub mod store;
pub mod types;

pub use config::{Config, CoordinatorConfig, EngineConfig};
pub use coordinator::SessionCoordinator;
pub use engine::EngineProcess;
pub use error::{Result, RoostError};
pub use registry::{ExtensionInfo, ExtensionRegistry};
pub use relay::{StreamRelay, Subscription};
pub use store::{History, SessionStore};
pub use types::{
    EngineState, LockRecord, Message, ProviderSnapshot, RelayEvent, Role, SendReceipt, Session,
    SessionDefaults, SessionSummary, SessionView, TokenEvent,
};
