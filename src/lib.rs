pub mod config;
pub mod dispatcher;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod service;
pub mod state_machine;
pub mod storage;
pub mod time;

pub use config::EngineConfig;
pub use dispatcher::{DispatchEvent, EventDispatcher, EventHandler, ScopedDispatcher, SubscriptionToken};
pub use pipeline::{Pipeline, ProcessError, ProcessingResult};
pub use provider::{ProviderAdapter, ProviderRegistry};
pub use service::{ServiceError, TransactionService};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use time::{DefaultTime, Time};
