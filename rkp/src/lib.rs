pub mod agent;
pub mod config;
pub mod events;
pub mod oom;
pub mod paths;
pub mod presence;
pub mod reaper;
pub mod service;
pub mod store;
pub mod supervisor;

// re-export selected public API
pub use agent::AppAgent;
pub use presence::{AppPresence, PresenceError};
pub use reaper::NodeReaper;
pub use service::ServicePresence;
pub use store::{CoordinationStore, StoreError};
