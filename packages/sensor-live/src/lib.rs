pub mod config;
pub mod multiplexer;
pub mod pull;
pub mod scheduler;
pub mod services;
pub mod sse;
pub mod synchronizer;
pub mod traits;
pub mod types;

pub use config::{ConfigError, LiveConfig};
pub use multiplexer::{ConnectionMultiplexer, Handler, Subscription};
pub use pull::{FetchAndApply, HttpPull};
pub use scheduler::{
    LogNotifier, RefreshController, RefreshPhase, RefreshPolicy, RefreshScheduler, RefreshState,
};
pub use services::LiveServices;
pub use sse::{SseDecoder, SseFrame, SseTransport};
pub use synchronizer::{format_value, SensorSynchronizer, SharedSynchronizer};
pub use traits::*;
pub use types::*;
