pub mod agent_loop;
pub mod config;
pub mod gateway;
pub mod spin;
pub mod tier;
pub mod tracing_setup;

pub use agent_loop::{AgentLoop, LoopOutcome, LoopSettings};
pub use config::Config;
pub use gateway::{Gateway, GatewayOptions, Reply};
pub use tier::{TierConfig, TierTable};
