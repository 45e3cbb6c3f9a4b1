//! DComm agent: configuration, logging, built-in protocols and the poll
//! loop that ties transports, dispatch and the interaction store together.
//!
//! ```no_run
//! use std::sync::Arc;
//! use dcomm_agent::{Agent, AgentConfig};
//!
//! # async fn demo() -> dcomm_core::DcommResult<()> {
//! let config = AgentConfig::load(None)?;
//! let agent = Arc::new(Agent::new(config)?);
//! agent.run().await
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod protocols;
pub mod runtime;

pub use config::{AgentConfig, LogFormat, LoggingConfig, PollConfig, StoreConfig, Unroutable};
pub use logging::init_logging;
pub use protocols::builtin_registry;
pub use runtime::Agent;
