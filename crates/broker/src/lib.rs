//! MCP Broker Library
//!
//! A long-lived broker that connects to many downstream MCP servers as a
//! client and re-exports their tools through a single MCP endpoint.
//! Downstream processes are started exactly once and shared; every external
//! AI client gets its own session over the common pool, with JWT-backed
//! tag-based access control deciding which tools each session can see and
//! call.

pub mod auth;
pub mod config;
pub mod error;
pub mod mcp;
pub mod server;

pub use auth::{ClientContext, JwtVerifier, TokenIssuer};
pub use config::{BrokerConfig, ConfigError, ServerConfig};
pub use error::{BrokerError, BrokerResult};
pub use mcp::{ClientManager, SupervisorSettings, ToolAggregator};
pub use server::{run_session, BrokerServer, Session, SessionExit};
