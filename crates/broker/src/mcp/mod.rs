//! MCP core: downstream clients, pool supervision, and tool aggregation.
//!
//! # Architecture
//!
//! ```text
//! AI client --> broker session --> aggregator --> downstream client 1 (child process)
//!                                             --> downstream client 2 (child process)
//!                                             --> downstream client N (...)
//! ```
//!
//! Each downstream client is a sequential actor over one child process; the
//! manager supervises the pool; the aggregator builds the unified catalog
//! and routes calls by exposed name.

pub mod aggregator;
pub mod downstream;
pub mod manager;
pub mod types;

pub use aggregator::{AggregatorError, ToolAggregator};
pub use downstream::{ClientState, DownstreamClient, DownstreamError};
pub use manager::{ClientManager, ManagerError, SupervisorSettings};
pub use types::*;
