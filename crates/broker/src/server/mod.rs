//! MCP-facing endpoint and session transports.

pub mod broker;
pub mod session;

pub use broker::{BrokerServer, Session};
pub use session::{run_session, SessionExit};
