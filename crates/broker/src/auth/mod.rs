//! Authentication: JWT verification and per-session identity.

pub mod context;
pub mod jwt;

pub use context::{ClientContext, WILDCARD_TAG};
pub use jwt::{JwtError, JwtVerifier, TokenIssuer, VerifiedToken};
