//! Authentication for sockets and REST handlers

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager, TokenType};
pub use middleware::{require_auth, AuthState, AuthUser};
