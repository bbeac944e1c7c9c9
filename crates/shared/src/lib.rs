//! EduPulse Shared Types and Utilities
//!
//! This crate contains the domain types, errors, and database helpers shared by the
//! EduPulse messaging service.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
