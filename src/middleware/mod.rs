//! Middleware module - caller identification

pub mod auth;

pub use auth::{AuthLayer, Caller};
