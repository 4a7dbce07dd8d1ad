//! HTTP surface - submit, inspect and cancel generations

pub mod handlers;
pub mod routes;
pub mod types;

pub use routes::create_router;
