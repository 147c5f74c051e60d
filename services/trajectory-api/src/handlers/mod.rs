//! HTTP request handlers.

pub mod flight;
pub mod health;
