//! HTTP surface for deep research threads.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
