//! Direct messaging API for the HanApp PH service marketplace.
//!
//! Clients and providers exchange messages over three HTTP operations:
//! create a message, list the caller's threads, and page through one thread.

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod entity;
pub mod error;
pub mod messaging;
pub mod store;
