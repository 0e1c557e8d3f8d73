#![forbid(unsafe_code)]

//! Video-metadata gateway in front of a messaging network.
//!
//! Videos posted by a fixed set of publishers are cached as they arrive,
//! searched across publishers on demand, and downloaded into a flat file
//! cache. [`gateway::Gateway`] ties the pieces together and [`http`] exposes
//! them.

pub mod cache;
pub mod client;
pub mod config;
pub mod download;
pub mod entities;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod http;
pub mod listener;
pub mod metadata;
pub mod mtproto;
pub mod search;
pub mod security;
pub mod session;

#[cfg(test)]
mod testing;
