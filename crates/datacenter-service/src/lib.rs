//! Data center service.
//!
//! This crate wires the core runtime into a runnable process: it owns the
//! [`service::DataCenterService`] context, registers the built-in modules,
//! serves the HTTP control surface and ships a small client for the CLI.
//!
//! # Components
//!
//! - `api`: HTTP endpoints and the live log stream
//! - `cli`: Command-line interface
//! - `client`: HTTP client and the reconnecting log follower
//! - `modules`: built-in infrastructure modules
//! - `service`: the context object shared with the HTTP layer

pub mod api;
pub mod cli;
pub mod client;
pub mod modules;
pub mod service;
