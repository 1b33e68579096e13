//! Charla is a terminal chat client for a self-hosted bot API.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the session transcript, the exchange state machine, and
//!   the incremental response-stream decoder that turns raw transport chunks
//!   into reply fragments.
//! - [`auth`] talks to the backend's account endpoints and persists the
//!   bearer token in the system keyring.
//! - [`ui`] runs the interactive line-oriented chat loop.
//! - [`api`] defines the wire payloads shared by the above.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod auth;
pub mod cli;
pub mod core;
pub mod ui;
pub mod utils;
