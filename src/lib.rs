//! Chat platform backend: a resumable websocket gateway plus the REST
//! surface that feeds it.

#![warn(clippy::pedantic, clippy::nursery)]
// @formatter:off
#![allow(
    clippy::module_name_repetitions,
    clippy::struct_excessive_bools,
    clippy::wildcard_imports,
    clippy::enum_glob_use,
    clippy::default_trait_access,
    clippy::match_same_arms,
    clippy::must_use_candidate,
    clippy::option_if_let_else,
    clippy::cast_possible_truncation,
    // pedantic
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    // nursery
    clippy::missing_const_for_fn,
)]
// @formatter:on

#[macro_use]
extern crate bitflags;

pub use state::ChatState;

#[macro_use]
mod macros;
mod serde_utils;

pub mod cache;
pub mod config;
pub mod gateway;
pub mod http;
pub mod model;
pub mod repo;
pub mod state;
pub mod utils;
