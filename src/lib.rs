//! Bonus allocation service library crate.
//!
//! This crate exposes the bonus allocation engine and its HTTP/CRM
//! surroundings as reusable modules.  External applications may depend on
//! the `bonus_engine` crate and call [`engine::allocate`] directly, or
//! embed the whole API via [`api::build_router`].

pub mod api;
pub mod config;
pub mod credentials;
pub mod crm;
pub mod engine;
pub mod logging;
pub mod models;
