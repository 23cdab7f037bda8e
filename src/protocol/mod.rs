//! # Protocol Module
//!
//! This file is part of the crossplay-gateway project.
//!
//! It groups the in-game message plumbing: the subcommand table with its
//! three numbering sets, the router that translates and fans messages out,
//! and the handlers that interpret them against lobby state.
pub mod handlers;
pub mod router;
pub mod subcommands;
