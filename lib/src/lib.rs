//! # Qube provisioning engine
//!
//! Installs third-party templates, unikernels and installer media into a
//! Qubes OS system.  Each installation is compiled into a [`step::Workflow`]
//! of shell fragments; every network download happens in a disposable
//! worker qube which the workflow creates first and destroys last.
//!
//! The main pieces are the [`catalog`] of installations, the script
//! generators in [`generate`], the worker lifecycle in [`sandbox`], the
//! [`executor`] streaming output into a [`console`], and background qube
//! creation in [`provision`].

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod admin;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod console;
pub mod executor;
pub mod generate;
pub mod provision;
pub mod sandbox;
pub mod step;
mod utils;
