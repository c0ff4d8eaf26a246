#![allow(clippy::enum_variant_names)]

//! In-memory mirror of watched filesystem subtrees.
//!
//! A [`tree::Mirror`] keeps a hierarchical model of registered roots
//! consistent with the real filesystem, distinguishing changes this process
//! performed itself (through [`io::IoFacility`]) from changes detected
//! externally (through a [`monitor::DirectoryWatcher`] driven by a
//! [`monitor::Monitor`]). Consumers observe the tree plus three
//! change-notification channels and one error channel, each event tagged
//! with the initiator that caused it.

pub mod application;
pub mod cli;
pub mod config;
pub mod ext;
pub mod io;
pub mod monitor;
pub mod snapshot;
pub mod tree;
