//! AlphaFold archive file-system: serving stack and offline tooling.
//!
//! The binary in `main.rs` wires these modules to a CLI; the library
//! target exists so the serving stack can be driven end-to-end by the
//! integration tests.
pub mod db;
pub mod fs;
pub mod indexer;
pub mod mountctl;
pub mod reader;
pub mod resolver;
pub mod tar;
pub mod updatedb;

#[cfg(test)]
mod testutil;
