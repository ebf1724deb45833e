//! Minimal chat relay: a registry server hands out unique screen names and
//! publishes the member directory, while participants exchange chat lines
//! directly over UDP.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`wire`] encodes and decodes the newline-terminated text protocol and
//!   reads framed lines from async streams.
//! - [`directory`] is the lock-guarded set of current members.
//! - [`announce`] fans events out to a directory snapshot over UDP.
//! - [`server`] accepts control connections and drives each participant's
//!   handshake and exit.
//! - [`client`] holds a participant's session and runs its send and receive
//!   loops.
//!
//! Integration and unit tests use this crate directly to exercise the
//! registry state machine and wire protocol.

pub mod announce;
pub mod cli;
pub mod client;
pub mod directory;
pub mod error;
pub mod server;
pub mod wire;
