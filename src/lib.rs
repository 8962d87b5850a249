//! Bridge that lets external interpreter processes call methods on
//! in-process receivers over a line-oriented JSON-RPC protocol.

pub mod config;
pub mod facades;
pub mod launcher;
pub mod logging;
pub mod rpc;
