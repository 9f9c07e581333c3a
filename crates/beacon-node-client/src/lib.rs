//! # Beacon Node Client
//!
//! Node agents backed by a real beacon node binary.
//!
//! - [`ProcessNode`] drives one node through the binary's command line and
//!   control port
//! - [`ProcessNodeFactory`] provisions process nodes on free local ports
//! - [`HttpPublicApi`] queries the public HTTP API served by each node

pub mod http;
pub mod process;

pub use http::HttpPublicApi;
pub use process::{ProcessNode, ProcessNodeFactory};
