//! Library crate for port-checker: assert that TCP ports on a host are
//! opened or closed, with bounded retries per port.
pub mod checker;
pub mod error;
pub mod ports;
pub mod probe;
pub mod scanner;
pub mod server;
pub mod types;
