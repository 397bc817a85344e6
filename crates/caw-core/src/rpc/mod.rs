//! RPC transports: JSON-RPC 2.0 over stdio and streamable HTTP.

pub mod http;
pub mod jsonrpc;
pub mod stdio;
