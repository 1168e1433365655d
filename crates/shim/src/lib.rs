//! The transport shim: a stdio MCP server that translates line-delimited
//! JSON-RPC into a persistent WebSocket session against the daemon,
//! auto-starting the daemon when it is down and streaming progress back.

pub mod autostart;
pub mod bridge;
pub mod config;
pub mod mcp;
pub mod reconnect;
pub mod server;
