//! hostshell: an MCP server that exposes the host machine to LLM agents.
//!
//! The daemon accepts structured tool calls over MCP stdio, executes them
//! against the host (processes, filesystem, search), and streams results back
//! while a permission boundary keeps the agent inside allowed directories and
//! away from destructive commands.
//!
//! Core layering, leaves first: [`paths`] and [`policy`] gate every path and
//! command; [`detect`] classifies child output; [`store`] owns live process
//! sessions and the one blocking read primitive; [`exec`] drives children
//! through the early-exit protocol; [`search`] does the same for streaming
//! file-name/content search; [`server`] is the single tool surface on top.

pub mod config;
pub mod detect;
pub mod error;
pub mod exec;
pub mod fsops;
pub mod paths;
pub mod policy;
pub mod search;
pub mod server;
pub mod store;
