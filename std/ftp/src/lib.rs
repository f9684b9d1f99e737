//! MCP server exposing FTP client sessions as tools.
//!
//! A caller opens a session with `connect`, receives an opaque handle and
//! passes it to every other tool. Sessions stay open until `disconnect` or
//! until the control connection drops. Local files touched by transfers
//! must live inside the directories configured at startup.

use crate::config::Config;
use crate::endpoint::Connector;
use crate::registry::Registry;
use rmcp::{
    ServerHandler,
    handler::server::router::tool::ToolRouter,
    model::{Implementation, ServerCapabilities, ServerInfo},
    tool_handler,
};
use std::sync::Arc;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod listing;
pub mod recursive;
pub mod registry;
pub mod session;
pub mod tools;
pub mod validate;
pub mod walker;

#[cfg(test)]
mod memory;

/// MCP FTP server holding every open session.
#[derive(Debug, Clone)]
pub struct FtpServer {
    pub(crate) registry: Arc<Registry>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) config: Arc<Config>,
    pub(crate) tool_router: ToolRouter<Self>,
}

impl FtpServer {
    /// The session registry, shared with clones of this server.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

#[tool_handler]
impl ServerHandler for FtpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "wmcp-ftp".into(),
                title: Some("Walrus MCP FTP Server".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            instructions: Some(
                "FTP client server. Call connect first and pass the returned session_id to the other tools."
                    .into(),
            ),
        }
    }
}
