//! Typed requests and their execution.
//!
//! Tool parameters are validated into a [`Request`] before anything touches
//! the network. [`FtpServer::respond`] runs a request and renders the single
//! JSON outcome the calling agent sees.

use crate::FtpServer;
use crate::endpoint::ConnectParams;
use crate::error::{ToolError, ToolResult};
use crate::listing::{ListMode, RemoteEntry};
use crate::recursive::{
    RecursiveOptions, RecursiveResult, copy_recursive, delete_recursive, move_recursive,
};
use crate::registry::{SessionInfo, worker_failed};
use crate::session::{FileContent, Session};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A validated tool call.
#[derive(Debug)]
pub enum Request {
    Connect(ConnectParams),
    Disconnect { session_id: String },
    List {
        session_id: String,
        path: Option<String>,
        mode: ListMode,
    },
    RetrieveFile {
        session_id: String,
        remote_path: String,
        local_path: PathBuf,
    },
    ReadFile {
        session_id: String,
        remote_path: String,
        max_bytes: Option<u64>,
    },
    StoreFile {
        session_id: String,
        local_path: PathBuf,
        remote_path: String,
    },
    StoreFileUnique {
        session_id: String,
        local_path: PathBuf,
    },
    MakeDirectory { session_id: String, path: String },
    ChangeDirectory { session_id: String, path: String },
    ChangeToParent { session_id: String },
    PrintWorkingDirectory { session_id: String },
    RemoveDirectory {
        session_id: String,
        path: String,
        recursive: bool,
        options: RecursiveOptions,
    },
    DeleteFile { session_id: String, path: String },
    Rename {
        session_id: String,
        from: String,
        to: String,
    },
    GetSize { session_id: String, path: String },
    DeleteRecursive {
        session_id: String,
        path: String,
        options: RecursiveOptions,
    },
    CopyRecursive {
        session_id: String,
        source: String,
        destination: String,
        options: RecursiveOptions,
    },
    MoveRecursive {
        session_id: String,
        source: String,
        destination: String,
        options: RecursiveOptions,
    },
    SendRawCommand { session_id: String, command: String },
    SendVoidCommand { session_id: String, command: String },
    AbortTransfer { session_id: String },
    SetPassive { session_id: String, enabled: bool },
    ListSessions,
    ListAllowedDirectories,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Connect(_) => "connect",
            Request::Disconnect { .. } => "disconnect",
            Request::List { .. } => "list",
            Request::RetrieveFile { .. } => "retrieve_file",
            Request::ReadFile { .. } => "read_file",
            Request::StoreFile { .. } => "store_file",
            Request::StoreFileUnique { .. } => "store_file_unique",
            Request::MakeDirectory { .. } => "make_directory",
            Request::ChangeDirectory { .. } => "change_directory",
            Request::ChangeToParent { .. } => "change_to_parent",
            Request::PrintWorkingDirectory { .. } => "print_working_directory",
            Request::RemoveDirectory { .. } => "remove_directory",
            Request::DeleteFile { .. } => "delete_file",
            Request::Rename { .. } => "rename",
            Request::GetSize { .. } => "get_size",
            Request::DeleteRecursive { .. } => "delete_recursive",
            Request::CopyRecursive { .. } => "copy_recursive",
            Request::MoveRecursive { .. } => "move_recursive",
            Request::SendRawCommand { .. } => "send_raw_command",
            Request::SendVoidCommand { .. } => "send_void_command",
            Request::AbortTransfer { .. } => "abort_transfer",
            Request::SetPassive { .. } => "set_passive",
            Request::ListSessions => "list_sessions",
            Request::ListAllowedDirectories => "list_allowed_directories",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Request::Connect(_) | Request::ListSessions | Request::ListAllowedDirectories => None,
            Request::Disconnect { session_id }
            | Request::List { session_id, .. }
            | Request::RetrieveFile { session_id, .. }
            | Request::ReadFile { session_id, .. }
            | Request::StoreFile { session_id, .. }
            | Request::StoreFileUnique { session_id, .. }
            | Request::MakeDirectory { session_id, .. }
            | Request::ChangeDirectory { session_id, .. }
            | Request::ChangeToParent { session_id }
            | Request::PrintWorkingDirectory { session_id }
            | Request::RemoveDirectory { session_id, .. }
            | Request::DeleteFile { session_id, .. }
            | Request::Rename { session_id, .. }
            | Request::GetSize { session_id, .. }
            | Request::DeleteRecursive { session_id, .. }
            | Request::CopyRecursive { session_id, .. }
            | Request::MoveRecursive { session_id, .. }
            | Request::SendRawCommand { session_id, .. }
            | Request::SendVoidCommand { session_id, .. }
            | Request::AbortTransfer { session_id }
            | Request::SetPassive { session_id, .. } => Some(session_id),
        }
    }
}

/// Validation of raw tool parameters into a [`Request`].
pub trait IntoRequest {
    fn into_request(self, allowed_dirs: &[PathBuf]) -> ToolResult<Request>;
}

/// Tool-specific part of a successful outcome.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Connected {
        session_id: String,
        host: String,
        port: u16,
        user: String,
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        welcome: Option<String>,
    },
    Disconnected {
        session_id: String,
        was_connected: bool,
    },
    Listing {
        path: String,
        mode: ListMode,
        entries: Vec<RemoteEntry>,
    },
    Transferred {
        remote_path: String,
        local_path: String,
        bytes: u64,
    },
    Content {
        remote_path: String,
        content: String,
        bytes: u64,
        truncated: bool,
    },
    StoredUnique {
        local_path: String,
        remote_name: String,
    },
    Cwd {
        cwd: String,
    },
    Path {
        action: &'static str,
        path: String,
    },
    Renamed {
        from: String,
        to: String,
    },
    Size {
        path: String,
        size: u64,
    },
    Recursive(RecursiveResult),
    Reply {
        code: u32,
        text: String,
    },
    AbortRequested {
        session_id: String,
        abort_requested: bool,
    },
    Passive {
        session_id: String,
        passive: bool,
    },
    Sessions {
        sessions: Vec<SessionInfo>,
    },
    AllowedDirectories {
        allowed_directories: Vec<String>,
    },
}

#[derive(Serialize)]
struct Success<'a> {
    status: &'static str,
    #[serde(flatten)]
    payload: &'a Payload,
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

impl FtpServer {
    /// Run a validated request. Exactly one outcome per call.
    pub(crate) async fn dispatch(&self, request: Request) -> ToolResult<Payload> {
        let registry = &self.registry;
        match request {
            Request::Connect(params) => {
                let connector = self.connector.clone();
                let passive = self.config.passive;
                let session = tokio::task::spawn_blocking(move || {
                    Session::open(connector.as_ref(), &params, passive)
                })
                .await
                .map_err(worker_failed)??;
                let host = session.host().to_string();
                let port = session.port();
                let user = session.user().to_string();
                let cwd = session.cwd().to_string();
                let welcome = session.welcome().map(str::to_string);
                let session_id = registry.create(session);
                Ok(Payload::Connected {
                    session_id,
                    host,
                    port,
                    user,
                    cwd,
                    welcome,
                })
            }
            Request::Disconnect { session_id } => {
                let was_connected = registry.disconnect(&session_id).await;
                Ok(Payload::Disconnected {
                    session_id,
                    was_connected,
                })
            }
            Request::List {
                session_id,
                path,
                mode,
            } => {
                let target = path.clone();
                let entries = registry
                    .run(&session_id, move |s, _| s.list(target.as_deref(), mode))
                    .await?;
                Ok(Payload::Listing {
                    path: path.unwrap_or_else(|| ".".to_string()),
                    mode,
                    entries,
                })
            }
            Request::RetrieveFile {
                session_id,
                remote_path,
                local_path,
            } => {
                let (remote, local) = (remote_path.clone(), local_path.clone());
                let bytes = registry
                    .run(&session_id, move |s, control| {
                        s.retrieve_file(&remote, &local, control)
                    })
                    .await?;
                Ok(Payload::Transferred {
                    remote_path,
                    local_path: display(&local_path),
                    bytes,
                })
            }
            Request::ReadFile {
                session_id,
                remote_path,
                max_bytes,
            } => {
                let remote = remote_path.clone();
                let limit = self.config.read_file_limit;
                let max_bytes = max_bytes.map_or(limit, |m| m.min(limit));
                let FileContent {
                    content,
                    bytes,
                    truncated,
                } = registry
                    .run(&session_id, move |s, control| {
                        s.read_file(&remote, max_bytes, control)
                    })
                    .await?;
                Ok(Payload::Content {
                    remote_path,
                    content,
                    bytes,
                    truncated,
                })
            }
            Request::StoreFile {
                session_id,
                local_path,
                remote_path,
            } => {
                let (remote, local) = (remote_path.clone(), local_path.clone());
                let bytes = registry
                    .run(&session_id, move |s, control| {
                        s.store_file(&local, &remote, control)
                    })
                    .await?;
                Ok(Payload::Transferred {
                    remote_path,
                    local_path: display(&local_path),
                    bytes,
                })
            }
            Request::StoreFileUnique {
                session_id,
                local_path,
            } => {
                let local = local_path.clone();
                let remote_name = registry
                    .run(&session_id, move |s, control| {
                        s.store_file_unique(&local, control)
                    })
                    .await?;
                Ok(Payload::StoredUnique {
                    local_path: display(&local_path),
                    remote_name,
                })
            }
            Request::MakeDirectory { session_id, path } => {
                let target = path.clone();
                registry
                    .run(&session_id, move |s, _| s.make_directory(&target))
                    .await?;
                Ok(Payload::Path {
                    action: "created",
                    path,
                })
            }
            Request::ChangeDirectory { session_id, path } => {
                let cwd = registry
                    .run(&session_id, move |s, _| s.change_directory(&path))
                    .await?;
                Ok(Payload::Cwd { cwd })
            }
            Request::ChangeToParent { session_id } => {
                let cwd = registry
                    .run(&session_id, |s, _| s.change_to_parent())
                    .await?;
                Ok(Payload::Cwd { cwd })
            }
            Request::PrintWorkingDirectory { session_id } => {
                let cwd = registry
                    .run(&session_id, |s, _| Ok(s.cwd().to_string()))
                    .await?;
                Ok(Payload::Cwd { cwd })
            }
            Request::RemoveDirectory {
                session_id,
                path,
                recursive: true,
                options,
            } => {
                let result = registry
                    .run(&session_id, move |s, _| {
                        Ok(delete_recursive(s, &path, options))
                    })
                    .await?;
                Ok(Payload::Recursive(result))
            }
            Request::RemoveDirectory {
                session_id, path, ..
            } => {
                let target = path.clone();
                registry
                    .run(&session_id, move |s, _| s.remove_directory(&target))
                    .await?;
                Ok(Payload::Path {
                    action: "removed",
                    path,
                })
            }
            Request::DeleteFile { session_id, path } => {
                let target = path.clone();
                registry
                    .run(&session_id, move |s, _| s.delete_file(&target))
                    .await?;
                Ok(Payload::Path {
                    action: "deleted",
                    path,
                })
            }
            Request::Rename {
                session_id,
                from,
                to,
            } => {
                let (old, new) = (from.clone(), to.clone());
                registry
                    .run(&session_id, move |s, _| s.rename(&old, &new))
                    .await?;
                Ok(Payload::Renamed { from, to })
            }
            Request::GetSize { session_id, path } => {
                let target = path.clone();
                let size = registry
                    .run(&session_id, move |s, _| s.size(&target))
                    .await?;
                Ok(Payload::Size { path, size })
            }
            Request::DeleteRecursive {
                session_id,
                path,
                options,
            } => {
                let result = registry
                    .run(&session_id, move |s, _| {
                        Ok(delete_recursive(s, &path, options))
                    })
                    .await?;
                Ok(Payload::Recursive(result))
            }
            Request::CopyRecursive {
                session_id,
                source,
                destination,
                options,
            } => {
                let result = registry
                    .run(&session_id, move |s, control| {
                        copy_recursive(s, &source, &destination, options, control)
                    })
                    .await?;
                Ok(Payload::Recursive(result))
            }
            Request::MoveRecursive {
                session_id,
                source,
                destination,
                options,
            } => {
                let result = registry
                    .run(&session_id, move |s, control| {
                        move_recursive(s, &source, &destination, options, control)
                    })
                    .await?;
                Ok(Payload::Recursive(result))
            }
            Request::SendRawCommand {
                session_id,
                command,
            } => {
                let reply = registry
                    .run(&session_id, move |s, _| s.raw_command(&command))
                    .await?;
                Ok(Payload::Reply {
                    code: reply.code,
                    text: reply.text,
                })
            }
            Request::SendVoidCommand {
                session_id,
                command,
            } => {
                let reply = registry
                    .run(&session_id, move |s, _| s.void_command(&command))
                    .await?;
                Ok(Payload::Reply {
                    code: reply.code,
                    text: reply.text,
                })
            }
            Request::AbortTransfer { session_id } => {
                registry.abort_transfer(&session_id)?;
                Ok(Payload::AbortRequested {
                    session_id,
                    abort_requested: true,
                })
            }
            Request::SetPassive {
                session_id,
                enabled,
            } => {
                registry
                    .run(&session_id, move |s, _| {
                        s.set_passive(enabled);
                        Ok(())
                    })
                    .await?;
                Ok(Payload::Passive {
                    session_id,
                    passive: enabled,
                })
            }
            Request::ListSessions => Ok(Payload::Sessions {
                sessions: registry.summaries(),
            }),
            Request::ListAllowedDirectories => Ok(Payload::AllowedDirectories {
                allowed_directories: self.config.allowed_dirs.iter().map(|d| display(d)).collect(),
            }),
        }
    }

    /// Validate-and-run wrapper used by every tool.
    pub(crate) async fn respond(&self, request: ToolResult<Request>) -> Result<String, String> {
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "rejected tool arguments");
                return Err(err.to_json());
            }
        };
        debug!(?request, "dispatching");
        let tool = request.name();
        let session_id = request.session_id().unwrap_or("-").to_string();
        match self.dispatch(request).await {
            Ok(payload) => {
                info!(tool, session_id = %session_id, "tool completed");
                serde_json::to_string_pretty(&Success {
                    status: "ok",
                    payload: &payload,
                })
                .map_err(|e| ToolError::Protocol(e.to_string()).to_json())
            }
            Err(err) => {
                warn!(
                    tool,
                    session_id = %session_id,
                    kind = ?err.kind(),
                    error = %err,
                    "tool failed"
                );
                Err(err.to_json())
            }
        }
    }
}
