//! Tool implementations for the FTP MCP server.

use crate::FtpServer;
use crate::client::SuppaConnector;
use crate::config::Config;
use crate::dispatch::{IntoRequest, Request};
use crate::endpoint::{ConnectParams, Connector};
use crate::error::{ToolError, ToolResult};
use crate::listing::ListMode;
use crate::recursive::RecursiveOptions;
use crate::registry::Registry;
use crate::validate::{canonicalize_dirs, raw_command, remote_path, session_handle, validate_path};
use rmcp::{
    handler::server::wrapper::Parameters,
    schemars::{self, JsonSchema},
    tool, tool_router,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Parameters for opening a session.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ConnectServerParams {
    /// Server host name or IP address.
    pub host: String,
    /// Control port, 21 when omitted.
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
}

/// Parameters for tools that only need a session.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionParams {
    /// Handle returned by `connect`.
    pub session_id: String,
}

/// Parameters for listing a remote directory.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListParams {
    pub session_id: String,
    /// Directory to list; the working directory when omitted.
    pub path: Option<String>,
    /// `default` (LIST), `names_only` (NLST) or `machine_readable` (MLSD).
    pub mode: Option<ListMode>,
}

/// Parameters for downloading a file.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RetrieveFileParams {
    pub session_id: String,
    pub remote_path: String,
    /// Local destination, inside an allowed directory. Overwritten if present.
    pub local_path: String,
}

/// Parameters for reading a remote file into the response.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileParams {
    pub session_id: String,
    pub remote_path: String,
    /// Maximum bytes to return; capped by the server's read limit.
    pub max_bytes: Option<u64>,
}

/// Parameters for uploading a file.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct StoreFileParams {
    pub session_id: String,
    /// Local source, inside an allowed directory.
    pub local_path: String,
    /// Remote destination; defaults to the local file name.
    pub remote_path: Option<String>,
}

/// Parameters for uploading under a server-chosen name.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct StoreFileUniqueParams {
    pub session_id: String,
    pub local_path: String,
}

/// Parameters for creating a remote directory.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct MakeDirectoryParams {
    pub session_id: String,
    pub path: String,
}

/// Parameters for changing the working directory.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ChangeDirectoryParams {
    pub session_id: String,
    pub path: String,
}

/// Parameters for removing a remote directory.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RemoveDirectoryParams {
    pub session_id: String,
    pub path: String,
    /// Remove the directory and everything below it.
    pub recursive: Option<bool>,
    /// With `recursive`, stop at the first failure.
    pub fail_fast: Option<bool>,
}

/// Parameters for deleting a remote file.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteFileParams {
    pub session_id: String,
    pub path: String,
}

/// Parameters for renaming a remote file or directory.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RenameParams {
    pub session_id: String,
    pub from: String,
    pub to: String,
}

/// Parameters for querying a file's size.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetSizeParams {
    pub session_id: String,
    pub path: String,
}

/// Parameters for deleting a remote tree.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteRecursiveParams {
    pub session_id: String,
    pub path: String,
    /// Stop at the first failure instead of continuing with siblings.
    pub fail_fast: Option<bool>,
}

/// Parameters for copying or moving a remote tree.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct TransferTreeParams {
    pub session_id: String,
    pub source: String,
    /// Must not lie inside `source`.
    pub destination: String,
    /// Stop at the first failure instead of continuing with siblings.
    pub fail_fast: Option<bool>,
}

/// Parameters for sending a raw protocol command.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CommandParams {
    pub session_id: String,
    /// One command line, e.g. `SYST` or `SITE CHMOD 644 file`.
    pub command: String,
}

/// Parameters for switching data connection mode.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SetPassiveParams {
    pub session_id: String,
    /// `true` for passive, `false` for active mode.
    pub enabled: bool,
}

fn fail_fast(flag: Option<bool>) -> RecursiveOptions {
    RecursiveOptions {
        fail_fast: flag.unwrap_or(false),
    }
}

impl IntoRequest for ConnectServerParams {
    fn into_request(self, _: &[PathBuf]) -> ToolResult<Request> {
        let host = remote_path(self.host.trim(), "host")?;
        let user = remote_path(&self.user, "user")?;
        if self.password.contains(['\r', '\n', '\0']) {
            return Err(ToolError::InvalidArgument(
                "password must be a single line".into(),
            ));
        }
        let port = match self.port {
            Some(0) => return Err(ToolError::InvalidArgument("port must not be 0".into())),
            Some(port) => port,
            None => 21,
        };
        Ok(Request::Connect(ConnectParams {
            host,
            port,
            user,
            password: self.password,
        }))
    }
}

impl SessionParams {
    fn into_request(self, build: fn(String) -> Request) -> ToolResult<Request> {
        Ok(build(session_handle(&self.session_id)?))
    }
}

impl IntoRequest for ListParams {
    fn into_request(self, _: &[PathBuf]) -> ToolResult<Request> {
        Ok(Request::List {
            session_id: session_handle(&self.session_id)?,
            path: self.path.map(|p| remote_path(&p, "path")).transpose()?,
            mode: self.mode.unwrap_or_default(),
        })
    }
}

impl IntoRequest for RetrieveFileParams {
    fn into_request(self, allowed_dirs: &[PathBuf]) -> ToolResult<Request> {
        Ok(Request::RetrieveFile {
            session_id: session_handle(&self.session_id)?,
            remote_path: remote_path(&self.remote_path, "remote_path")?,
            local_path: validate_path(&self.local_path, allowed_dirs)?,
        })
    }
}

impl IntoRequest for ReadFileParams {
    fn into_request(self, _: &[PathBuf]) -> ToolResult<Request> {
        if self.max_bytes == Some(0) {
            return Err(ToolError::InvalidArgument("max_bytes must be positive".into()));
        }
        Ok(Request::ReadFile {
            session_id: session_handle(&self.session_id)?,
            remote_path: remote_path(&self.remote_path, "remote_path")?,
            max_bytes: self.max_bytes,
        })
    }
}

impl IntoRequest for StoreFileParams {
    fn into_request(self, allowed_dirs: &[PathBuf]) -> ToolResult<Request> {
        let session_id = session_handle(&self.session_id)?;
        let local_path = validate_path(&self.local_path, allowed_dirs)?;
        let remote = match self.remote_path {
            Some(path) => remote_path(&path, "remote_path")?,
            None => local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| ToolError::InvalidArgument("local_path has no file name".into()))?,
        };
        Ok(Request::StoreFile {
            session_id,
            local_path,
            remote_path: remote,
        })
    }
}

impl IntoRequest for StoreFileUniqueParams {
    fn into_request(self, allowed_dirs: &[PathBuf]) -> ToolResult<Request> {
        Ok(Request::StoreFileUnique {
            session_id: session_handle(&self.session_id)?,
            local_path: validate_path(&self.local_path, allowed_dirs)?,
        })
    }
}

impl IntoRequest for MakeDirectoryParams {
    fn into_request(self, _: &[PathBuf]) -> ToolResult<Request> {
        Ok(Request::MakeDirectory {
            session_id: session_handle(&self.session_id)?,
            path: remote_path(&self.path, "path")?,
        })
    }
}

impl IntoRequest for ChangeDirectoryParams {
    fn into_request(self, _: &[PathBuf]) -> ToolResult<Request> {
        Ok(Request::ChangeDirectory {
            session_id: session_handle(&self.session_id)?,
            path: remote_path(&self.path, "path")?,
        })
    }
}

impl IntoRequest for RemoveDirectoryParams {
    fn into_request(self, _: &[PathBuf]) -> ToolResult<Request> {
        Ok(Request::RemoveDirectory {
            session_id: session_handle(&self.session_id)?,
            path: remote_path(&self.path, "path")?,
            recursive: self.recursive.unwrap_or(false),
            options: fail_fast(self.fail_fast),
        })
    }
}

impl IntoRequest for DeleteFileParams {
    fn into_request(self, _: &[PathBuf]) -> ToolResult<Request> {
        Ok(Request::DeleteFile {
            session_id: session_handle(&self.session_id)?,
            path: remote_path(&self.path, "path")?,
        })
    }
}

impl IntoRequest for RenameParams {
    fn into_request(self, _: &[PathBuf]) -> ToolResult<Request> {
        Ok(Request::Rename {
            session_id: session_handle(&self.session_id)?,
            from: remote_path(&self.from, "from")?,
            to: remote_path(&self.to, "to")?,
        })
    }
}

impl IntoRequest for GetSizeParams {
    fn into_request(self, _: &[PathBuf]) -> ToolResult<Request> {
        Ok(Request::GetSize {
            session_id: session_handle(&self.session_id)?,
            path: remote_path(&self.path, "path")?,
        })
    }
}

impl IntoRequest for DeleteRecursiveParams {
    fn into_request(self, _: &[PathBuf]) -> ToolResult<Request> {
        Ok(Request::DeleteRecursive {
            session_id: session_handle(&self.session_id)?,
            path: remote_path(&self.path, "path")?,
            options: fail_fast(self.fail_fast),
        })
    }
}

impl TransferTreeParams {
    fn into_parts(self) -> ToolResult<(String, String, String, RecursiveOptions)> {
        Ok((
            session_handle(&self.session_id)?,
            remote_path(&self.source, "source")?,
            remote_path(&self.destination, "destination")?,
            fail_fast(self.fail_fast),
        ))
    }
}

impl SetPassiveParams {
    fn into_request(self) -> ToolResult<Request> {
        Ok(Request::SetPassive {
            session_id: session_handle(&self.session_id)?,
            enabled: self.enabled,
        })
    }
}

impl CommandParams {
    fn into_parts(self) -> ToolResult<(String, String)> {
        Ok((session_handle(&self.session_id)?, raw_command(&self.command)?))
    }
}

#[tool_router]
impl FtpServer {
    /// Create a server that connects over real FTP.
    pub fn new(config: Config) -> Self {
        let connector = Arc::new(SuppaConnector::new(config.connect_timeout));
        Self::with_connector(config, connector)
    }

    /// Create a server that opens sessions through `connector`.
    pub fn with_connector(mut config: Config, connector: Arc<dyn Connector>) -> Self {
        config.allowed_dirs = canonicalize_dirs(config.allowed_dirs);
        Self {
            registry: Arc::new(Registry::new(config.busy_policy)),
            connector,
            config: Arc::new(config),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Connect and log in to an FTP server. Returns a session_id used by every other tool"
    )]
    async fn connect(
        &self,
        Parameters(params): Parameters<ConnectServerParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(description = "Close an FTP session. Unknown session ids are not an error")]
    async fn disconnect(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(|session_id| Request::Disconnect { session_id }))
            .await
    }

    #[tool(
        description = "List a remote directory. mode is default (LIST), names_only (NLST) or machine_readable (MLSD)"
    )]
    async fn list(&self, Parameters(params): Parameters<ListParams>) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(description = "Download a remote file to a local path inside the allowed directories")]
    async fn retrieve_file(
        &self,
        Parameters(params): Parameters<RetrieveFileParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(description = "Return the contents of a remote file as text, up to max_bytes")]
    async fn read_file(
        &self,
        Parameters(params): Parameters<ReadFileParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(
        description = "Upload a local file. remote_path defaults to the local file name; existing remote files are overwritten"
    )]
    async fn store_file(
        &self,
        Parameters(params): Parameters<StoreFileParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(description = "Upload a local file under a unique name chosen by the server (STOU)")]
    async fn store_file_unique(
        &self,
        Parameters(params): Parameters<StoreFileUniqueParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(description = "Create a remote directory")]
    async fn make_directory(
        &self,
        Parameters(params): Parameters<MakeDirectoryParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(description = "Change the session's remote working directory")]
    async fn change_directory(
        &self,
        Parameters(params): Parameters<ChangeDirectoryParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(description = "Move the session's working directory up one level")]
    async fn change_to_parent(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(|session_id| Request::ChangeToParent { session_id }))
            .await
    }

    #[tool(description = "Show the session's remote working directory")]
    async fn print_working_directory(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<String, String> {
        self.respond(
            params.into_request(|session_id| Request::PrintWorkingDirectory { session_id }),
        )
        .await
    }

    #[tool(
        description = "Remove a remote directory. Fails on non-empty directories unless recursive is true"
    )]
    async fn remove_directory(
        &self,
        Parameters(params): Parameters<RemoveDirectoryParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(description = "Delete a single remote file")]
    async fn delete_file(
        &self,
        Parameters(params): Parameters<DeleteFileParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(description = "Rename or move a remote file or directory")]
    async fn rename(&self, Parameters(params): Parameters<RenameParams>) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(description = "Get the size of a remote file in bytes")]
    async fn get_size(
        &self,
        Parameters(params): Parameters<GetSizeParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(
        description = "Delete a remote directory tree bottom-up. Reports every node that could not be removed"
    )]
    async fn delete_recursive(
        &self,
        Parameters(params): Parameters<DeleteRecursiveParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(&self.config.allowed_dirs))
            .await
    }

    #[tool(
        description = "Copy a remote tree to another remote path on the same server. Files are relayed through memory"
    )]
    async fn copy_recursive(
        &self,
        Parameters(params): Parameters<TransferTreeParams>,
    ) -> Result<String, String> {
        let request = params
            .into_parts()
            .map(|(session_id, source, destination, options)| Request::CopyRecursive {
                session_id,
                source,
                destination,
                options,
            });
        self.respond(request).await
    }

    #[tool(
        description = "Move a remote tree: copy each entry, then delete the source once its copy exists"
    )]
    async fn move_recursive(
        &self,
        Parameters(params): Parameters<TransferTreeParams>,
    ) -> Result<String, String> {
        let request = params
            .into_parts()
            .map(|(session_id, source, destination, options)| Request::MoveRecursive {
                session_id,
                source,
                destination,
                options,
            });
        self.respond(request).await
    }

    #[tool(description = "Send a raw FTP command and return the server reply")]
    async fn send_raw_command(
        &self,
        Parameters(params): Parameters<CommandParams>,
    ) -> Result<String, String> {
        let request = params
            .into_parts()
            .map(|(session_id, command)| Request::SendRawCommand {
                session_id,
                command,
            });
        self.respond(request).await
    }

    #[tool(description = "Send a raw FTP command that must succeed with a 2xx reply")]
    async fn send_void_command(
        &self,
        Parameters(params): Parameters<CommandParams>,
    ) -> Result<String, String> {
        let request = params
            .into_parts()
            .map(|(session_id, command)| Request::SendVoidCommand {
                session_id,
                command,
            });
        self.respond(request).await
    }

    #[tool(description = "Cancel the transfer currently running on a session")]
    async fn abort_transfer(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request(|session_id| Request::AbortTransfer { session_id }))
            .await
    }

    #[tool(description = "Switch a session between passive and active data connections")]
    async fn set_passive(
        &self,
        Parameters(params): Parameters<SetPassiveParams>,
    ) -> Result<String, String> {
        self.respond(params.into_request()).await
    }

    #[tool(description = "List the open FTP sessions")]
    async fn list_sessions(&self) -> Result<String, String> {
        self.respond(Ok(Request::ListSessions)).await
    }

    #[tool(description = "List the local directories transfers may read from or write to")]
    async fn list_allowed_directories(&self) -> Result<String, String> {
        self.respond(Ok(Request::ListAllowedDirectories)).await
    }
}
