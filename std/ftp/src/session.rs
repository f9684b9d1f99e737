//! One authenticated FTP session.
//!
//! [`Session`] wraps an [`Endpoint`] with the session's tracked working
//! directory and turns raw reply codes into [`ToolError`] kinds. All methods
//! block; the registry runs them on tokio's blocking pool.

use crate::endpoint::{
    ConnectParams, Connector, Endpoint, EndpointError, ListFormat, Reply, TransferControl,
};
use crate::error::{ToolError, ToolResult};
use crate::listing::{EntryKind, ListMode, RemoteEntry, parse_listing};
use crate::walker::{join_remote, normalize_remote, split_parent};
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Replies that name a missing, unreadable or unusable path.
fn is_file_unavailable(err: &EndpointError) -> bool {
    matches!(err.code(), Some(450 | 501 | 550 | 553))
}

/// Replies meaning the server does not implement the command.
fn is_not_implemented(err: &EndpointError) -> bool {
    matches!(err.code(), Some(500 | 502 | 504))
}

/// Verbs that move the server-side working directory.
fn changes_directory(command: &str) -> bool {
    let verb = command
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(verb.as_str(), "CWD" | "CDUP" | "XCWD" | "XCUP")
}

/// Text read from a remote file by [`Session::read_file`].
#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub content: String,
    pub bytes: u64,
    pub truncated: bool,
}

/// In-memory sink that refuses writes past `limit` bytes.
struct CappedBuffer {
    buf: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl Write for CappedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.limit.saturating_sub(self.buf.len());
        if room == 0 && !data.is_empty() {
            self.overflowed = true;
            return Err(io::Error::other("read limit reached"));
        }
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sibling path a download is written to before it replaces `local`.
fn partial_path(local: &Path) -> PathBuf {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    local.with_file_name(format!("{name}.part"))
}

/// Live state of one FTP session.
pub struct Session {
    endpoint: Box<dyn Endpoint>,
    host: String,
    port: u16,
    user: String,
    cwd: String,
    welcome: Option<String>,
    passive: bool,
    connected: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("cwd", &self.cwd)
            .field("passive", &self.passive)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect and authenticate.
    pub fn open(
        connector: &dyn Connector,
        params: &ConnectParams,
        passive: bool,
    ) -> ToolResult<Self> {
        let mut endpoint = connector
            .connect(params)
            .map_err(|err| connect_error(params, err))?;
        if !passive {
            endpoint.set_passive(false);
        }
        let cwd = endpoint.pwd().map_err(|err| connect_error(params, err))?;
        let welcome = endpoint.welcome();
        Ok(Self {
            endpoint,
            host: params.host.clone(),
            port: params.port,
            user: params.user.clone(),
            cwd,
            welcome,
            passive,
            connected: true,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Working directory as of the last successful directory change.
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn welcome(&self) -> Option<&str> {
        self.welcome.as_deref()
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Resolve `path` against the working directory.
    pub fn absolute(&self, path: &str) -> String {
        if path.starts_with('/') {
            normalize_remote(path)
        } else {
            normalize_remote(&join_remote(&self.cwd, path))
        }
    }

    /// Convert an endpoint failure, marking the session dead on connection loss.
    fn fail(&mut self, err: EndpointError, path: &str) -> ToolError {
        if err.is_connection_lost() {
            self.connected = false;
        }
        match err {
            EndpointError::Connection(e) => ToolError::Connectivity(format!(
                "connection to {}:{} lost: {e}",
                self.host, self.port
            )),
            EndpointError::Reply { code: 421, message } => ToolError::Connectivity(format!(
                "{}:{} closed the session: {message}",
                self.host, self.port
            )),
            EndpointError::Reply { code, message } => {
                ToolError::Protocol(format!("{code} {message}"))
            }
            EndpointError::Local(e) => ToolError::local_io("<staging buffer>", e),
            EndpointError::Aborted => ToolError::TransferAborted(path.to_string()),
            EndpointError::BadResponse(message) => ToolError::Protocol(message),
        }
    }

    /// Like [`Session::fail`], but reports `PathNotFound` when the path is gone.
    fn missing_or(&mut self, err: EndpointError, path: &str) -> ToolError {
        if is_file_unavailable(&err) {
            match self.probe_kind(path) {
                Ok(None) => return ToolError::PathNotFound(path.to_string()),
                Err(probe_err) => return probe_err,
                Ok(Some(_)) => {}
            }
        }
        self.fail(err, path)
    }

    /// Whether `path` is a directory, probed by entering it and coming back.
    pub fn is_directory(&mut self, path: &str) -> ToolResult<bool> {
        match self.endpoint.cwd(path) {
            Ok(()) => {
                let home = self.cwd.clone();
                if let Err(err) = self.endpoint.cwd(&home) {
                    return Err(self.fail(err, &home));
                }
                Ok(true)
            }
            Err(err) if err.is_connection_lost() => Err(self.fail(err, path)),
            Err(_) => Ok(false),
        }
    }

    /// Kind of the entry at `path`, or `None` when it does not exist.
    pub fn probe_kind(&mut self, path: &str) -> ToolResult<Option<EntryKind>> {
        if self.is_directory(path)? {
            return Ok(Some(EntryKind::Directory));
        }
        match self.endpoint.size(path) {
            Ok(_) => Ok(Some(EntryKind::File)),
            Err(err) if err.is_connection_lost() => Err(self.fail(err, path)),
            Err(_) => self.find_in_parent(path),
        }
    }

    // SIZE is refused for links and special files; look the name up instead.
    fn find_in_parent(&mut self, path: &str) -> ToolResult<Option<EntryKind>> {
        let (parent, name) = split_parent(path);
        debug!(path, parent = %parent, "probing parent listing");
        let lines = match self.endpoint.list(Some(&parent), ListFormat::Machine) {
            Ok(lines) => parse_listing(&lines, ListMode::MachineReadable),
            Err(err) if err.is_connection_lost() => return Err(self.fail(err, path)),
            Err(_) => match self.endpoint.list(Some(&parent), ListFormat::Long) {
                Ok(lines) => parse_listing(&lines, ListMode::Default),
                Err(err) if err.is_connection_lost() => return Err(self.fail(err, path)),
                Err(_) => return Ok(None),
            },
        };
        Ok(lines.into_iter().find(|e| e.name == name).map(|e| e.kind))
    }

    fn refresh_cwd(&mut self) -> ToolResult<String> {
        match self.endpoint.pwd() {
            Ok(cwd) => {
                self.cwd = cwd;
                Ok(self.cwd.clone())
            }
            Err(err) => Err(self.fail(err, ".")),
        }
    }

    /// List `path` (the working directory when `None`) in the given mode.
    pub fn list(&mut self, path: Option<&str>, mode: ListMode) -> ToolResult<Vec<RemoteEntry>> {
        let target = path.unwrap_or(".");
        let format = match mode {
            ListMode::Default => ListFormat::Long,
            ListMode::NamesOnly => ListFormat::Names,
            ListMode::MachineReadable => ListFormat::Machine,
        };
        match self.endpoint.list(path, format) {
            Ok(lines) => Ok(parse_listing(&lines, mode)),
            Err(err) if mode == ListMode::MachineReadable && is_not_implemented(&err) => {
                debug!(path = target, "MLSD not implemented, falling back to LIST");
                match self.endpoint.list(path, ListFormat::Long) {
                    Ok(lines) => Ok(parse_listing(&lines, ListMode::Default)),
                    Err(err) => Err(self.missing_or(err, target)),
                }
            }
            Err(err) => Err(self.missing_or(err, target)),
        }
    }

    /// Children of directory `path`, without `.` and `..`.
    pub fn list_children(&mut self, path: &str) -> ToolResult<Vec<RemoteEntry>> {
        let entries = self.list(Some(path), ListMode::MachineReadable)?;
        Ok(entries
            .into_iter()
            .filter(|e| !e.is_self_or_parent())
            .collect())
    }

    /// Download `remote` to `local`, replacing `local` only on success.
    pub fn retrieve_file(
        &mut self,
        remote: &str,
        local: &Path,
        control: &TransferControl,
    ) -> ToolResult<u64> {
        let partial = partial_path(local);
        let file = File::create(&partial).map_err(|e| ToolError::local_io(&partial, e))?;
        let mut sink = BufWriter::new(file);
        let result = {
            let _transfer = control.begin();
            self.endpoint.retrieve(remote, &mut sink, control)
        };
        let result = result.and_then(|n| sink.flush().map(|_| n).map_err(EndpointError::Local));
        drop(sink);
        match result {
            Ok(bytes) => {
                if let Err(e) = fs::rename(&partial, local) {
                    let _ = fs::remove_file(&partial);
                    return Err(ToolError::local_io(local, e));
                }
                Ok(bytes)
            }
            Err(err) => {
                let _ = fs::remove_file(&partial);
                Err(match err {
                    EndpointError::Local(e) => ToolError::local_io(local, e),
                    err => self.missing_or(err, remote),
                })
            }
        }
    }

    /// Download `remote` into memory, keeping at most `limit` bytes.
    pub fn read_file(
        &mut self,
        remote: &str,
        limit: u64,
        control: &TransferControl,
    ) -> ToolResult<FileContent> {
        let mut sink = CappedBuffer {
            buf: Vec::new(),
            limit: usize::try_from(limit).unwrap_or(usize::MAX),
            overflowed: false,
        };
        let result = {
            let _transfer = control.begin();
            self.endpoint.retrieve(remote, &mut sink, control)
        };
        match result {
            Ok(_) => {}
            Err(EndpointError::Local(_)) if sink.overflowed => {}
            Err(err) => return Err(self.missing_or(err, remote)),
        }
        Ok(FileContent {
            bytes: sink.buf.len() as u64,
            truncated: sink.overflowed,
            content: String::from_utf8_lossy(&sink.buf).into_owned(),
        })
    }

    fn open_local(local: &Path) -> ToolResult<BufReader<File>> {
        let file = File::open(local).map_err(|e| ToolError::local_io(local, e))?;
        let meta = file.metadata().map_err(|e| ToolError::local_io(local, e))?;
        if meta.is_dir() {
            return Err(ToolError::InvalidArgument(format!(
                "{} is a directory",
                local.display()
            )));
        }
        Ok(BufReader::new(file))
    }

    /// Upload `local` to `remote`, overwriting any existing remote file.
    pub fn store_file(
        &mut self,
        local: &Path,
        remote: &str,
        control: &TransferControl,
    ) -> ToolResult<u64> {
        let mut source = Self::open_local(local)?;
        let result = {
            let _transfer = control.begin();
            self.endpoint.store(remote, &mut source, control)
        };
        result.map_err(|err| match err {
            EndpointError::Local(e) => ToolError::local_io(local, e),
            err => self.missing_or(err, remote),
        })
    }

    /// Upload `local` under a name chosen by the server; returns that name.
    pub fn store_file_unique(
        &mut self,
        local: &Path,
        control: &TransferControl,
    ) -> ToolResult<String> {
        let mut source = Self::open_local(local)?;
        let result = {
            let _transfer = control.begin();
            self.endpoint.store_unique(&mut source, control)
        };
        result.map_err(|err| match err {
            EndpointError::Local(e) => ToolError::local_io(local, e),
            err => self.fail(err, "<unique>"),
        })
    }

    /// Server-side copy emulation: download into memory, upload again.
    pub fn copy_file(
        &mut self,
        source: &str,
        destination: &str,
        control: &TransferControl,
    ) -> ToolResult<u64> {
        let mut staging = Vec::new();
        let fetched = {
            let _transfer = control.begin();
            self.endpoint.retrieve(source, &mut staging, control)
        };
        if let Err(err) = fetched {
            return Err(self.missing_or(err, source));
        }
        let stored = {
            let _transfer = control.begin();
            self.endpoint
                .store(destination, &mut Cursor::new(staging), control)
        };
        stored.map_err(|err| self.missing_or(err, destination))
    }

    pub fn make_directory(&mut self, path: &str) -> ToolResult<()> {
        match self.endpoint.mkdir(path) {
            Ok(()) => Ok(()),
            Err(err) if is_file_unavailable(&err) => match self.probe_kind(path)? {
                Some(_) => Err(ToolError::PathExists(path.to_string())),
                None => Err(self.fail(err, path)),
            },
            Err(err) => Err(self.fail(err, path)),
        }
    }

    /// Create `path` unless it already is a directory. Returns whether it was created.
    pub fn ensure_directory(&mut self, path: &str) -> ToolResult<bool> {
        match self.endpoint.mkdir(path) {
            Ok(()) => Ok(true),
            Err(err) if err.is_connection_lost() => Err(self.fail(err, path)),
            Err(err) => {
                if self.is_directory(path)? {
                    Ok(false)
                } else {
                    Err(self.fail(err, path))
                }
            }
        }
    }

    /// Change the working directory and return the new one.
    pub fn change_directory(&mut self, path: &str) -> ToolResult<String> {
        if let Err(err) = self.endpoint.cwd(path) {
            return Err(self.missing_or(err, path));
        }
        self.refresh_cwd()
    }

    pub fn change_to_parent(&mut self) -> ToolResult<String> {
        if let Err(err) = self.endpoint.cdup() {
            return Err(self.fail(err, ".."));
        }
        self.refresh_cwd()
    }

    /// Remove an empty directory.
    pub fn remove_directory(&mut self, path: &str) -> ToolResult<()> {
        let err = match self.endpoint.rmdir(path) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !is_file_unavailable(&err) {
            return Err(self.fail(err, path));
        }
        match self.probe_kind(path)? {
            None => Err(ToolError::PathNotFound(path.to_string())),
            Some(EntryKind::Directory) => match self.list_children(path) {
                Ok(children) if !children.is_empty() => {
                    Err(ToolError::DirectoryNotEmpty(path.to_string()))
                }
                _ => Err(self.fail(err, path)),
            },
            Some(_) => Err(ToolError::InvalidArgument(format!(
                "{path} is not a directory"
            ))),
        }
    }

    /// Delete a single file.
    pub fn delete_file(&mut self, path: &str) -> ToolResult<()> {
        let err = match self.endpoint.delete(path) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !is_file_unavailable(&err) {
            return Err(self.fail(err, path));
        }
        match self.probe_kind(path)? {
            None => Err(ToolError::PathNotFound(path.to_string())),
            Some(EntryKind::Directory) => Err(ToolError::NotAFile(path.to_string())),
            Some(_) => Err(self.fail(err, path)),
        }
    }

    /// Rename a file or directory.
    pub fn rename(&mut self, from: &str, to: &str) -> ToolResult<()> {
        let err = match self.endpoint.rename(from, to) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if err.is_connection_lost() {
            return Err(self.fail(err, from));
        }
        if self.probe_kind(from)?.is_none() {
            return Err(ToolError::PathNotFound(from.to_string()));
        }
        if self.probe_kind(to)?.is_some() {
            return Err(ToolError::PathExists(to.to_string()));
        }
        Err(self.fail(err, from))
    }

    /// Size of a file in bytes.
    pub fn size(&mut self, path: &str) -> ToolResult<u64> {
        let err = match self.endpoint.size(path) {
            Ok(size) => return Ok(size),
            Err(err) => err,
        };
        if err.is_connection_lost() {
            return Err(self.fail(err, path));
        }
        match self.probe_kind(path)? {
            None => Err(ToolError::PathNotFound(path.to_string())),
            Some(EntryKind::Directory) => Err(ToolError::NotAFile(path.to_string())),
            Some(_) => Err(self.fail(err, path)),
        }
    }

    /// Send a raw command and return the server's reply.
    pub fn raw_command(&mut self, command: &str) -> ToolResult<Reply> {
        let reply = match self.endpoint.command(command) {
            Ok(reply) => reply,
            Err(err) => return Err(self.fail(err, command)),
        };
        if changes_directory(command) {
            self.refresh_cwd()?;
        }
        Ok(reply)
    }

    /// Send a raw command that must complete with a 2xx reply.
    pub fn void_command(&mut self, command: &str) -> ToolResult<Reply> {
        let reply = self.raw_command(command)?;
        if !(200..300).contains(&reply.code) {
            return Err(ToolError::Protocol(format!(
                "expected a 2xx reply, got {} {}",
                reply.code, reply.text
            )));
        }
        Ok(reply)
    }

    pub fn set_passive(&mut self, passive: bool) {
        self.endpoint.set_passive(passive);
        self.passive = passive;
    }

    /// Send `QUIT`. The session is unusable afterwards either way.
    pub fn quit(&mut self) -> ToolResult<()> {
        let result = self.endpoint.quit();
        self.connected = false;
        result.map_err(|err| self.fail(err, "."))
    }
}

fn connect_error(params: &ConnectParams, err: EndpointError) -> ToolError {
    match err {
        EndpointError::Connection(e) => {
            ToolError::Connectivity(format!("{}:{}: {e}", params.host, params.port))
        }
        EndpointError::Reply {
            code: 530 | 430 | 331 | 332,
            message,
        } => ToolError::Authentication(format!("user '{}': {message}", params.user)),
        EndpointError::Reply { code: 421, message } => {
            ToolError::Connectivity(format!("{}:{}: {message}", params.host, params.port))
        }
        other => ToolError::Protocol(other.to_string()),
    }
}
