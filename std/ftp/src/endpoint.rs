//! Boundary to the wire-level FTP client.
//!
//! An [`Endpoint`] is one authenticated control connection. Every method
//! blocks on network I/O, so callers drive endpoints from tokio's blocking
//! pool. Transfers take a [`TransferControl`] which another task may flip to
//! abort the data stream between chunks.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Size of one transfer chunk; abort requests are honoured between chunks.
pub const TRANSFER_CHUNK: usize = 64 * 1024;

pub type EndpointResult<T> = Result<T, EndpointError>;

/// Failures reported by an [`Endpoint`].
#[derive(Error, Debug)]
pub enum EndpointError {
    /// The control or data connection failed at the socket level.
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),
    /// The server answered with a negative or unexpected reply.
    #[error("{code} {message}")]
    Reply { code: u32, message: String },
    /// Reading the upload source or writing the download sink failed.
    #[error("local I/O error: {0}")]
    Local(#[source] io::Error),
    /// The transfer was cancelled through its [`TransferControl`].
    #[error("transfer aborted")]
    Aborted,
    /// The server said something the client could not interpret.
    #[error("malformed server response: {0}")]
    BadResponse(String),
}

impl EndpointError {
    pub(crate) fn reply(code: u32, message: impl Into<String>) -> Self {
        EndpointError::Reply {
            code,
            message: message.into(),
        }
    }

    /// Reply code, when the server produced one.
    pub fn code(&self) -> Option<u32> {
        match self {
            EndpointError::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the control connection can no longer be trusted.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            EndpointError::Connection(_) | EndpointError::Reply { code: 421, .. }
        )
    }
}

/// Listing command used for a directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    /// `LIST`: human-readable lines.
    Long,
    /// `NLST`: bare names.
    Names,
    /// `MLSD`: machine-readable facts.
    Machine,
}

/// A positive reply to a raw command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u32,
    pub text: String,
}

/// Credentials and address for one connection.
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Shared abort switch for the transfer currently running on a session.
#[derive(Debug, Default)]
pub struct TransferControl {
    active: AtomicBool,
    abort: AtomicBool,
}

impl TransferControl {
    /// Mark a transfer as started. The returned guard marks it finished.
    pub fn begin(&self) -> TransferGuard<'_> {
        self.abort.store(false, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        TransferGuard { control: self }
    }

    /// Ask the active transfer to stop. Returns `false` when none is running.
    pub fn request_abort(&self) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        self.abort.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// Clears the transfer flags when dropped.
pub struct TransferGuard<'a> {
    control: &'a TransferControl,
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        self.control.active.store(false, Ordering::SeqCst);
        self.control.abort.store(false, Ordering::SeqCst);
    }
}

/// One authenticated FTP control connection.
pub trait Endpoint: Send {
    /// Banner sent by the server on connect.
    fn welcome(&self) -> Option<String>;
    fn pwd(&mut self) -> EndpointResult<String>;
    fn cwd(&mut self, path: &str) -> EndpointResult<()>;
    fn cdup(&mut self) -> EndpointResult<()>;
    /// Raw listing lines of `path` (the current directory when `None`).
    fn list(&mut self, path: Option<&str>, format: ListFormat) -> EndpointResult<Vec<String>>;
    /// Stream `path` into `sink`, returning the number of bytes written.
    fn retrieve(
        &mut self,
        path: &str,
        sink: &mut dyn Write,
        control: &TransferControl,
    ) -> EndpointResult<u64>;
    /// Stream `source` into `path`, overwriting it.
    fn store(
        &mut self,
        path: &str,
        source: &mut dyn Read,
        control: &TransferControl,
    ) -> EndpointResult<u64>;
    /// Store `source` under a server-chosen name and return that name.
    fn store_unique(
        &mut self,
        source: &mut dyn Read,
        control: &TransferControl,
    ) -> EndpointResult<String>;
    fn mkdir(&mut self, path: &str) -> EndpointResult<()>;
    fn rmdir(&mut self, path: &str) -> EndpointResult<()>;
    fn delete(&mut self, path: &str) -> EndpointResult<()>;
    fn rename(&mut self, from: &str, to: &str) -> EndpointResult<()>;
    fn size(&mut self, path: &str) -> EndpointResult<u64>;
    /// Send a raw command. Replies below 400 are returned, others are errors.
    fn command(&mut self, command: &str) -> EndpointResult<Reply>;
    fn set_passive(&mut self, passive: bool);
    fn quit(&mut self) -> EndpointResult<()>;
}

/// Opens authenticated endpoints.
pub trait Connector: Send + Sync + fmt::Debug {
    fn connect(&self, params: &ConnectParams) -> EndpointResult<Box<dyn Endpoint>>;
}

/// Why [`pump`] stopped early.
#[derive(Debug)]
pub enum PumpError {
    Read(io::Error),
    Write(io::Error),
    Aborted,
}

/// Copy `reader` into `writer` chunk by chunk, checking for aborts.
pub fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    control: &TransferControl,
) -> Result<u64, PumpError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; TRANSFER_CHUNK];
    let mut total = 0u64;
    loop {
        if control.abort_requested() {
            return Err(PumpError::Aborted);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PumpError::Read(e)),
        };
        writer.write_all(&buf[..n]).map_err(PumpError::Write)?;
        total += n as u64;
    }
    writer.flush().map_err(PumpError::Write)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use crate::endpoint::{EndpointError, PumpError, TransferControl, pump};
    use std::io::Cursor;

    #[test]
    fn pump_copies_everything() {
        let control = TransferControl::default();
        let data = vec![7u8; 200_000];
        let mut sink = Vec::new();
        let n = pump(&mut Cursor::new(data.clone()), &mut sink, &control).unwrap();
        assert_eq!(n, 200_000);
        assert_eq!(sink, data);
    }

    #[test]
    fn pump_stops_when_abort_requested() {
        let control = TransferControl::default();
        let _guard = control.begin();
        assert!(control.request_abort());
        let mut sink = Vec::new();
        let result = pump(&mut Cursor::new(vec![1u8; 10]), &mut sink, &control);
        assert!(matches!(result, Err(PumpError::Aborted)));
        assert!(sink.is_empty());
    }

    #[test]
    fn abort_without_transfer_is_refused() {
        let control = TransferControl::default();
        assert!(!control.request_abort());
        {
            let _guard = control.begin();
            assert!(control.is_active());
        }
        assert!(!control.is_active());
        assert!(!control.abort_requested());
    }

    #[test]
    fn service_unavailable_counts_as_lost_connection() {
        assert!(EndpointError::reply(421, "Timeout").is_connection_lost());
        assert!(!EndpointError::reply(550, "No such file").is_connection_lost());
        assert_eq!(EndpointError::reply(550, "x").code(), Some(550));
    }
}
