//! In-memory FTP server for tests.
//!
//! [`MemoryEndpoint`] answers with the reply codes a typical FTP server
//! would (550 for missing paths, 502 for unknown commands) so session and
//! engine error classification is exercised without a network.

use crate::endpoint::{
    ConnectParams, Connector, Endpoint, EndpointError, EndpointResult, ListFormat, PumpError,
    Reply, TransferControl, pump,
};
use crate::walker::{join_remote, normalize_remote, split_parent};
use std::collections::{BTreeMap, HashSet};
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub fn params() -> ConnectParams {
    ConnectParams {
        host: "127.0.0.1".into(),
        port: 2121,
        user: "user".into(),
        password: "12345".into(),
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

#[derive(Debug)]
struct FsState {
    nodes: BTreeMap<String, Node>,
    broken: bool,
    mlsd_supported: bool,
    denied: HashSet<String>,
    unlistable: HashSet<String>,
    read_delay: Option<Duration>,
    next_unique: u32,
}

impl FsState {
    fn children(&self, dir: &str) -> Vec<(String, Node)> {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, node)| {
                let name = &path[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| (name.to_string(), node.clone()))
            })
            .collect()
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn parent_is_dir(&self, path: &str) -> bool {
        let (parent, _) = split_parent(path);
        self.is_dir(&parent)
    }

    fn insert_with_parents(&mut self, path: &str, node: Node) {
        let path = normalize_remote(path);
        let mut current = String::new();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            current = format!("{current}/{segment}");
            self.nodes.entry(current.clone()).or_insert(Node::Dir);
        }
        self.nodes.insert(path, node);
    }
}

/// Shared handle to an in-memory tree. Clones see the same files.
#[derive(Debug, Clone)]
pub struct MemoryFs {
    state: Arc<Mutex<FsState>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            state: Arc::new(Mutex::new(FsState {
                nodes,
                broken: false,
                mlsd_supported: true,
                denied: HashSet::new(),
                unlistable: HashSet::new(),
                read_delay: None,
                next_unique: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_dir(&self, path: &str) {
        self.lock().insert_with_parents(path, Node::Dir);
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.lock()
            .insert_with_parents(path, Node::File(content.to_vec()));
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Every path in the tree, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.lock().nodes.keys().cloned().collect()
    }

    /// Make every operation fail as if the control connection dropped.
    pub fn set_broken(&self, broken: bool) {
        self.lock().broken = broken;
    }

    pub fn set_mlsd_supported(&self, supported: bool) {
        self.lock().mlsd_supported = supported;
    }

    /// Refuse delete, rmdir and store on `path` with `550 Permission denied`.
    pub fn deny(&self, path: &str) {
        self.lock().denied.insert(path.to_string());
    }

    /// Refuse listings of `path` while still letting clients enter it.
    pub fn make_unlistable(&self, path: &str) {
        self.lock().unlistable.insert(path.to_string());
    }

    /// Slow downloads down so tests can observe an active transfer.
    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = Some(delay);
    }
}

#[derive(Debug)]
pub struct MemoryConnector {
    fs: MemoryFs,
}

impl MemoryConnector {
    pub fn new(fs: MemoryFs) -> Self {
        Self { fs }
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, params: &ConnectParams) -> EndpointResult<Box<dyn Endpoint>> {
        if params.host.starts_with("unreachable") || self.fs.lock().broken {
            return Err(EndpointError::Connection(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        if params.user != "user" || params.password != "12345" {
            return Err(EndpointError::reply(530, "Login incorrect."));
        }
        Ok(Box::new(MemoryEndpoint {
            fs: self.fs.clone(),
            cwd: "/".to_string(),
            passive: true,
        }))
    }
}

/// Reader that trickles data out, sleeping before each small chunk.
struct SlowReader {
    data: Cursor<Vec<u8>>,
    delay: Duration,
}

impl Read for SlowReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        std::thread::sleep(self.delay);
        let len = buf.len().min(16);
        self.data.read(&mut buf[..len])
    }
}

#[derive(Debug)]
pub struct MemoryEndpoint {
    fs: MemoryFs,
    cwd: String,
    passive: bool,
}

fn not_found(path: &str) -> EndpointError {
    EndpointError::reply(550, format!("{path}: No such file or directory."))
}

fn denied(path: &str) -> EndpointError {
    EndpointError::reply(550, format!("{path}: Permission denied."))
}

impl MemoryEndpoint {
    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            normalize_remote(path)
        } else {
            normalize_remote(&join_remote(&self.cwd, path))
        }
    }

    fn state(&self) -> EndpointResult<MutexGuard<'_, FsState>> {
        let state = self.fs.lock();
        if state.broken {
            return Err(EndpointError::Connection(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection reset by peer",
            )));
        }
        Ok(state)
    }

    fn write_file(
        &self,
        path: &str,
        source: &mut dyn Read,
        control: &TransferControl,
    ) -> EndpointResult<u64> {
        {
            let state = self.state()?;
            if state.denied.contains(path) {
                return Err(denied(path));
            }
            if state.is_dir(path) || !state.parent_is_dir(path) {
                return Err(not_found(path));
            }
        }
        let mut content = Vec::new();
        let n = pump(source, &mut content, control).map_err(|err| match err {
            PumpError::Read(e) => EndpointError::Local(e),
            PumpError::Write(e) => EndpointError::Connection(e),
            PumpError::Aborted => EndpointError::Aborted,
        })?;
        self.state()?
            .nodes
            .insert(path.to_string(), Node::File(content));
        Ok(n)
    }
}

impl Endpoint for MemoryEndpoint {
    fn welcome(&self) -> Option<String> {
        Some("in-memory FTP ready".to_string())
    }

    fn pwd(&mut self) -> EndpointResult<String> {
        self.state()?;
        Ok(self.cwd.clone())
    }

    fn cwd(&mut self, path: &str) -> EndpointResult<()> {
        let target = self.resolve(path);
        if !self.state()?.is_dir(&target) {
            return Err(not_found(path));
        }
        self.cwd = target;
        Ok(())
    }

    fn cdup(&mut self) -> EndpointResult<()> {
        self.state()?;
        self.cwd = normalize_remote(&format!("{}/..", self.cwd));
        Ok(())
    }

    fn list(&mut self, path: Option<&str>, format: ListFormat) -> EndpointResult<Vec<String>> {
        let target = self.resolve(path.unwrap_or("."));
        let state = self.state()?;
        if format == ListFormat::Machine && !state.mlsd_supported {
            return Err(EndpointError::reply(502, "MLSD not implemented."));
        }
        if state.unlistable.contains(&target) {
            return Err(denied(&target));
        }
        let entries = match state.nodes.get(&target) {
            None => return Err(not_found(&target)),
            Some(Node::File(_)) if format == ListFormat::Machine => {
                return Err(EndpointError::reply(501, "Not a directory."));
            }
            Some(node @ Node::File(_)) => {
                let (_, name) = split_parent(&target);
                vec![(name, node.clone())]
            }
            Some(Node::Dir) => state.children(&target),
        };
        let mut lines = Vec::new();
        if format == ListFormat::Machine {
            lines.push(format!("type=cdir;modify=20240101000000; {target}"));
        }
        for (name, node) in entries {
            lines.push(match (format, node) {
                (ListFormat::Names, _) => name,
                (ListFormat::Machine, Node::Dir) => {
                    format!("type=dir;modify=20240101000000; {name}")
                }
                (ListFormat::Machine, Node::File(data)) => {
                    format!("type=file;size={};modify=20240101000000; {name}", data.len())
                }
                (ListFormat::Long, Node::Dir) => {
                    format!("drwxr-xr-x 2 user group 0 Jan 01 00:00 {name}")
                }
                (ListFormat::Long, Node::File(data)) => {
                    format!("-rw-r--r-- 1 user group {} Jan 01 00:00 {name}", data.len())
                }
            });
        }
        Ok(lines)
    }

    fn retrieve(
        &mut self,
        path: &str,
        sink: &mut dyn Write,
        control: &TransferControl,
    ) -> EndpointResult<u64> {
        let target = self.resolve(path);
        let (data, delay) = {
            let state = self.state()?;
            match state.nodes.get(&target) {
                Some(Node::File(data)) => (data.clone(), state.read_delay),
                _ => return Err(not_found(path)),
            }
        };
        let result = match delay {
            Some(delay) => pump(
                &mut SlowReader {
                    data: Cursor::new(data),
                    delay,
                },
                sink,
                control,
            ),
            None => pump(&mut Cursor::new(data), sink, control),
        };
        result.map_err(|err| match err {
            PumpError::Read(e) => EndpointError::Connection(e),
            PumpError::Write(e) => EndpointError::Local(e),
            PumpError::Aborted => EndpointError::Aborted,
        })
    }

    fn store(
        &mut self,
        path: &str,
        source: &mut dyn Read,
        control: &TransferControl,
    ) -> EndpointResult<u64> {
        let target = self.resolve(path);
        self.write_file(&target, source, control)
    }

    fn store_unique(
        &mut self,
        source: &mut dyn Read,
        control: &TransferControl,
    ) -> EndpointResult<String> {
        let name = {
            let mut state = self.state()?;
            loop {
                state.next_unique += 1;
                let name = format!("upload.{}", state.next_unique);
                if !state.nodes.contains_key(&self.resolve(&name)) {
                    break name;
                }
            }
        };
        let target = self.resolve(&name);
        self.write_file(&target, source, control)?;
        Ok(name)
    }

    fn mkdir(&mut self, path: &str) -> EndpointResult<()> {
        let target = self.resolve(path);
        let mut state = self.state()?;
        if state.nodes.contains_key(&target) {
            return Err(EndpointError::reply(550, format!("{path}: File exists.")));
        }
        if !state.parent_is_dir(&target) {
            return Err(not_found(path));
        }
        state.nodes.insert(target, Node::Dir);
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> EndpointResult<()> {
        let target = self.resolve(path);
        let mut state = self.state()?;
        if state.denied.contains(&target) {
            return Err(denied(path));
        }
        if target == "/" || !state.is_dir(&target) {
            return Err(not_found(path));
        }
        if !state.children(&target).is_empty() {
            return Err(EndpointError::reply(550, format!("{path}: Directory not empty.")));
        }
        state.nodes.remove(&target);
        Ok(())
    }

    fn delete(&mut self, path: &str) -> EndpointResult<()> {
        let target = self.resolve(path);
        let mut state = self.state()?;
        if state.denied.contains(&target) {
            return Err(denied(path));
        }
        if !matches!(state.nodes.get(&target), Some(Node::File(_))) {
            return Err(not_found(path));
        }
        state.nodes.remove(&target);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> EndpointResult<()> {
        let source = self.resolve(from);
        let target = self.resolve(to);
        let mut state = self.state()?;
        if source == "/" || !state.nodes.contains_key(&source) {
            return Err(not_found(from));
        }
        if state.nodes.contains_key(&target) {
            return Err(EndpointError::reply(550, format!("{to}: File exists.")));
        }
        if !state.parent_is_dir(&target) {
            return Err(not_found(to));
        }
        let nested = format!("{source}/");
        let moved: Vec<String> = state
            .nodes
            .keys()
            .filter(|k| **k == source || k.starts_with(&nested))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = state.nodes.remove(&old) {
                let new = format!("{target}{}", &old[source.len()..]);
                state.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn size(&mut self, path: &str) -> EndpointResult<u64> {
        let target = self.resolve(path);
        match self.state()?.nodes.get(&target) {
            Some(Node::File(data)) => Ok(data.len() as u64),
            Some(Node::Dir) => Err(EndpointError::reply(
                550,
                format!("{path} is not retrievable."),
            )),
            None => Err(not_found(path)),
        }
    }

    fn command(&mut self, command: &str) -> EndpointResult<Reply> {
        let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));
        let reply = |code, text: &str| Reply {
            code,
            text: text.to_string(),
        };
        match verb.to_ascii_uppercase().as_str() {
            "SYST" => {
                self.state()?;
                Ok(reply(215, "UNIX Type: L8"))
            }
            "NOOP" => {
                self.state()?;
                Ok(reply(200, "NOOP ok."))
            }
            "PWD" => {
                let cwd = self.pwd()?;
                Ok(reply(257, &format!("\"{cwd}\" is the current directory.")))
            }
            "CWD" => {
                self.cwd(arg.trim())?;
                Ok(reply(250, "Directory successfully changed."))
            }
            "CDUP" => {
                self.cdup()?;
                Ok(reply(250, "Directory successfully changed."))
            }
            "STAT" => {
                self.state()?;
                let mode = if self.passive { "passive" } else { "active" };
                Ok(reply(211, &format!("Data connections use {mode} mode.")))
            }
            _ => Err(EndpointError::reply(502, "Command not implemented.")),
        }
    }

    fn set_passive(&mut self, passive: bool) {
        self.passive = passive;
    }

    fn quit(&mut self) -> EndpointResult<()> {
        self.state()?;
        Ok(())
    }
}
