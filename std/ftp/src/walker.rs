//! Lazy depth-first traversal of a remote directory tree.
//!
//! A [`TreeWalker`] is a cursor: each call to [`TreeWalker::next_event`]
//! issues at most one listing, so a consumer that stops early never lists
//! the rest of the tree. Directories produce `Enter` before their children
//! and `Leave` after the last one, which is the order post-order deletion
//! needs.

use crate::error::ToolError;
use crate::listing::{EntryKind, RemoteEntry};
use crate::session::Session;
use serde::Serialize;
use std::collections::VecDeque;

/// Join a remote parent path and a child name.
pub fn join_remote(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "." {
        name.to_string()
    } else if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Collapse `.`, `..` and repeated slashes in a remote path.
pub fn normalize_remote(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            p => parts.push(p),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Split a remote path into its parent directory and final name.
pub fn split_parent(path: &str) -> (String, String) {
    let trimmed = trim_root(path);
    match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (".".to_string(), trimmed),
    }
}

/// Drop trailing slashes, keeping a bare `/` intact.
pub fn trim_root(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A node reached by the walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub path: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug)]
pub enum WalkEvent {
    /// A directory was listed; its children follow.
    Enter(TreeNode),
    /// A non-directory entry.
    Leaf(TreeNode),
    /// Every child of this directory has been yielded.
    Leave(TreeNode),
    /// The node could not be listed or does not exist. Nothing below it is walked.
    Failed { node: TreeNode, error: ToolError },
}

#[derive(Debug)]
struct Frame {
    node: TreeNode,
    pending: VecDeque<RemoteEntry>,
}

/// Depth-first cursor over the tree rooted at one remote path.
#[derive(Debug)]
pub struct TreeWalker {
    root: String,
    started: bool,
    finished: bool,
    stack: Vec<Frame>,
    listings: usize,
}

impl TreeWalker {
    pub fn new(root: &str) -> Self {
        Self {
            root: trim_root(root),
            started: false,
            finished: false,
            stack: Vec::new(),
            listings: 0,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Number of directory listings issued so far.
    pub fn listings(&self) -> usize {
        self.listings
    }

    /// End the walk; later calls to `next_event` return `None`.
    pub fn stop(&mut self) {
        self.finished = true;
        self.stack.clear();
    }

    /// Advance the walk by one event.
    pub fn next_event(&mut self, session: &mut Session) -> Option<WalkEvent> {
        if self.finished {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.visit_root(session));
        }
        let Some(frame) = self.stack.last_mut() else {
            self.finished = true;
            return None;
        };
        match frame.pending.pop_front() {
            Some(entry) => {
                let parent = frame.node.path.clone();
                let node = TreeNode {
                    path: join_remote(&parent, &entry.name),
                    kind: entry.kind,
                    parent: Some(parent),
                    depth: frame.node.depth + 1,
                    size: entry.size,
                };
                if entry.kind.is_directory() {
                    Some(self.descend(session, node))
                } else {
                    Some(WalkEvent::Leaf(node))
                }
            }
            None => {
                let frame = self.stack.pop()?;
                if self.stack.is_empty() {
                    self.finished = true;
                }
                Some(WalkEvent::Leave(frame.node))
            }
        }
    }

    fn visit_root(&mut self, session: &mut Session) -> WalkEvent {
        let mut node = TreeNode {
            path: self.root.clone(),
            kind: EntryKind::Unknown,
            parent: None,
            depth: 0,
            size: None,
        };
        match session.probe_kind(&self.root) {
            Ok(Some(EntryKind::Directory)) => {
                node.kind = EntryKind::Directory;
                self.descend(session, node)
            }
            Ok(Some(kind)) => {
                self.finished = true;
                node.kind = kind;
                WalkEvent::Leaf(node)
            }
            Ok(None) => {
                self.finished = true;
                let error = ToolError::PathNotFound(self.root.clone());
                WalkEvent::Failed { node, error }
            }
            Err(error) => {
                self.finished = true;
                WalkEvent::Failed { node, error }
            }
        }
    }

    fn descend(&mut self, session: &mut Session, node: TreeNode) -> WalkEvent {
        self.listings += 1;
        match session.list_children(&node.path) {
            Ok(children) => {
                self.stack.push(Frame {
                    node: node.clone(),
                    pending: children.into(),
                });
                WalkEvent::Enter(node)
            }
            Err(error) => {
                if self.stack.is_empty() {
                    self.finished = true;
                }
                WalkEvent::Failed { node, error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::listing::EntryKind;
    use crate::memory::{MemoryConnector, MemoryFs, params};
    use crate::session::Session;
    use crate::walker::{
        TreeWalker, WalkEvent, join_remote, normalize_remote, split_parent, trim_root,
    };
    use std::collections::HashSet;

    fn session(fs: &MemoryFs) -> Session {
        Session::open(&MemoryConnector::new(fs.clone()), &params(), true).unwrap()
    }

    fn label(event: &WalkEvent) -> String {
        match event {
            WalkEvent::Enter(n) => format!("enter {}", n.path),
            WalkEvent::Leaf(n) => format!("leaf {}", n.path),
            WalkEvent::Leave(n) => format!("leave {}", n.path),
            WalkEvent::Failed { node, .. } => format!("failed {}", node.path),
        }
    }

    fn collect(walker: &mut TreeWalker, session: &mut Session) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(event) = walker.next_event(session) {
            out.push(label(&event));
        }
        out
    }

    #[test]
    fn path_helpers() {
        assert_eq!(join_remote("/", "a"), "/a");
        assert_eq!(join_remote("docs", "a"), "docs/a");
        assert_eq!(join_remote(".", "a"), "a");
        assert_eq!(normalize_remote("/a/./b/../c//d"), "/a/c/d");
        assert_eq!(normalize_remote("/.."), "/");
        assert_eq!(normalize_remote("../x"), "../x");
        assert_eq!(split_parent("/a/b"), ("/a".to_string(), "b".to_string()));
        assert_eq!(split_parent("/a"), ("/".to_string(), "a".to_string()));
        assert_eq!(split_parent("a"), (".".to_string(), "a".to_string()));
        assert_eq!(trim_root("docs//"), "docs");
        assert_eq!(trim_root("///"), "/");
    }

    #[test]
    fn post_order_walk_visits_each_node_once() {
        let fs = MemoryFs::new();
        fs.add_file("/t/a.txt", b"a");
        fs.add_file("/t/sub/b.txt", b"b");
        fs.add_dir("/t/sub/empty");
        let mut s = session(&fs);
        let mut walker = TreeWalker::new("t/");
        let events = collect(&mut walker, &mut s);
        assert_eq!(
            events,
            vec![
                "enter t",
                "leaf t/a.txt",
                "enter t/sub",
                "leaf t/sub/b.txt",
                "enter t/sub/empty",
                "leave t/sub/empty",
                "leave t/sub",
                "leave t",
            ]
        );
        let unique: HashSet<_> = events.iter().filter(|e| !e.starts_with("leave")).collect();
        assert_eq!(unique.len(), 5);
        assert!(walker.next_event(&mut s).is_none());
    }

    #[test]
    fn walk_is_lazy() {
        let fs = MemoryFs::new();
        fs.add_file("/big/one/x", b"x");
        fs.add_file("/big/two/y", b"y");
        let mut s = session(&fs);
        let mut walker = TreeWalker::new("/big");
        assert!(matches!(walker.next_event(&mut s), Some(WalkEvent::Enter(_))));
        assert_eq!(walker.listings(), 1);
        walker.stop();
        assert!(walker.next_event(&mut s).is_none());
        assert_eq!(walker.listings(), 1);
    }

    #[test]
    fn missing_root_fails_once() {
        let fs = MemoryFs::new();
        let mut s = session(&fs);
        let mut walker = TreeWalker::new("/ghost");
        match walker.next_event(&mut s) {
            Some(WalkEvent::Failed { error, .. }) => {
                assert_eq!(error.kind(), ErrorKind::PathNotFoundError)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(walker.next_event(&mut s).is_none());
    }

    #[test]
    fn file_root_is_a_single_leaf() {
        let fs = MemoryFs::new();
        fs.add_file("/solo.txt", b"1");
        let mut s = session(&fs);
        let mut walker = TreeWalker::new("/solo.txt");
        match walker.next_event(&mut s) {
            Some(WalkEvent::Leaf(node)) => {
                assert_eq!(node.kind, EntryKind::File);
                assert_eq!(node.depth, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(walker.next_event(&mut s).is_none());
    }

    #[test]
    fn unlistable_child_is_reported_and_skipped() {
        let fs = MemoryFs::new();
        fs.add_file("/r/locked/secret", b"s");
        fs.add_file("/r/open.txt", b"o");
        fs.make_unlistable("/r/locked");
        let mut s = session(&fs);
        let mut walker = TreeWalker::new("/r");
        let events = collect(&mut walker, &mut s);
        assert_eq!(
            events,
            vec!["enter /r", "failed /r/locked", "leaf /r/open.txt", "leave /r"]
        );
    }
}
