//! Recursive delete, copy and move built on [`TreeWalker`].
//!
//! Every node the walk reaches gets exactly one [`OperationOutcome`]. A
//! failure on one node does not stop its siblings unless
//! [`RecursiveOptions::fail_fast`] is set; a directory whose children could
//! not all be removed is itself left in place.

use crate::endpoint::TransferControl;
use crate::error::{ErrorDetail, ToolError, ToolResult};
use crate::listing::EntryKind;
use crate::session::Session;
use crate::walker::{TreeNode, TreeWalker, WalkEvent, join_remote, trim_root};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Delete,
    Copy,
    Move,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecursiveOptions {
    /// Stop at the first failed node.
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    /// Moved nodes that were copied but whose source could not be removed.
    PartiallySucceeded,
}

/// Result of one phase (copy or delete) of a moved node.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcome {
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl PhaseOutcome {
    fn from_result(result: &ToolResult<()>) -> Self {
        Self {
            succeeded: result.is_ok(),
            error: result.as_ref().err().map(ErrorDetail::from),
        }
    }
}

/// What happened to one node.
#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome {
    pub path: String,
    pub kind: EntryKind,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy: Option<PhaseOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<PhaseOutcome>,
}

impl OperationOutcome {
    fn from_result(node: &TreeNode, result: ToolResult<()>) -> Self {
        let (status, error) = match &result {
            Ok(()) => (OutcomeStatus::Succeeded, None),
            Err(err) => (OutcomeStatus::Failed, Some(ErrorDetail::from(err))),
        };
        Self {
            path: node.path.clone(),
            kind: node.kind,
            status,
            destination: None,
            error,
            copy: None,
            delete: None,
        }
    }

    fn failed(node: &TreeNode, error: &ToolError) -> Self {
        Self {
            path: node.path.clone(),
            kind: node.kind,
            status: OutcomeStatus::Failed,
            destination: None,
            error: Some(ErrorDetail::from(error)),
            copy: None,
            delete: None,
        }
    }

    fn with_destination(mut self, destination: String) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Outcome of a moved node from its two phases. `delete` is `None`
    /// when the copy failed and the source was left alone.
    fn moved(
        node: &TreeNode,
        destination: String,
        copy: ToolResult<()>,
        delete: Option<ToolResult<()>>,
    ) -> Self {
        let copy_phase = PhaseOutcome::from_result(&copy);
        let delete_phase = delete.as_ref().map(PhaseOutcome::from_result);
        let (status, error) = match (&copy, &delete) {
            (Err(err), _) => (OutcomeStatus::Failed, Some(ErrorDetail::from(err))),
            (Ok(()), Some(Ok(()))) => (OutcomeStatus::Succeeded, None),
            (Ok(()), Some(Err(err))) => (
                OutcomeStatus::PartiallySucceeded,
                Some(ErrorDetail::from(err)),
            ),
            (Ok(()), None) => (OutcomeStatus::PartiallySucceeded, None),
        };
        Self {
            path: node.path.clone(),
            kind: node.kind,
            status,
            destination: Some(destination),
            error,
            copy: Some(copy_phase),
            delete: delete_phase,
        }
    }
}

/// Aggregate result of a recursive operation.
#[derive(Debug, Clone, Serialize)]
pub struct RecursiveResult {
    pub operation: Operation,
    pub root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Nodes attempted.
    pub total: usize,
    pub succeeded: usize,
    /// Every node that did not fully succeed.
    pub failed: Vec<OperationOutcome>,
    /// The walk ended before the tree was exhausted.
    pub aborted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Walking,
    Aggregating,
    Completed,
}

/// Bookkeeping for one run.
struct Tally {
    phase: Phase,
    operation: Operation,
    root: String,
    destination: Option<String>,
    options: RecursiveOptions,
    total: usize,
    succeeded: usize,
    failed: Vec<OperationOutcome>,
    aborted: bool,
}

impl Tally {
    fn new(
        operation: Operation,
        root: &str,
        destination: Option<&str>,
        options: RecursiveOptions,
    ) -> Self {
        let mut tally = Self {
            phase: Phase::Pending,
            operation,
            root: root.to_string(),
            destination: destination.map(str::to_string),
            options,
            total: 0,
            succeeded: 0,
            failed: Vec::new(),
            aborted: false,
        };
        tally.advance(Phase::Walking);
        tally
    }

    fn advance(&mut self, to: Phase) {
        debug!(
            operation = ?self.operation,
            root = %self.root,
            from = ?self.phase,
            to = ?to,
            "recursive phase"
        );
        self.phase = to;
    }

    /// Record one outcome. Returns whether the node fully succeeded.
    fn record(&mut self, outcome: OperationOutcome) -> bool {
        self.total += 1;
        if outcome.status == OutcomeStatus::Succeeded {
            self.succeeded += 1;
            return true;
        }
        warn!(
            operation = ?self.operation,
            path = %outcome.path,
            status = ?outcome.status,
            error = outcome.error.as_ref().map(|e| e.detail.as_str()).unwrap_or_default(),
            "recursive node did not succeed"
        );
        self.failed.push(outcome);
        false
    }

    fn should_stop(&mut self, session: &Session) -> bool {
        if (self.options.fail_fast && !self.failed.is_empty()) || !session.is_connected() {
            self.aborted = true;
            return true;
        }
        false
    }

    fn finish(mut self) -> RecursiveResult {
        self.advance(Phase::Aggregating);
        let result = RecursiveResult {
            operation: self.operation,
            root: self.root.clone(),
            destination: self.destination.clone(),
            total: self.total,
            succeeded: self.succeeded,
            failed: std::mem::take(&mut self.failed),
            aborted: self.aborted,
        };
        self.advance(Phase::Completed);
        result
    }
}

/// Position of `path` below `root`, as produced by [`join_remote`] during the walk.
fn relative_to<'a>(root: &str, path: &'a str) -> &'a str {
    if path == root {
        return "";
    }
    if root == "." {
        return path;
    }
    let relative = if root.ends_with('/') {
        path.strip_prefix(root)
    } else {
        path.strip_prefix(root).and_then(|rest| rest.strip_prefix('/'))
    };
    relative.unwrap_or(path)
}

/// Map `path` under `root` onto the same relative position under `destination`.
fn retarget(root: &str, path: &str, destination: &str) -> String {
    let relative = relative_to(root, path);
    if relative.is_empty() {
        destination.to_string()
    } else {
        join_remote(destination, relative)
    }
}

/// Reject destinations equal to or nested inside the source.
fn check_disjoint(
    session: &Session,
    source: &str,
    destination: &str,
) -> ToolResult<(String, String)> {
    let source = trim_root(source);
    let destination = trim_root(destination);
    let abs_source = session.absolute(&source);
    let abs_destination = session.absolute(&destination);
    let inside = format!("{}/", abs_source.trim_end_matches('/'));
    if abs_destination == abs_source || abs_destination.starts_with(&inside) {
        return Err(ToolError::InvalidArgument(format!(
            "destination {destination} lies inside source {source}"
        )));
    }
    Ok((source, destination))
}

/// Delete a tree bottom-up.
pub fn delete_recursive(
    session: &mut Session,
    root: &str,
    options: RecursiveOptions,
) -> RecursiveResult {
    let mut walker = TreeWalker::new(root);
    let mut tally = Tally::new(Operation::Delete, walker.root(), None, options);
    // One flag per open directory: did any of its children fail?
    let mut open_dirs: Vec<bool> = Vec::new();

    while let Some(event) = walker.next_event(session) {
        let outcome = match event {
            WalkEvent::Enter(_) => {
                open_dirs.push(false);
                continue;
            }
            WalkEvent::Leaf(node) => {
                let result = session.delete_file(&node.path);
                OperationOutcome::from_result(&node, result)
            }
            WalkEvent::Leave(node) => {
                let result = if open_dirs.pop().unwrap_or(false) {
                    Err(ToolError::DirectoryNotEmpty(format!(
                        "{} still holds entries that could not be deleted",
                        node.path
                    )))
                } else {
                    session.remove_directory(&node.path)
                };
                OperationOutcome::from_result(&node, result)
            }
            WalkEvent::Failed { node, error } => OperationOutcome::failed(&node, &error),
        };
        if !tally.record(outcome) {
            if let Some(parent_failed) = open_dirs.last_mut() {
                *parent_failed = true;
            }
        }
        if tally.should_stop(session) {
            walker.stop();
            break;
        }
    }
    tally.finish()
}

/// Copy a tree from `source` to `destination` on the same server.
pub fn copy_recursive(
    session: &mut Session,
    source: &str,
    destination: &str,
    options: RecursiveOptions,
    control: &TransferControl,
) -> ToolResult<RecursiveResult> {
    let (source, destination) = check_disjoint(session, source, destination)?;
    let mut walker = TreeWalker::new(&source);
    let mut tally = Tally::new(Operation::Copy, &source, Some(&destination), options);

    while let Some(event) = walker.next_event(session) {
        let outcome = match event {
            WalkEvent::Enter(node) => {
                let target = retarget(&source, &node.path, &destination);
                let result = session.ensure_directory(&target).map(|_| ());
                OperationOutcome::from_result(&node, result).with_destination(target)
            }
            WalkEvent::Leaf(node) => {
                let target = retarget(&source, &node.path, &destination);
                let result = session.copy_file(&node.path, &target, control).map(|_| ());
                OperationOutcome::from_result(&node, result).with_destination(target)
            }
            WalkEvent::Leave(_) => continue,
            WalkEvent::Failed { node, error } => OperationOutcome::failed(&node, &error),
        };
        tally.record(outcome);
        if tally.should_stop(session) {
            walker.stop();
            break;
        }
    }
    Ok(tally.finish())
}

struct MoveFrame {
    target: String,
    /// The directory's outcome was already recorded at `Enter`.
    recorded: bool,
    child_failed: bool,
}

/// Move a tree: copy each node, then remove the source once its copy exists.
pub fn move_recursive(
    session: &mut Session,
    source: &str,
    destination: &str,
    options: RecursiveOptions,
    control: &TransferControl,
) -> ToolResult<RecursiveResult> {
    let (source, destination) = check_disjoint(session, source, destination)?;
    let mut walker = TreeWalker::new(&source);
    let mut tally = Tally::new(Operation::Move, &source, Some(&destination), options);
    let mut open_dirs: Vec<MoveFrame> = Vec::new();

    while let Some(event) = walker.next_event(session) {
        let outcome = match event {
            WalkEvent::Enter(node) => {
                let target = retarget(&source, &node.path, &destination);
                match session.ensure_directory(&target) {
                    Ok(_) => {
                        open_dirs.push(MoveFrame {
                            target,
                            recorded: false,
                            child_failed: false,
                        });
                        continue;
                    }
                    Err(error) => {
                        if let Some(parent) = open_dirs.last_mut() {
                            parent.child_failed = true;
                        }
                        open_dirs.push(MoveFrame {
                            target: target.clone(),
                            recorded: true,
                            child_failed: true,
                        });
                        tally.record(OperationOutcome::moved(&node, target, Err(error), None));
                        if tally.should_stop(session) {
                            walker.stop();
                            break;
                        }
                        continue;
                    }
                }
            }
            WalkEvent::Leaf(node) => {
                let target = retarget(&source, &node.path, &destination);
                match session.copy_file(&node.path, &target, control) {
                    Ok(_) => {
                        let deleted = session.delete_file(&node.path);
                        OperationOutcome::moved(&node, target, Ok(()), Some(deleted))
                    }
                    Err(error) => OperationOutcome::moved(&node, target, Err(error), None),
                }
            }
            WalkEvent::Leave(node) => {
                let Some(frame) = open_dirs.pop() else {
                    continue;
                };
                if frame.recorded {
                    continue;
                }
                let removed = if frame.child_failed {
                    Err(ToolError::DirectoryNotEmpty(format!(
                        "{} kept because some entries were not moved",
                        node.path
                    )))
                } else {
                    session.remove_directory(&node.path)
                };
                OperationOutcome::moved(&node, frame.target, Ok(()), Some(removed))
            }
            WalkEvent::Failed { node, error } => {
                let target = retarget(&source, &node.path, &destination);
                OperationOutcome::failed(&node, &error).with_destination(target)
            }
        };
        if !tally.record(outcome) {
            if let Some(parent) = open_dirs.last_mut() {
                parent.child_failed = true;
            }
        }
        if tally.should_stop(session) {
            walker.stop();
            break;
        }
    }
    Ok(tally.finish())
}
