use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::prelude::*;

const TASK_LOG_MAX_LINES: usize = 256;
// Consecutive rejections from one member before the task reports itself stalled.
pub(crate) const REJECTIONS_BEFORE_STALLED: u32 = 3;

#[derive(Default)]
struct TaskStatusInner {
    phase: String,
    log: Vec<String>,
    status: String,
    current_item: u64,
    total_items: u64,
    last_error: Option<String>,
    rejections: BTreeMap<ReplicaId, u32>,
}

impl TaskStatusInner {
    fn stalled_on(&self) -> Vec<ReplicaId> {
        self.rejections
            .iter()
            .filter(|(_, count)| **count >= REJECTIONS_BEFORE_STALLED)
            .map(|(rid, _)| *rid)
            .collect()
    }
}

/// The administrator visible state of one clean or abort instance. The driving state
/// machine writes to it, and any number of handles read it.
pub struct TaskStatus {
    kind: TaskKind,
    key: TaskKey,
    inner: Mutex<TaskStatusInner>,
    exit: watch::Sender<Option<TaskExitCode>>,
}

impl TaskStatus {
    pub(crate) fn new(kind: TaskKind, key: TaskKey) -> Arc<Self> {
        let (exit, _) = watch::channel(None);
        Arc::new(TaskStatus {
            kind,
            key,
            inner: Mutex::new(TaskStatusInner::default()),
            exit,
        })
    }

    pub(crate) fn log<S: Into<String>>(&self, line: S) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.log.len() >= TASK_LOG_MAX_LINES {
                inner.log.remove(0);
            }
            inner.log.push(line.into());
        }
    }

    pub(crate) fn set_phase<P: Display>(&self, phase: P) {
        let phase = phase.to_string();
        if let Ok(mut inner) = self.inner.lock() {
            if inner.phase == phase {
                return;
            }
            inner.phase.clone_from(&phase);
            inner.status = format!("{} {}", self.kind, phase);
        }
        self.log(format!("Entering phase {phase}"));
    }

    pub(crate) fn set_status<S: Into<String>>(&self, status: S) {
        if let Ok(mut inner) = self.inner.lock() {
            let stalled = inner.stalled_on();
            inner.status = if stalled.is_empty() {
                status.into()
            } else {
                let members: Vec<String> = stalled.iter().map(|r| r.to_string()).collect();
                format!(
                    "{} (stalled, rejected by member {})",
                    status.into(),
                    members.join(", ")
                )
            };
        }
    }

    /// Note that a request to `target` failed. Rejections are counted per member until
    /// that member next accepts a request.
    pub(crate) fn record_send_error(&self, target: ReplicaId, err: &SendError) {
        let mut line = None;
        if let Ok(mut inner) = self.inner.lock() {
            inner.last_error = Some(format!("member {target}: {err}"));
            if let SendError::Rejected(reason) = err {
                let count = {
                    let count = inner.rejections.entry(target).or_insert(0);
                    *count += 1;
                    *count
                };
                if count == 1 || count == REJECTIONS_BEFORE_STALLED {
                    line = Some(format!(
                        "Member {target} rejected the request ({count} in a row): {reason}"
                    ));
                }
            }
        }
        if let Some(line) = line {
            self.log(line);
        }
    }

    pub(crate) fn record_send_ok(&self, target: ReplicaId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.rejections.remove(&target);
        }
    }

    pub(crate) fn set_progress(&self, current: usize, total: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.current_item = current as u64;
            inner.total_items = total as u64;
        }
    }

    /// Record the terminal outcome. Only the first outcome is kept.
    pub(crate) fn finish(&self, code: TaskExitCode) {
        if self.exit.borrow().is_some() {
            return;
        }
        if let Ok(mut inner) = self.inner.lock() {
            inner.rejections.clear();
        }
        self.log(format!("Task finished with exit code {}", code.as_code()));
        self.set_status(match &code {
            TaskExitCode::Success => "done".to_string(),
            TaskExitCode::Aborted => "aborted".to_string(),
            TaskExitCode::Superseded => "superseded".to_string(),
            TaskExitCode::Failed(e) => format!("failed - {e}"),
        });
        self.exit.send_replace(Some(code));
    }

    pub fn exit_code(&self) -> Option<TaskExitCode> {
        self.exit.borrow().clone()
    }

    pub fn snapshot(&self) -> TaskStatusSnapshot {
        let exit_code = self.exit_code();
        match self.inner.lock() {
            Ok(inner) => TaskStatusSnapshot {
                kind: self.kind,
                key: self.key.clone(),
                phase: inner.phase.clone(),
                log: inner.log.clone(),
                status: inner.status.clone(),
                exit_code,
                current_item: inner.current_item,
                total_items: inner.total_items,
                last_error: inner.last_error.clone(),
                stalled: !inner.stalled_on().is_empty(),
            },
            Err(_) => TaskStatusSnapshot {
                kind: self.kind,
                key: self.key.clone(),
                phase: String::new(),
                log: Vec::new(),
                status: "status unavailable".to_string(),
                exit_code,
                current_item: 0,
                total_items: 0,
                last_error: None,
                stalled: false,
            },
        }
    }
}

/// A handle to a submitted task. Cloning the handle is cheap and every clone observes
/// the same status.
#[derive(Clone)]
pub struct TaskHandle {
    status: Arc<TaskStatus>,
}

impl TaskHandle {
    pub(crate) fn new(status: Arc<TaskStatus>) -> Self {
        TaskHandle { status }
    }

    pub fn key(&self) -> &TaskKey {
        &self.status.key
    }

    pub fn kind(&self) -> TaskKind {
        self.status.kind
    }

    pub fn snapshot(&self) -> TaskStatusSnapshot {
        self.status.snapshot()
    }

    pub fn exit_code(&self) -> Option<TaskExitCode> {
        self.status.exit_code()
    }

    /// Resolves once the task reaches a terminal state. A task interrupted by a server
    /// shutdown never resolves through this handle. Its successor is found on the
    /// restarted node.
    pub async fn wait(&self) -> TaskExitCode {
        let mut rx = self.status.exit.subscribe();
        let code = match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => (*code)
                .clone()
                .unwrap_or(TaskExitCode::Failed(OperationError::InvalidState)),
            Err(_) => TaskExitCode::Failed(OperationError::QueueDisconnected),
        };
        code
    }
}
