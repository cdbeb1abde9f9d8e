use crate::prelude::OperationError;

pub(crate) mod abort;
pub mod channel;
pub(crate) mod clean;
pub mod node;
pub mod registry;
pub mod ruv;
pub mod status;
pub mod tasks;

#[cfg(test)]
mod tests;

/// Signals broadcast to every worker of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreAction {
    Shutdown,
}

/// Why a running state machine stopped driving its phases.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// The node is stopping. Persisted state is left for the next start.
    Shutdown,
    Abort,
    Superseded,
    Failed(OperationError),
}

impl From<OperationError> for Interrupt {
    fn from(e: OperationError) -> Self {
        Interrupt::Failed(e)
    }
}
