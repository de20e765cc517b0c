#![doc = r"Incremental tree reconciliation with lane-based cooperative scheduling."]

//! The engine keeps two buffers of a fiber tree: the committed "current"
//! tree backing live host nodes, and a work-in-progress tree built against
//! the next description. Updates carry priority lanes; a render pass
//! processes one batch of lanes, can yield between units of work, and can be
//! discarded wholesale when higher-priority work arrives. Completed trees
//! are committed to the host in one synchronous mutation pass.
//!
//! The host platform is abstracted behind [`HostAdapter`]; [`MemoryHost`]
//! is the in-memory reference implementation used by tests and demos.

pub mod collections;
mod commit;
pub mod element;
pub mod fiber;
pub mod hooks;
pub mod host;
pub mod lanes;
mod reconcile;
pub mod scheduler;

pub use element::{Component, Element, ElementKind, Key, PropValue, Props};
pub use fiber::{FiberId, Flags};
pub use hooks::{
    use_effect, use_layout_effect, use_memo, use_reducer, use_state, Dispatcher, StateSetter,
    Teardown,
};
pub use host::{
    HostAdapter, HostError, HostHandle, HostOp, MemoryHost, PropPatch, TaskId, TaskPriority,
};
pub use lanes::Lanes;
pub use scheduler::{Reconciler, RootHandle, UpdatePriority};

use std::fmt;

/// Errors surfaced by a render pass.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderError {
    /// The description is malformed (empty host tag, duplicate sibling key).
    InvalidElement { reason: String },
    /// A component body's hook calls desynchronized from its previous pass.
    HookMismatch {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
    /// The host adapter refused an operation.
    Host(HostError),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::InvalidElement { reason } => {
                write!(f, "invalid element description: {reason}")
            }
            RenderError::HookMismatch {
                index,
                expected,
                found,
            } => write!(
                f,
                "hook chain mismatch at slot {index}: expected {expected}, found {found}"
            ),
            RenderError::Host(err) => write!(f, "host operation failed: {err}"),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::Host(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HostError> for RenderError {
    fn from(err: HostError) -> Self {
        RenderError::Host(err)
    }
}

#[cfg(test)]
#[path = "tests/mount_tests.rs"]
mod mount_tests;

#[cfg(test)]
#[path = "tests/diff_tests.rs"]
mod diff_tests;

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod state_tests;

#[cfg(test)]
#[path = "tests/scheduling_tests.rs"]
mod scheduling_tests;

#[cfg(test)]
#[path = "tests/effect_tests.rs"]
mod effect_tests;
