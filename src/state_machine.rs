use super::log::Index;
use core::fmt::Debug;

/// The replicated state machine fed by committed log entries.
///
/// `apply` must be deterministic: every server applies the same commands in the same order and must end up in the
/// same state, so anything time dependent has to travel inside the command.
pub trait StateMachine: Unpin + 'static {
    type Command: Clone + Debug + Send + Unpin + 'static;
    type Output: Debug + Send + 'static;

    fn apply(&mut self, index: Index, command: &Self::Command) -> Self::Output;

    /// A command the leader proposes on its own every housekeeping interval, if any
    fn housekeeping(&self, _now_ms: u64) -> Option<Self::Command> {
        None
    }
}
