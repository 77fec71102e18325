//! # state_machine
//!
//! why: the application the replicated log drives
//! relations: called by engine.rs once per committed command
//! what: StateMachine trait, closure impl

/// Applies committed commands, exactly once each and in index order.
///
/// Apply runs on the engine task, so it should be quick. Commands are
/// replayed from index 1 after a restart, so apply must be deterministic.
pub trait StateMachine: Send + 'static {
    /// Apply the command committed at `index` and return its output
    fn apply(&mut self, index: u64, command: &[u8]) -> Vec<u8>;
}

impl<F> StateMachine for F
where
    F: FnMut(u64, &[u8]) -> Vec<u8> + Send + 'static,
{
    fn apply(&mut self, index: u64, command: &[u8]) -> Vec<u8> {
        self(index, command)
    }
}
