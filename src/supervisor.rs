// =============================================================================
// Supervisor capability — breaks the manager/executor cyclic reference
// =============================================================================
//
// An executor holding a strong reference back to the manager that owns it
// would be circular and hard to reason about during shutdown. Instead the
// executor is handed only this narrow capability: a way to report "I'm done"
// so the manager can drop its handle, without the executor ever seeing the
// manager's full surface (start/stop/list for every other user's strategies).
// =============================================================================

use crate::types::InstanceKey;

pub trait Supervisor: Send + Sync {
    /// Called exactly once, from the executor's own task, right before its
    /// run loop returns — whether that was a clean `Stop` or an unrecoverable
    /// internal error.
    fn on_executor_finished(&self, key: &InstanceKey);
}
