use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::error::{CompletionOutcome, CoordinatorError};

/// Shared scaffolding every state machine (producer, consumer, reference
/// hasher) embeds: a recorded-exceptions list and an internal cancellation
/// scope linked from the coordinator's global one.
///
/// Grounded on the host's `ShutdownState` (an atomic flag linked to a parent
/// `Notify`), generalized here from a single boolean to an exception
/// accumulator — `tokio_util`'s `CancellationToken::child_token` is the
/// idiomatic replacement for a hand-rolled linked-flag pair.
pub(crate) struct StateMachineCore {
    exceptions: Mutex<Vec<CoordinatorError>>,
    cancellation: CancellationToken,
}

impl StateMachineCore {
    pub(crate) fn new(global: &CancellationToken) -> Self {
        Self {
            exceptions: Mutex::new(Vec::new()),
            cancellation: global.child_token(),
        }
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Records an exception and fires this state machine's internal
    /// cancellation. The first exception is what flips the state machine
    /// from healthy to faulted; recording further ones just appends (the
    /// cancel call is idempotent).
    pub(crate) fn record(&self, error: CoordinatorError) {
        self.exceptions.lock().unwrap().push(error);
        self.cancellation.cancel();
    }

    pub(crate) fn faulted(&self) -> bool {
        !self.exceptions.lock().unwrap().is_empty()
    }

    pub(crate) fn outcome(&self) -> CompletionOutcome {
        let exceptions = self.exceptions.lock().unwrap().clone();
        CompletionOutcome::from_exceptions(exceptions)
    }
}
