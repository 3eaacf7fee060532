//! Scoped cleanup stacks.
//!
//! A [`CleanupStack`] releases its entries in reverse registration order, so
//! a resource acquired later is always released before the ones it may
//! depend on. Stacks are owned values passed down by reference; one dropped
//! without an explicit drain releases itself.

use tracing::debug;

type Action = Box<dyn FnOnce() + Send>;

/// An ordered list of deferred release actions, drained LIFO.
pub struct CleanupStack {
    name: &'static str,
    actions: Vec<Action>,
}

impl CleanupStack {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            actions: Vec::new(),
        }
    }

    /// Register an action to run when the stack is drained.
    pub fn push<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.actions.push(Box::new(action));
    }

    /// Run every registered action, most recent first.
    ///
    /// Draining an empty (or already drained) stack does nothing.
    pub fn drain(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        debug!(stack = self.name, count = self.actions.len(), "running cleanup");
        while let Some(action) = self.actions.pop() {
            action();
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.drain();
    }
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field("name", &self.name)
            .field("pending", &self.actions.len())
            .finish()
    }
}

/// The two stacks threaded through a run of the client.
#[derive(Debug)]
pub struct Cleanups {
    /// Released when the program exits, whatever path it took.
    pub on_exit: CleanupStack,
    /// Released once the session's stdio wiring is in place, before the
    /// final wait.
    pub after_login: CleanupStack,
}

impl Cleanups {
    pub fn new() -> Self {
        Self {
            on_exit: CleanupStack::new("on_exit"),
            after_login: CleanupStack::new("after_login"),
        }
    }
}

impl Default for Cleanups {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Cleanups {
    fn drop(&mut self) {
        // Login-scoped resources go before process-scoped ones.
        self.after_login.drain();
        self.on_exit.drain();
    }
}
