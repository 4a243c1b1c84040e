//! Per-user LIFO stacks of pending reservations.
//!
//! CANCEL and COMMIT always act on the most recent pending op, so each user
//! gets a plain LIFO stack per op type. Popping an empty stack is not an
//! error; it just reports that there is nothing pending.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct ReservationStack<T> {
    entries: Vec<T>,
}

impl<T> Default for ReservationStack<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> ReservationStack<T> {
    pub fn push(&mut self, entry: T) {
        self.entries.push(entry);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop()
    }

    pub fn peek(&self) -> Option<&T> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.entries)
    }
}

/// All users' stacks of one pending-op type, each behind its own lock.
///
/// The per-user lock is only held for push/pop/peek, never across I/O.
pub struct UserStacks<T> {
    stacks: RwLock<HashMap<String, Arc<Mutex<ReservationStack<T>>>>>,
}

impl<T> UserStacks<T> {
    pub fn new() -> Self {
        Self {
            stacks: RwLock::new(HashMap::new()),
        }
    }

    fn stack_for(&self, user: &str) -> Arc<Mutex<ReservationStack<T>>> {
        if let Some(stack) = self.stacks.read().get(user) {
            return Arc::clone(stack);
        }
        Arc::clone(
            self.stacks
                .write()
                .entry(user.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ReservationStack::default()))),
        )
    }

    pub fn push(&self, user: &str, entry: T) {
        self.stack_for(user).lock().push(entry);
    }

    pub fn pop(&self, user: &str) -> Option<T> {
        // Popping must not materialize a stack for an unknown user.
        let stack = self.stacks.read().get(user).cloned();
        stack.and_then(|stack| stack.lock().pop())
    }

    pub fn len(&self, user: &str) -> usize {
        self.stacks
            .read()
            .get(user)
            .map_or(0, |stack| stack.lock().len())
    }

    /// Drain every stack whose most recent entry predates `cutoff_ms`.
    ///
    /// Entries are pushed in time order, so a stale top implies the whole
    /// stack is stale; the sweep reverses all of it.
    pub fn drain_stale(
        &self,
        cutoff_ms: i64,
        created_ms: impl Fn(&T) -> i64,
    ) -> Vec<(String, Vec<T>)> {
        let stacks: Vec<(String, Arc<Mutex<ReservationStack<T>>>)> = self
            .stacks
            .read()
            .iter()
            .map(|(user, stack)| (user.clone(), Arc::clone(stack)))
            .collect();

        let mut drained = Vec::new();
        for (user, stack) in stacks {
            let mut guard = stack.lock();
            let stale = guard.peek().is_some_and(|top| created_ms(top) < cutoff_ms);
            if stale {
                drained.push((user, guard.drain_all()));
            }
        }
        drained
    }
}

impl<T> Default for UserStacks<T> {
    fn default() -> Self {
        Self::new()
    }
}
