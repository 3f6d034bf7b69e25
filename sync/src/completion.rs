// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::Condvar;
use crate::Mutex;

/// A one-way rendezvous between a completing side and any number of waiters.
///
/// `complete` marks the completion done and wakes every waiter; the done
/// state is sticky, so a `wait` that starts after the completion returns
/// immediately. A waiter that needs to observe a *fresh* completion calls
/// `reinit` before re-checking whatever condition it is waiting out.
#[derive(Default)]
pub struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    pub fn new() -> Completion {
        Completion {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Clears the done state. Called by a waiter at the start of each
    /// wait-and-recheck iteration.
    pub fn reinit(&self) {
        *self.done.lock() = false;
    }

    /// Marks the completion done and wakes all current waiters.
    pub fn complete(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }

    /// Blocks until `complete` has been called since the last `reinit`.
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            done = self.cv.wait(done);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn complete_before_wait() {
        let c = Completion::new();
        c.complete();
        // Sticky: does not block.
        c.wait();
    }

    #[test]
    fn reinit_clears_done() {
        let c = Arc::new(Completion::new());
        c.complete();
        c.reinit();
        let c2 = c.clone();
        let waiter = thread::spawn(move || c2.wait());
        c.complete();
        waiter.join().unwrap();
    }
}
