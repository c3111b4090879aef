// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Execution contexts: the save/restore primitive under the scheduler.
//!
//! Each strand's context is a carrier OS thread parked on a permit
//! (mutex + condvar). `resume` grants the permit, `pause` consumes it.
//! The scheduler keeps exactly one carrier per instance unparked at a
//! time, which is what makes the runtime cooperative: control moves only
//! where a switch hands the permit. Everything context-specific lives in
//! this file so a machine-context backend could replace it without
//! touching the scheduler.

use std::sync::{Condvar, Mutex};

pub(crate) struct Context {
    permit: Mutex<bool>,
    cv: Condvar,
}

impl Context {
    pub(crate) fn new() -> Context {
        Context {
            permit: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Grant the permit, unparking the context's carrier. A grant that
    /// arrives before the carrier parks is not lost.
    pub(crate) fn resume(&self) {
        let mut granted = self.permit.lock().unwrap();
        *granted = true;
        self.cv.notify_one();
    }

    /// Park until the permit is granted, then consume it.
    pub(crate) fn pause(&self) {
        let mut granted = self.permit.lock().unwrap();
        while !*granted {
            granted = self.cv.wait(granted).unwrap();
        }
        *granted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn resume_before_pause_is_not_lost() {
        let ctx = Context::new();
        ctx.resume();
        ctx.pause(); // returns immediately, permit consumed
    }

    #[test]
    fn pause_waits_for_resume() {
        let ctx = Arc::new(Context::new());
        let ctx2 = ctx.clone();
        let waiter = thread::spawn(move || {
            ctx2.pause();
            true
        });
        ctx.resume();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn permit_is_consumed_by_pause() {
        let ctx = Arc::new(Context::new());
        ctx.resume();
        ctx.pause();
        // A second pause must wait for a fresh grant.
        let ctx2 = ctx.clone();
        let waiter = thread::spawn(move || ctx2.pause());
        ctx.resume();
        waiter.join().unwrap();
    }
}
