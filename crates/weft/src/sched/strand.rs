// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand objects and lifecycle: spawn, join, detach, exit.
//!
//! A strand is one cooperative thread of execution. Its entry closure
//! runs under a trampoline that catches panics and performs the full
//! termination sequence when the closure returns, so user code never has
//! to call anything to die cleanly. The return value travels through a
//! write-once slot shared with the strand's `JoinHandle`.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{Error, Result};
use crate::sched::ctx::Context;
use crate::sched::{current_ctx, SchedCore};

/// Strand identity. Process-unique, strictly increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StrandId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl StrandId {
    pub(crate) fn next() -> StrandId {
        StrandId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StrandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states. ZOMBIE holds the return value until reaped; DEAD is
/// the post-reap state (the strand is already out of the table by then).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StrandState {
    Runnable,
    Running,
    Blocked,
    Zombie,
    Dead,
}

/// One cooperative thread. Shared (`Arc`) between the owning scheduler
/// table, the run queue, channel wait queues, and join handles. All
/// mutable lifecycle state lives in the scheduler table entry, guarded by
/// the instance lock; the fields here are either immutable or leaf locks.
pub(crate) struct Strand {
    pub(crate) id: StrandId,
    pub(crate) ctx: Context,
    pub(crate) sched: Arc<SchedCore>,
    /// Direct-delivery slot for channel handoffs.
    pub(crate) mailbox: Mutex<Option<crate::chan::Message>>,
}

impl Strand {
    pub(crate) fn new(sched: Arc<SchedCore>) -> Arc<Strand> {
        Arc::new(Strand {
            id: StrandId::next(),
            ctx: Context::new(),
            sched,
            mailbox: Mutex::new(None),
        })
    }
}

/// Write-once return slot. `Err` carries a panic message.
pub(crate) struct ResultSlot<T> {
    inner: Mutex<Option<std::result::Result<T, String>>>,
}

impl<T> ResultSlot<T> {
    fn new() -> Self {
        ResultSlot {
            inner: Mutex::new(None),
        }
    }

    fn set(&self, value: std::result::Result<T, String>) {
        let mut slot = self.inner.lock().unwrap();
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    fn take(&self) -> Option<std::result::Result<T, String>> {
        self.inner.lock().unwrap().take()
    }
}

/// Unwind payload used by [`exit`]: carries the strand's return value out
/// through the trampoline, or through the root frame of
/// [`run`](crate::run), without running the panic hook.
pub(crate) struct ExitUnwind {
    pub(crate) value: Box<dyn Any + Send>,
}

/// Terminate the calling strand with `value` as its return value, exactly
/// as if its entry closure had returned it. The joiner (if any) is woken
/// and receives the value; the strand's object is retained until reaped.
/// From the root strand this ends [`run`](crate::run) itself, the exit
/// value standing in for the body's return value.
pub fn exit<T: Send + 'static>(value: T) -> ! {
    if current_ctx().is_none() {
        panic!("weft::exit called outside a runtime");
    }
    panic::resume_unwind(Box::new(ExitUnwind {
        value: Box::new(value),
    }));
}

/// Identity of the running strand. Panics outside a runtime.
pub fn current() -> StrandId {
    match current_ctx() {
        Some(ctx) => ctx.strand.id,
        None => panic!("weft::current called outside a runtime"),
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn a strand on the current scheduler instance. The new strand goes
/// to the run-queue tail; the caller keeps running until it yields or
/// blocks. Fails with `ResourceExhausted` if the context's stack cannot
/// be allocated.
pub fn spawn<T, F>(f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let ctx = current_ctx()
        .ok_or(Error::InvalidOperation("spawn outside a runtime"))?;
    spawn_on(&ctx.sched, f)
}

/// Spawn onto a specific instance. The scheduler-facing half of [`spawn`].
pub(crate) fn spawn_on<T, F>(sched: &Arc<SchedCore>, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let strand = Strand::new(sched.clone());
    let slot = Arc::new(ResultSlot::new());

    let carrier = {
        let strand = strand.clone();
        let slot = slot.clone();
        let sched = sched.clone();
        thread::Builder::new()
            .name(format!("weft-strand-{}", strand.id))
            .stack_size(sched.stack_size)
            .spawn(move || trampoline(sched, strand, slot, f))
    };
    if let Err(e) = carrier {
        return Err(Error::ResourceExhausted(format!(
            "strand stack allocation: {e}"
        )));
    }
    // The carrier's own OS handle is dropped: its lifetime ends when the
    // strand dies and the trampoline returns.

    sched.register_runnable(&strand);
    log::trace!("spawned strand {}", strand.id);
    Ok(JoinHandle {
        strand,
        slot,
        consumed: false,
    })
}

/// Carrier body: park until first scheduled, run the closure, then
/// perform the termination sequence and hand the instance to the next
/// runnable strand. The carrier exits afterwards, releasing the stack;
/// the strand object lives on until reaped.
fn trampoline<T, F>(sched: Arc<SchedCore>, strand: Arc<Strand>, slot: Arc<ResultSlot<T>>, f: F)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    crate::sched::bind_carrier(&sched, &strand);
    strand.ctx.pause();

    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    let result: std::result::Result<T, String> = match outcome {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<ExitUnwind>() {
            Ok(early) => match early.value.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => Err("exit value type mismatch".to_string()),
            },
            Err(payload) => Err(panic_message(payload.as_ref())),
        },
    };
    slot.set(result);
    sched.finish_current(&strand);
}

/// Owner's handle to a spawned strand.
///
/// `join` consumes the handle, so each strand has at most one joiner by
/// construction. Dropping the handle without joining detaches the strand:
/// it reaps itself at death and its return value is discarded.
pub struct JoinHandle<T> {
    strand: Arc<Strand>,
    slot: Arc<ResultSlot<T>>,
    consumed: bool,
}

impl<T: Send + 'static> JoinHandle<T> {
    pub fn id(&self) -> StrandId {
        self.strand.id
    }

    /// Wait for the strand to die and take its return value.
    ///
    /// A ZOMBIE target is reaped immediately without blocking. Otherwise
    /// the caller registers as the sole joiner and blocks until the
    /// target's termination wakes it. Fails with `InvalidOperation` if
    /// the caller is the target (a handle can travel into its own strand
    /// over a channel).
    pub fn join(mut self) -> Result<T> {
        let ctx = current_ctx()
            .ok_or(Error::InvalidOperation("join outside a runtime"))?;
        if ctx.strand.id == self.strand.id {
            return Err(Error::InvalidOperation("strand cannot join itself"));
        }

        loop {
            if self.strand.sched.reap_or_register_joiner(&self.strand, &ctx.strand)? {
                break;
            }
            ctx.sched.block_current(&ctx.strand);
        }
        self.consumed = true;

        match self.slot.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(msg)) => Err(Error::Panicked(msg)),
            // The slot is always written before the ZOMBIE transition.
            None => Err(Error::Panicked("strand finished without a result".to_string())),
        }
    }

    /// Give up the return value; the strand reaps itself at death.
    pub fn detach(mut self) {
        self.consumed = true;
        self.strand.sched.detach(&self.strand);
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if !self.consumed {
            self.strand.sched.detach(&self.strand);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan::{Chan, Message};
    use crate::sched::run;
    use crate::yield_now;

    #[test]
    fn join_returns_value() {
        let out = run(|| {
            let h = spawn(|| 6 * 7).unwrap();
            h.join().unwrap()
        });
        assert_eq!(out, 42);
    }

    #[test]
    fn join_on_zombie_is_immediate() {
        run(|| {
            let h = spawn(|| "done").unwrap();
            // Let the strand run to completion first.
            yield_now();
            assert_eq!(h.join().unwrap(), "done");
        });
    }

    #[test]
    fn join_blocks_until_target_dies() {
        run(|| {
            let order = Arc::new(Mutex::new(Vec::new()));
            let o = order.clone();
            let h = spawn(move || {
                o.lock().unwrap().push("strand ran");
            })
            .unwrap();
            h.join().unwrap();
            order.lock().unwrap().push("join returned");
            assert_eq!(
                *order.lock().unwrap(),
                vec!["strand ran", "join returned"]
            );
        });
    }

    #[test]
    fn self_join_is_invalid() {
        run(|| {
            let pipe = Chan::new(1);
            let errs = Chan::new(1);
            let (pipe2, errs2) = (pipe.clone(), errs.clone());
            let h = spawn(move || {
                let me: JoinHandle<()> = pipe2
                    .receive()
                    .unwrap()
                    .downcast()
                    .expect("expected own handle");
                let err = me.join().unwrap_err();
                errs2.send(Message::data(err)).unwrap();
            })
            .unwrap();
            pipe.send(Message::data(h)).unwrap();
            let err: Error = errs.receive().unwrap().downcast().unwrap();
            assert_eq!(
                err,
                Error::InvalidOperation("strand cannot join itself")
            );
        });
    }

    #[test]
    fn panic_surfaces_through_join() {
        run(|| {
            let h = spawn(|| -> i32 { panic!("boom in strand") }).unwrap();
            match h.join() {
                Err(Error::Panicked(msg)) => assert_eq!(msg, "boom in strand"),
                other => panic!("expected panic error, got {other:?}"),
            }
        });
    }

    #[test]
    fn exit_mid_closure_delivers_value() {
        let out = run(|| {
            let h = spawn(|| -> i32 {
                exit(123i32);
            })
            .unwrap();
            h.join().unwrap()
        });
        assert_eq!(out, 123);
    }

    #[test]
    fn exit_value_type_mismatch_is_an_error() {
        run(|| {
            let h = spawn(|| -> i32 {
                exit("wrong type");
            })
            .unwrap();
            match h.join() {
                Err(Error::Panicked(msg)) => {
                    assert_eq!(msg, "exit value type mismatch")
                }
                other => panic!("expected mismatch error, got {other:?}"),
            }
        });
    }

    #[test]
    fn ids_strictly_increase() {
        run(|| {
            let a = spawn(|| ()).unwrap();
            let b = spawn(|| ()).unwrap();
            let c = spawn(|| ()).unwrap();
            assert!(a.id() < b.id() && b.id() < c.id());
            for h in [a, b, c] {
                h.join().unwrap();
            }
        });
    }

    #[test]
    fn detached_strand_reaps_itself() {
        run(|| {
            let h = spawn(|| ()).unwrap();
            h.detach();
            yield_now(); // let it run and die
            let info = crate::sched::info();
            assert_eq!(info.zombies, 0, "detached strand must not linger");
        });
    }

    #[test]
    fn current_reports_spawned_id() {
        run(|| {
            let h = spawn(current).unwrap();
            let id = h.id();
            assert_eq!(h.join().unwrap(), id);
        });
    }
}
