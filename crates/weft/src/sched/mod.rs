// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative scheduler core.
//!
//! One `SchedCore` per bound kernel thread: a FIFO run queue, the strand
//! table owning every live strand created on the instance, and an idle
//! condvar for the moments when every strand is blocked. Strands never
//! migrate between instances; cross-instance interaction happens through
//! channels and the worker bridge, which reach in only via [`wake`].
//!
//! Scheduling invariant: exactly one RUNNING strand per instance. The
//! running strand's carrier holds the instance's only unparked context,
//! and every switch (`yield_current`, `block_current`, `finish_current`)
//! hands that role to exactly one successor.

pub(crate) mod ctx;
pub mod strand;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::config::Config;
use crate::error::{Error, Result};
use self::strand::{panic_message, ExitUnwind, Strand, StrandId, StrandState};

/// Scheduler instance state shared by its strands' carriers and by
/// cross-instance wakers.
pub(crate) struct SchedCore {
    pub(crate) id: u64,
    pub(crate) stack_size: usize,
    state: Mutex<Core>,
    /// Signalled when the run queue gains an entry while the instance
    /// idles (all strands blocked). At most one carrier waits here.
    idle_cv: Condvar,
}

struct Core {
    run_queue: VecDeque<Arc<Strand>>,
    table: HashMap<StrandId, StrandEntry>,
    created: u64,
}

/// Per-strand lifecycle state, guarded by the instance lock.
struct StrandEntry {
    strand: Arc<Strand>,
    state: StrandState,
    /// A wake arrived while the strand was RUNNING; consumed by its next
    /// `block_current` so the wake is not lost.
    wake_pending: bool,
    joiner: Option<Arc<Strand>>,
    detached: bool,
}

impl Core {
    fn entry_mut(&mut self, id: StrandId) -> &mut StrandEntry {
        self.table
            .get_mut(&id)
            .expect("strand missing from scheduler table")
    }

    /// Remove a strand from the table. Removal is the DEAD transition;
    /// the object itself drops when the last outside reference does.
    fn reap(&mut self, id: StrandId) {
        if let Some(mut entry) = self.table.remove(&id) {
            entry.state = StrandState::Dead;
        }
    }
}

impl SchedCore {
    fn new(config: &Config) -> Arc<SchedCore> {
        static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);
        Arc::new(SchedCore {
            id: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            stack_size: config.stack_bytes(),
            state: Mutex::new(Core {
                run_queue: VecDeque::new(),
                table: HashMap::new(),
                created: 0,
            }),
            idle_cv: Condvar::new(),
        })
    }

    /// Insert a freshly spawned strand at the run-queue tail.
    pub(crate) fn register_runnable(&self, strand: &Arc<Strand>) {
        let mut core = self.state.lock().unwrap();
        core.created += 1;
        core.table.insert(
            strand.id,
            StrandEntry {
                strand: strand.clone(),
                state: StrandState::Runnable,
                wake_pending: false,
                joiner: None,
                detached: false,
            },
        );
        core.run_queue.push_back(strand.clone());
    }

    /// Adopt the bound kernel thread itself as the instance's first
    /// strand. It is RUNNING from the start and never sits in the queue.
    fn register_root(&self, strand: &Arc<Strand>) {
        let mut core = self.state.lock().unwrap();
        core.created += 1;
        core.table.insert(
            strand.id,
            StrandEntry {
                strand: strand.clone(),
                state: StrandState::Running,
                wake_pending: false,
                joiner: None,
                detached: false,
            },
        );
    }

    /// Re-queue the caller at the tail and switch to the queue head.
    /// With no other runnable strand this returns immediately.
    pub(crate) fn yield_current(&self, cur: &Arc<Strand>) {
        let next = {
            let mut core = self.state.lock().unwrap();
            let next = match core.run_queue.pop_front() {
                Some(next) => next,
                None => return,
            };
            core.entry_mut(next.id).state = StrandState::Running;
            core.entry_mut(cur.id).state = StrandState::Runnable;
            core.run_queue.push_back(cur.clone());
            next
        };
        next.ctx.resume();
        cur.ctx.pause();
    }

    /// Mark the caller BLOCKED and switch to the next runnable strand,
    /// idling the instance if there is none. A wake that raced ahead of
    /// the block (pending token) is consumed instead. Callers wrap this
    /// in a loop that re-checks their wait condition.
    pub(crate) fn block_current(&self, cur: &Arc<Strand>) {
        let next = {
            let mut core = self.state.lock().unwrap();
            {
                let entry = core.entry_mut(cur.id);
                if entry.wake_pending {
                    entry.wake_pending = false;
                    return;
                }
                entry.state = StrandState::Blocked;
            }
            loop {
                match core.run_queue.pop_front() {
                    // Woken while idling: resume in place, no switch.
                    Some(next) if next.id == cur.id => {
                        core.entry_mut(cur.id).state = StrandState::Running;
                        return;
                    }
                    Some(next) => {
                        core.entry_mut(next.id).state = StrandState::Running;
                        break next;
                    }
                    None => core = self.idle_cv.wait(core).unwrap(),
                }
            }
        };
        next.ctx.resume();
        cur.ctx.pause();
    }

    /// Termination tail called from the trampoline after the return slot
    /// is written: ZOMBIE transition, joiner wake, and the final handoff.
    /// Does not return control to the strand; the carrier exits after the
    /// handoff, which releases the execution stack.
    pub(crate) fn finish_current(&self, cur: &Arc<Strand>) {
        let joiner = {
            let mut core = self.state.lock().unwrap();
            let (joiner, detached) = {
                let entry = core.entry_mut(cur.id);
                entry.state = StrandState::Zombie;
                (entry.joiner.take(), entry.detached)
            };
            if detached {
                core.reap(cur.id);
            }
            joiner
        };
        log::trace!("strand {} finished", cur.id);
        if let Some(joiner) = joiner {
            wake(&joiner);
        }
        let next = {
            let mut core = self.state.lock().unwrap();
            loop {
                match core.run_queue.pop_front() {
                    Some(next) => {
                        core.entry_mut(next.id).state = StrandState::Running;
                        break next;
                    }
                    None => core = self.idle_cv.wait(core).unwrap(),
                }
            }
        };
        next.ctx.resume();
    }

    /// Join-side handshake. Reaps and reports `true` if the target is
    /// already a ZOMBIE; otherwise registers `joiner` as the sole joiner
    /// and reports `false` (the caller must block and retry).
    pub(crate) fn reap_or_register_joiner(
        &self,
        target: &Arc<Strand>,
        joiner: &Arc<Strand>,
    ) -> Result<bool> {
        let mut core = self.state.lock().unwrap();
        match core.table.get_mut(&target.id) {
            // Already reaped elsewhere; the result slot settles it.
            None => Ok(true),
            Some(entry) if entry.state == StrandState::Zombie => {
                core.reap(target.id);
                Ok(true)
            }
            Some(entry) => match &entry.joiner {
                Some(existing) if existing.id != joiner.id => {
                    Err(Error::InvalidOperation("strand already has a joiner"))
                }
                _ => {
                    entry.joiner = Some(joiner.clone());
                    Ok(false)
                }
            },
        }
    }

    /// Drop interest in a strand's result. ZOMBIEs are reaped on the
    /// spot; live strands reap themselves at death.
    pub(crate) fn detach(&self, strand: &Arc<Strand>) {
        let mut core = self.state.lock().unwrap();
        match core.table.get_mut(&strand.id) {
            None => {}
            Some(entry) if entry.state == StrandState::Zombie => core.reap(strand.id),
            Some(entry) => entry.detached = true,
        }
    }
}

/// Make a strand runnable again. Callable from any OS thread: other
/// instances, bridge workers, whoever holds the reference.
///
/// BLOCKED targets go to their instance's run-queue tail; a RUNNING
/// target gets a pending token (it is about to block); RUNNABLE, ZOMBIE,
/// and reaped targets ignore the wake.
pub(crate) fn wake(strand: &Arc<Strand>) {
    let sched = &strand.sched;
    let mut guard = sched.state.lock().unwrap();
    let core = &mut *guard;
    if let Some(entry) = core.table.get_mut(&strand.id) {
        match entry.state {
            StrandState::Blocked => {
                entry.state = StrandState::Runnable;
                let runnable = entry.strand.clone();
                core.run_queue.push_back(runnable);
                sched.idle_cv.notify_one();
            }
            StrandState::Running => entry.wake_pending = true,
            StrandState::Runnable | StrandState::Zombie | StrandState::Dead => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Per-kernel-thread binding

#[derive(Clone)]
pub(crate) struct CurrentCtx {
    pub(crate) sched: Arc<SchedCore>,
    pub(crate) strand: Arc<Strand>,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentCtx>> = RefCell::new(None);
}

pub(crate) fn current_ctx() -> Option<CurrentCtx> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) fn current_strand() -> Option<Arc<Strand>> {
    current_ctx().map(|c| c.strand)
}

/// Bind a carrier OS thread to the strand it hosts. Carriers host one
/// strand for life, so this is set once per thread.
pub(crate) fn bind_carrier(sched: &Arc<SchedCore>, strand: &Arc<Strand>) {
    CURRENT.with(|c| {
        *c.borrow_mut() = Some(CurrentCtx {
            sched: sched.clone(),
            strand: strand.clone(),
        })
    });
}

fn clear_binding() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

// ---------------------------------------------------------------------------
// Instance lifecycle

/// Bind the calling OS thread as a scheduler instance and run `f` as its
/// root strand. Returns `f`'s value after every other strand on the
/// instance has run to completion (unjoined ZOMBIEs are discarded). An
/// early [`strand::exit`] from the root body ends the run the same way,
/// the exit value standing in for the return value.
///
/// Panics if the thread already hosts an instance. A strand population
/// that blocks forever makes this hang; deadlock is not detected.
pub fn run<T: 'static>(f: impl FnOnce() -> T) -> T {
    run_with(Config::default(), f)
}

/// [`run`] with explicit configuration.
pub fn run_with<T: 'static>(config: Config, f: impl FnOnce() -> T) -> T {
    enter(config, f)
}

fn enter<T: 'static>(config: Config, f: impl FnOnce() -> T) -> T {
    if current_ctx().is_some() {
        panic!("weft runtime already bound to this thread");
    }
    let sched = SchedCore::new(&config);
    let root = Strand::new(sched.clone());
    sched.register_root(&root);
    bind_carrier(&sched, &root);
    log::debug!("scheduler instance {} up (root strand {})", sched.id, root.id);

    let value = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        // The root frame plays the trampoline's part: an exit unwind
        // settles here and its value stands in for the body's return.
        Err(payload) => match payload.downcast::<ExitUnwind>() {
            Ok(early) => match early.value.downcast::<T>() {
                Ok(value) => *value,
                Err(_) => {
                    clear_binding();
                    panic!("exit value type mismatch");
                }
            },
            Err(payload) => {
                clear_binding();
                panic::resume_unwind(payload);
            }
        },
    };
    drain(&sched, &root);
    teardown(&sched);
    clear_binding();
    log::debug!("scheduler instance {} down", sched.id);
    value
}

/// Keep scheduling until no strand besides the root is RUNNABLE or
/// BLOCKED. Blocked strands are waited out: their wakes arrive from
/// other instances or bridge workers.
fn drain(sched: &Arc<SchedCore>, root: &Arc<Strand>) {
    loop {
        sched.yield_current(root);
        let done = {
            let mut core = sched.state.lock().unwrap();
            loop {
                let live = core.table.iter().any(|(id, entry)| {
                    *id != root.id
                        && matches!(
                            entry.state,
                            StrandState::Runnable | StrandState::Running | StrandState::Blocked
                        )
                });
                if !live {
                    break true;
                }
                if !core.run_queue.is_empty() {
                    break false;
                }
                core = sched.idle_cv.wait(core).unwrap();
            }
        };
        if done {
            return;
        }
    }
}

fn teardown(sched: &Arc<SchedCore>) {
    let mut core = sched.state.lock().unwrap();
    core.run_queue.clear();
    core.table.clear();
}

/// Re-queue the calling strand and let the run-queue head execute.
/// Outside a runtime this is a no-op.
pub fn yield_now() {
    if let Some(ctx) = current_ctx() {
        ctx.sched.yield_current(&ctx.strand);
    }
}

/// Read-only snapshot of the current instance's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedInfo {
    /// Strands ever created on this instance, the root included.
    pub created: u64,
    pub runnable: usize,
    pub blocked: usize,
    pub zombies: usize,
}

/// Counter snapshot for the current instance. Panics outside a runtime.
pub fn info() -> SchedInfo {
    let ctx = match current_ctx() {
        Some(ctx) => ctx,
        None => panic!("weft::info called outside a runtime"),
    };
    let core = ctx.sched.state.lock().unwrap();
    let mut snap = SchedInfo {
        created: core.created,
        runnable: 0,
        blocked: 0,
        zombies: 0,
    };
    for entry in core.table.values() {
        match entry.state {
            StrandState::Runnable => snap.runnable += 1,
            StrandState::Blocked => snap.blocked += 1,
            StrandState::Zombie => snap.zombies += 1,
            StrandState::Running | StrandState::Dead => {}
        }
    }
    snap
}

// ---------------------------------------------------------------------------
// Additional instances (M:N)

/// Handle to a scheduler instance running on its own kernel thread.
/// Dropping it without joining detaches the instance.
pub struct SchedulerHandle {
    thread: Option<thread::JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Wait for the instance to drain its strands and exit.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|payload| Error::Panicked(panic_message(payload.as_ref()))),
            None => Ok(()),
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.thread.take();
    }
}

/// Start a scheduler instance on a new bound kernel thread, with `f` as
/// its root strand body. Coordinate with it over channels; the instance
/// exits once all its strands are done.
pub fn spawn_scheduler<F>(f: F) -> Result<SchedulerHandle>
where
    F: FnOnce() + Send + 'static,
{
    spawn_scheduler_with(Config::default(), f)
}

/// [`spawn_scheduler`] with explicit configuration.
pub fn spawn_scheduler_with<F>(config: Config, f: F) -> Result<SchedulerHandle>
where
    F: FnOnce() + Send + 'static,
{
    static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);
    let thread = thread::Builder::new()
        .name(format!(
            "weft-sched-{}",
            NEXT_THREAD.fetch_add(1, Ordering::Relaxed)
        ))
        .spawn(move || enter(config, f))
        .map_err(|e| Error::ResourceExhausted(format!("scheduler thread: {e}")))?;
    Ok(SchedulerHandle {
        thread: Some(thread),
    })
}
