// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bridge to real kernel threads.
//!
//! A [`WorkerPool`] owns a set of worker OS threads, each with its own
//! bounded FIFO request queue. Strands hand blocking or CPU-heavy jobs
//! over ([`WorkerPool::call`], [`WorkerPool::submit`]); the pool spreads
//! requests round-robin and a full queue parks the submitting strand
//! until the picked worker frees a slot, so a slow pool throttles its
//! producers instead of growing an unbounded backlog.
//!
//! Results travel back over a capacity-1 completion channel per
//! request: the worker's send always finds room, and the waiting
//! strand's instance wakes it like any other channel delivery.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::chan::{dispose_message, Chan, Message, TryRecvError};
use crate::error::{Error, Result};
use crate::sched::strand::{panic_message, Strand, StrandId};
use crate::sched::{current_ctx, current_strand, wake};

type Job = Box<dyn FnOnce() -> Message + Send + 'static>;

/// What the worker posts on the completion channel.
struct BridgeReply(std::result::Result<Message, String>);

struct Request {
    job: Job,
    /// Counted completion handle; absent for fire-and-forget jobs.
    done: Option<Chan>,
    /// Submitting strand, when there is one, for tracing.
    origin: Option<StrandId>,
}

#[derive(Default)]
struct WorkQueue {
    state: Mutex<WorkState>,
    available: Condvar,
}

#[derive(Default)]
struct WorkState {
    jobs: VecDeque<Request>,
    /// Strands parked on a full queue, oldest first.
    blocked: VecDeque<Arc<Strand>>,
    shutdown: bool,
}

struct PoolShared {
    queues: Vec<WorkQueue>,
    cursor: AtomicUsize,
    queue_capacity: usize,
}

/// Pool of kernel worker threads taking jobs from strands.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// A job in flight, from [`WorkerPool::start`]. Dropping it without
/// waiting discards the result; the job still runs.
pub struct OpHandle {
    done: Option<Chan>,
}

impl WorkerPool {
    /// Start `workers` kernel threads, each with a request queue of
    /// `queue_capacity` slots.
    pub fn new(workers: usize, queue_capacity: usize) -> Result<WorkerPool> {
        if workers == 0 {
            return Err(Error::InvalidOperation("worker pool needs at least one worker"));
        }
        if queue_capacity == 0 {
            return Err(Error::InvalidOperation("worker queues need nonzero capacity"));
        }
        let shared = Arc::new(PoolShared {
            queues: (0..workers).map(|_| WorkQueue::default()).collect(),
            cursor: AtomicUsize::new(0),
            queue_capacity,
        });
        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("weft-worker-{idx}"))
                .spawn(move || worker_loop(&worker_shared, idx));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Tear down the part of the pool that did start.
                    drop(WorkerPool {
                        shared,
                        workers: handles,
                    });
                    return Err(Error::ResourceExhausted(format!(
                        "bridge worker thread: {e}"
                    )));
                }
            }
        }
        log::debug!("worker pool up: {workers} workers, queue capacity {queue_capacity}");
        Ok(WorkerPool {
            shared,
            workers: handles,
        })
    }

    /// Run `job` on a worker and park the calling strand until its
    /// result comes back.
    pub fn call<F>(&self, job: F) -> Result<Message>
    where
        F: FnOnce() -> Message + Send + 'static,
    {
        self.start(job)?.wait()
    }

    /// Hand `job` to a worker and return immediately with a handle to
    /// collect the result later. Requires a strand: collecting (and a
    /// full queue) parks the caller.
    pub fn start<F>(&self, job: F) -> Result<OpHandle>
    where
        F: FnOnce() -> Message + Send + 'static,
    {
        if current_ctx().is_none() {
            return Err(Error::InvalidOperation("bridge call outside a strand"));
        }
        let done = Chan::new(1);
        let req = Request {
            job: Box::new(job),
            done: Some(done.clone()),
            origin: current_strand().map(|s| s.id),
        };
        match self.enqueue(req) {
            Ok(()) => Ok(OpHandle { done: Some(done) }),
            Err(e) => {
                let _ = done.release();
                Err(e)
            }
        }
    }

    /// Fire-and-forget: run `job` on a worker, nobody collects the
    /// result. A full queue parks a strand caller; from outside a
    /// strand only the non-blocking fast path is available.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Message + Send + 'static,
    {
        self.enqueue(Request {
            job: Box::new(job),
            done: None,
            origin: current_strand().map(|s| s.id),
        })
    }

    fn enqueue(&self, req: Request) -> Result<()> {
        let shared = &self.shared;
        let idx = shared.cursor.fetch_add(1, Ordering::Relaxed) % shared.queues.len();
        let queue = &shared.queues[idx];
        let mut state = queue.state.lock().unwrap();
        loop {
            if state.shutdown {
                drop(state);
                dispose_request(req);
                return Err(Error::InvalidOperation("worker pool is shut down"));
            }
            if state.jobs.len() < shared.queue_capacity {
                state.jobs.push_back(req);
                queue.available.notify_one();
                return Ok(());
            }
            // Full queue: wait for the picked worker to free a slot.
            let cur = match current_strand() {
                Some(cur) => cur,
                None => {
                    drop(state);
                    dispose_request(req);
                    return Err(Error::InvalidOperation(
                        "bridge submit would block outside a strand",
                    ));
                }
            };
            if !state.blocked.iter().any(|s| s.id == cur.id) {
                log::trace!("bridge queue {idx} full; strand {} waits", cur.id);
                state.blocked.push_back(cur.clone());
            }
            drop(state);
            cur.sched.block_current(&cur);
            state = queue.state.lock().unwrap();
        }
    }

    /// Refuse new jobs and release parked submitters. Queued jobs still
    /// run to completion before the workers exit.
    pub fn shutdown(&self) {
        let mut parked = Vec::new();
        for queue in &self.shared.queues {
            let mut state = queue.state.lock().unwrap();
            state.shutdown = true;
            parked.extend(state.blocked.drain(..));
            queue.available.notify_all();
        }
        for strand in parked {
            wake(&strand);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        log::debug!("worker pool down");
    }
}

impl OpHandle {
    /// Park until the worker posts the job's result.
    pub fn wait(mut self) -> Result<Message> {
        let done = match self.done.take() {
            Some(done) => done,
            None => return Err(Error::InvalidOperation("operation already consumed")),
        };
        let msg = match done.receive() {
            Ok(msg) => msg,
            Err(e) => {
                let _ = done.release();
                return Err(e);
            }
        };
        let _ = done.release();
        unwrap_reply(msg)
    }

    /// Non-blocking poll: `Ok(Some(result))` once the worker has
    /// posted, `Ok(None)` while the job is still in flight. Usable from
    /// any thread.
    pub fn try_wait(&mut self) -> Result<Option<Message>> {
        let done = match &self.done {
            Some(done) => done,
            None => return Err(Error::InvalidOperation("operation already consumed")),
        };
        match done.try_receive() {
            Ok(msg) => {
                if let Some(done) = self.done.take() {
                    let _ = done.release();
                }
                unwrap_reply(msg).map(Some)
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for OpHandle {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.release();
        }
    }
}

fn unwrap_reply(msg: Message) -> Result<Message> {
    match msg.downcast::<BridgeReply>() {
        Ok(BridgeReply(Ok(result))) => Ok(result),
        Ok(BridgeReply(Err(panic_msg))) => Err(Error::Panicked(panic_msg)),
        Err(other) => {
            dispose_message(other);
            Err(Error::InvalidOperation("unexpected completion payload"))
        }
    }
}

fn dispose_request(req: Request) {
    if let Some(done) = req.done {
        let _ = done.release();
    }
}

fn worker_loop(shared: &Arc<PoolShared>, idx: usize) {
    let queue = &shared.queues[idx];
    loop {
        // Drain jobs first; the shutdown flag only matters on empty.
        let (req, parked) = {
            let mut state = queue.state.lock().unwrap();
            loop {
                if let Some(req) = state.jobs.pop_front() {
                    break (req, state.blocked.pop_front());
                }
                if state.shutdown {
                    return;
                }
                state = queue.available.wait(state).unwrap();
            }
        };
        if let Some(strand) = parked {
            wake(&strand);
        }

        let Request { job, done, origin } = req;
        if let Some(origin) = origin {
            log::trace!("bridge worker {idx}: job from strand {origin}");
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || job()));
        let reply = match outcome {
            Ok(msg) => Ok(msg),
            Err(payload) => Err(panic_message(payload.as_ref())),
        };
        match done {
            Some(done) => {
                if let Err(e) = done.send(Message::data(BridgeReply(reply))) {
                    log::warn!("bridge worker {idx}: dropping completion: {e}");
                }
                let _ = done.release();
            }
            None => {
                if let Err(msg) = reply {
                    log::error!("bridge job panicked: {msg}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::strand::spawn;
    use crate::sched::{run, yield_now};

    #[test]
    fn call_runs_jobs_on_worker_threads() {
        run(|| {
            let pool = WorkerPool::new(2, 4).unwrap();
            let v: i32 = pool
                .call(|| Message::data(21 * 2))
                .unwrap()
                .downcast()
                .unwrap();
            assert_eq!(v, 42);

            let name: String = pool
                .call(|| Message::data(thread::current().name().unwrap_or("").to_string()))
                .unwrap()
                .downcast()
                .unwrap();
            assert!(name.starts_with("weft-worker-"));
        });
    }

    #[test]
    fn overloaded_pool_backpressures_and_delivers() {
        run(|| {
            let pool = Arc::new(WorkerPool::new(1, 1).unwrap());
            let mut handles = Vec::new();
            for i in 0..4i64 {
                let pool = pool.clone();
                handles.push(
                    spawn(move || {
                        let doubled: i64 = pool
                            .call(move || Message::data(i * 2))
                            .unwrap()
                            .downcast()
                            .unwrap();
                        (i, doubled)
                    })
                    .unwrap(),
                );
            }
            for h in handles {
                let (i, doubled) = h.join().unwrap();
                assert_eq!(doubled, i * 2);
            }
        });
    }

    #[test]
    fn submit_runs_without_a_result() {
        let pool = WorkerPool::new(1, 2).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        pool.submit(move || {
            h.fetch_add(1, Ordering::SeqCst);
            Message::data(())
        })
        .unwrap();
        drop(pool); // joins the workers after the queue drains
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn job_panic_comes_back_as_an_error() {
        run(|| {
            let pool = WorkerPool::new(1, 1).unwrap();
            let err = pool.call(|| panic!("boom")).unwrap_err();
            match err {
                Error::Panicked(msg) => assert!(msg.contains("boom")),
                other => panic!("expected a panic report, got {other}"),
            }
            // the worker survives the panic
            let v: i32 = pool.call(|| Message::data(1)).unwrap().downcast().unwrap();
            assert_eq!(v, 1);
        });
    }

    #[test]
    fn started_jobs_overlap_with_strand_work() {
        run(|| {
            let pool = WorkerPool::new(2, 2).unwrap();
            let first = pool.start(|| Message::data(10)).unwrap();
            let second = pool.start(|| Message::data(20)).unwrap();
            let a: i32 = first.wait().unwrap().downcast().unwrap();
            let b: i32 = second.wait().unwrap().downcast().unwrap();
            assert_eq!((a, b), (10, 20));
        });
    }

    #[test]
    fn results_can_be_polled() {
        run(|| {
            let pool = WorkerPool::new(1, 1).unwrap();
            let mut op = pool.start(|| Message::data(5)).unwrap();
            let v: i32 = loop {
                match op.try_wait().unwrap() {
                    Some(msg) => break msg.downcast().unwrap(),
                    None => yield_now(),
                }
            };
            assert_eq!(v, 5);
            assert!(matches!(op.try_wait(), Err(Error::InvalidOperation(_))));
        });
    }

    #[test]
    fn dropped_handle_discards_the_result() {
        run(|| {
            let pool = WorkerPool::new(1, 1).unwrap();
            let hits = Arc::new(AtomicUsize::new(0));
            let h = hits.clone();
            let op = pool
                .start(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                    Message::data(7)
                })
                .unwrap();
            drop(op); // result discarded, job still runs
            drop(pool);
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        run(|| {
            let pool = WorkerPool::new(1, 1).unwrap();
            pool.shutdown();
            assert!(matches!(
                pool.call(|| Message::data(0)),
                Err(Error::InvalidOperation(_))
            ));
            assert!(matches!(
                pool.submit(|| Message::data(0)),
                Err(Error::InvalidOperation(_))
            ));
        });
    }

    #[test]
    fn pool_shape_is_validated() {
        assert!(matches!(
            WorkerPool::new(0, 1),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            WorkerPool::new(1, 0),
            Err(Error::InvalidOperation(_))
        ));

        let pool = WorkerPool::new(1, 1).unwrap();
        assert!(matches!(
            pool.call(|| Message::data(0)),
            Err(Error::InvalidOperation(_))
        ));
    }
}
