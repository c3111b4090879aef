// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! weft: cooperative green threads over plain OS threads.
//!
//! A weft runtime instance binds one kernel thread and multiplexes any
//! number of *strands* on it, round-robin, switching only at blocking
//! points and explicit yields. Components:
//!
//! - scheduler core: per-instance run queue, strand table, and the
//!   block/wake protocol ([`run`], [`spawn`], [`yield_now`])
//! - strand lifecycle: join with a typed return value, detach, and
//!   early [`exit`]
//! - channels: rendezvous and bounded-FIFO message pipes with explicit
//!   reference counts, usable across instances ([`Chan`])
//! - channel groups: wait on many (channel, direction) members at once
//!   ([`ChanGroup`])
//! - worker bridge: hand blocking jobs to real kernel threads and get
//!   the results back as channel deliveries ([`WorkerPool`])
//!
//! Instances never share strands. To go M:N, start more instances with
//! [`spawn_scheduler`] and let them talk over channels.
//!
//! ```
//! let total = weft::run(|| {
//!     let c = weft::Chan::new(0);
//!     let c2 = c.clone();
//!     let producer = weft::spawn(move || {
//!         for n in 1..=3 {
//!             c2.send(weft::Message::data(n)).unwrap();
//!         }
//!     })
//!     .unwrap();
//!     let mut total = 0;
//!     for _ in 0..3 {
//!         let n: i32 = c.receive().unwrap().downcast().unwrap();
//!         total += n;
//!     }
//!     producer.join().unwrap();
//!     total
//! });
//! assert_eq!(total, 6);
//! ```

pub mod bridge;
pub mod chan;
pub mod config;
pub mod error;
pub mod group;
pub mod sched;

pub use bridge::{OpHandle, WorkerPool};
pub use chan::{Chan, ChanId, Message, TryRecvError, TrySendError};
pub use config::Config;
pub use error::{Error, Result};
pub use group::{ChanGroup, Direction};
pub use sched::strand::{current, exit, spawn, JoinHandle, StrandId};
pub use sched::{
    info, run, run_with, spawn_scheduler, spawn_scheduler_with, yield_now, SchedInfo,
    SchedulerHandle,
};
