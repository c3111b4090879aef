// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Waiting on several channels at once.
//!
//! A [`ChanGroup`] names a set of (channel, direction) members.
//! [`ChanGroup::wait`] parks the calling strand until some member would
//! complete without blocking, then reports that member. The wait never
//! consumes a message; the caller follows up with the actual operation.
//!
//! One readiness event wakes one wait: registrations queue FIFO per
//! channel, so when several groups watch the same channel the oldest
//! registration wins. A finished wait withdraws its registrations from
//! every member before returning, so a win on one channel cannot leave
//! a ghost claim on another.

use std::sync::{Arc, Mutex};

use crate::chan::{self, Chan, ChanInner};
use crate::error::{Error, Result};
use crate::sched::strand::Strand;
use crate::sched::current_ctx;

/// The operation a group member is watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// One wait in flight: shared between the parked strand and the watcher
/// entries it planted. The first member to become ready claims `winner`;
/// everyone else's claim attempt turns into a no-op.
pub(crate) struct WaitRecord {
    pub(crate) strand: Arc<Strand>,
    pub(crate) winner: Mutex<Option<usize>>,
}

#[derive(Clone)]
struct Member {
    inner: Arc<ChanInner>,
    dir: Direction,
}

/// A set of channels to wait on together. Group membership does not
/// count as a channel reference; releasing a member elsewhere fails the
/// wait with `InvalidHandle`.
#[derive(Default)]
pub struct ChanGroup {
    state: Mutex<GroupState>,
}

#[derive(Default)]
struct GroupState {
    members: Vec<Member>,
    busy: bool,
}

impl ChanGroup {
    pub fn new() -> ChanGroup {
        ChanGroup::default()
    }

    /// Add a member. Each (channel, direction) pair may appear once,
    /// and membership cannot change while a wait is in flight.
    pub fn add(&self, chan: &Chan, dir: Direction) -> Result<()> {
        if chan::is_released(&chan.inner) {
            return Err(Error::InvalidHandle("channel released"));
        }
        let mut state = self.state.lock().unwrap();
        if state.busy {
            return Err(Error::InvalidOperation("group is waiting"));
        }
        if state
            .members
            .iter()
            .any(|m| Arc::ptr_eq(&m.inner, &chan.inner) && m.dir == dir)
        {
            return Err(Error::InvalidOperation("member already in group"));
        }
        state.members.push(Member {
            inner: chan.inner.clone(),
            dir,
        });
        Ok(())
    }

    /// Remove a member.
    pub fn remove(&self, chan: &Chan, dir: Direction) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.busy {
            return Err(Error::InvalidOperation("group is waiting"));
        }
        let before = state.members.len();
        state
            .members
            .retain(|m| !(Arc::ptr_eq(&m.inner, &chan.inner) && m.dir == dir));
        if state.members.len() == before {
            return Err(Error::InvalidOperation("member not in group"));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park until some member would complete without blocking and
    /// report it, preferring the earliest-added member when several are
    /// ready on entry. The returned handle is the same reference the
    /// caller already holds, not a new counted one.
    ///
    /// A group carries at most one wait at a time; a second concurrent
    /// wait fails with `InvalidOperation`.
    pub fn wait(&self) -> Result<(Chan, Direction)> {
        let ctx = match current_ctx() {
            Some(ctx) => ctx,
            None => return Err(Error::InvalidOperation("group wait outside a strand")),
        };
        let members: Vec<Member> = {
            let mut state = self.state.lock().unwrap();
            if state.busy {
                return Err(Error::InvalidOperation("group already has a waiter"));
            }
            if state.members.is_empty() {
                return Err(Error::InvalidOperation("group has no members"));
            }
            state.busy = true;
            state.members.clone()
        };
        let rec = Arc::new(WaitRecord {
            strand: ctx.strand.clone(),
            winner: Mutex::new(None),
        });

        // Register in member order. A member that is ready at its turn
        // claims the record on the spot, which keeps the earliest-added
        // preference; later members are then not registered at all.
        let mut failure = None;
        for (idx, member) in members.iter().enumerate() {
            match chan::register_watcher(&member.inner, member.dir, idx, &rec) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let outcome = match failure {
            Some(e) => Err(e),
            None => loop {
                let winner = *rec.winner.lock().unwrap();
                if let Some(idx) = winner {
                    break Ok(idx);
                }
                if members.iter().any(|m| chan::is_released(&m.inner)) {
                    break Err(Error::InvalidHandle("channel released"));
                }
                ctx.sched.block_current(&ctx.strand);
            },
        };

        // Withdraw every registration this wait planted, won or not.
        for member in &members {
            chan::remove_watchers_of(&member.inner, &rec);
        }
        self.state.lock().unwrap().busy = false;

        outcome.map(|idx| {
            let member = &members[idx];
            (
                Chan {
                    inner: member.inner.clone(),
                },
                member.dir,
            )
        })
    }
}
