// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Inter-strand channels.
//!
//! A channel is the only way strands exchange data, on one instance or
//! across instances. Capacity 0 gives rendezvous semantics: a send
//! completes only when paired with a receive. Capacity K > 0 buffers up
//! to K messages FIFO; senders past that block until a slot frees.
//!
//! Handles carry an explicit reference count: [`Chan::clone`] and
//! [`Chan::send_chan`] raise it, [`Chan::release`] lowers it, and plain
//! drops leave it alone. When the count reaches zero the channel drains
//! its buffer and fails every parked strand with `InvalidHandle`.
//!
//! Blocked senders and receivers queue FIFO per channel, and the oldest
//! waiter always pairs first, so per-sender message order survives end
//! to end.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::group::{Direction, WaitRecord};
use crate::sched::strand::Strand;
use crate::sched::{current_strand, wake};

/// Process-unique channel identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChanId(u64);

impl ChanId {
    fn next() -> ChanId {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ChanId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

/// What travels through a channel: an opaque payload, or another
/// channel handle whose reference count the transfer already raised.
pub enum Message {
    Data(Box<dyn Any + Send>),
    Chan(Chan),
}

impl Message {
    /// Wrap an arbitrary payload.
    pub fn data<T: Send + 'static>(value: T) -> Message {
        Message::Data(Box::new(value))
    }

    /// Recover a `Data` payload of the given type, handing the message
    /// back unchanged when the type (or variant) does not match.
    pub fn downcast<T: 'static>(self) -> std::result::Result<T, Message> {
        match self {
            Message::Data(boxed) => match boxed.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(boxed) => Err(Message::Data(boxed)),
            },
            other => Err(other),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Data(_) => f.write_str("Message::Data(..)"),
            Message::Chan(chan) => write!(f, "Message::Chan({})", chan.inner.id),
        }
    }
}

/// Handle to a channel. Equality is channel identity, not structural.
pub struct Chan {
    pub(crate) inner: Arc<ChanInner>,
}

pub(crate) struct ChanInner {
    pub(crate) id: ChanId,
    pub(crate) capacity: usize,
    pub(crate) state: Mutex<ChanState>,
}

pub(crate) struct ChanState {
    /// Outstanding handle count, user-managed via clone/send_chan and
    /// release. Drop never touches it.
    refs: usize,
    pub(crate) released: bool,
    mark: u64,
    buffer: VecDeque<Message>,
    send_waiters: VecDeque<SendWaiter>,
    recv_waiters: VecDeque<Arc<Strand>>,
    pub(crate) watchers: VecDeque<Watcher>,
}

/// A parked sender: its message waits in the queue entry until a
/// receiver (or a freed buffer slot) takes the whole entry.
struct SendWaiter {
    strand: Arc<Strand>,
    msg: Message,
    delivered: Arc<AtomicBool>,
}

/// Group-wait registration parked on this channel.
pub(crate) struct Watcher {
    pub(crate) dir: Direction,
    pub(crate) member_idx: usize,
    pub(crate) rec: Arc<WaitRecord>,
}

/// Non-blocking send refusal; the message comes back to the caller.
#[derive(Debug)]
pub enum TrySendError {
    Full(Message),
    Released(Message),
}

/// Non-blocking receive refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Released,
}

impl From<TrySendError> for Error {
    fn from(e: TrySendError) -> Error {
        match e {
            TrySendError::Full(msg) => {
                dispose_message(msg);
                Error::WouldBlock
            }
            TrySendError::Released(msg) => {
                dispose_message(msg);
                Error::InvalidHandle("channel released")
            }
        }
    }
}

impl From<TryRecvError> for Error {
    fn from(e: TryRecvError) -> Error {
        match e {
            TryRecvError::Empty => Error::WouldBlock,
            TryRecvError::Released => Error::InvalidHandle("channel released"),
        }
    }
}

impl Chan {
    /// Create a channel. Capacity 0 is a rendezvous channel; K > 0
    /// buffers up to K messages. The handle starts with one reference.
    pub fn new(capacity: usize) -> Chan {
        let id = ChanId::next();
        log::trace!("channel {id} created (capacity {capacity})");
        Chan {
            inner: Arc::new(ChanInner {
                id,
                capacity,
                state: Mutex::new(ChanState {
                    refs: 1,
                    released: false,
                    mark: 0,
                    buffer: VecDeque::new(),
                    send_waiters: VecDeque::new(),
                    recv_waiters: VecDeque::new(),
                    watchers: VecDeque::new(),
                }),
            }),
        }
    }

    /// Lock the state, failing like every other operation once the
    /// channel is released. A stale handle has nothing left to inspect.
    fn live_state(&self) -> Result<MutexGuard<'_, ChanState>> {
        let state = self.inner.state.lock().unwrap();
        if state.released {
            return Err(Error::InvalidHandle("channel released"));
        }
        Ok(state)
    }

    /// Channel identity.
    pub fn id(&self) -> Result<ChanId> {
        self.live_state().map(|_| self.inner.id)
    }

    pub fn capacity(&self) -> Result<usize> {
        self.live_state().map(|_| self.inner.capacity)
    }

    /// Buffered message count.
    pub fn len(&self) -> Result<usize> {
        Ok(self.live_state()?.buffer.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read the user mark.
    pub fn mark(&self) -> Result<u64> {
        Ok(self.live_state()?.mark)
    }

    /// Tag the channel with an arbitrary word, visible to every handle.
    pub fn set_mark(&self, mark: u64) -> Result<()> {
        self.live_state()?.mark = mark;
        Ok(())
    }

    /// Send a message, blocking the calling strand while the channel
    /// cannot take it. On any error the message is disposed, which for a
    /// transferred channel handle undoes its count bump.
    ///
    /// The fast paths (waiting receiver, free buffer slot) work from any
    /// OS thread; only the blocking path requires a strand.
    pub fn send(&self, msg: Message) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.released {
            drop(state);
            dispose_message(msg);
            return Err(Error::InvalidHandle("channel released"));
        }

        // 1. A receiver is already parked: hand the message straight to
        //    its mailbox. Receivers only park on an empty buffer, so
        //    this cannot reorder around buffered messages.
        if let Some(receiver) = state.recv_waiters.pop_front() {
            *receiver.mailbox.lock().unwrap() = Some(msg);
            drop(state);
            wake(&receiver);
            return Ok(());
        }

        // 2. Buffer has room.
        if state.buffer.len() < self.inner.capacity {
            state.buffer.push_back(msg);
            notify_watchers(&mut state, self.inner.capacity, Direction::Receive);
            return Ok(());
        }

        // 3. Park as the youngest sender.
        let cur = match current_strand() {
            Some(cur) => cur,
            None => {
                drop(state);
                dispose_message(msg);
                return Err(Error::InvalidOperation("blocking send outside a strand"));
            }
        };
        let delivered = Arc::new(AtomicBool::new(false));
        state.send_waiters.push_back(SendWaiter {
            strand: cur.clone(),
            msg,
            delivered: delivered.clone(),
        });
        notify_watchers(&mut state, self.inner.capacity, Direction::Receive);
        drop(state);

        loop {
            cur.sched.block_current(&cur);
            if delivered.load(Ordering::SeqCst) {
                return Ok(());
            }
            let state = self.inner.state.lock().unwrap();
            if state.released {
                return Err(Error::InvalidHandle("channel released"));
            }
            // Spurious resume; the queue entry is still parked.
        }
    }

    /// Receive the oldest available message, blocking the calling
    /// strand while there is none. The fast paths work from any OS
    /// thread; only the blocking path requires a strand.
    pub fn receive(&self) -> Result<Message> {
        let mut state = self.inner.state.lock().unwrap();
        if state.released {
            return Err(Error::InvalidHandle("channel released"));
        }

        // 1. Buffered message; the freed slot promotes the oldest
        //    parked sender so queue order survives end to end.
        if let Some(msg) = state.buffer.pop_front() {
            promote_sender(&mut state, self.inner.capacity);
            notify_watchers(&mut state, self.inner.capacity, Direction::Send);
            return Ok(msg);
        }

        // 2. Empty buffer but a parked sender: rendezvous pairing with
        //    the oldest one.
        if let Some(waiter) = state.send_waiters.pop_front() {
            waiter.delivered.store(true, Ordering::SeqCst);
            drop(state);
            wake(&waiter.strand);
            return Ok(waiter.msg);
        }

        // 3. Park as the youngest receiver and wait for a mailbox
        //    delivery.
        let cur = match current_strand() {
            Some(cur) => cur,
            None => {
                return Err(Error::InvalidOperation(
                    "blocking receive outside a strand",
                ))
            }
        };
        state.recv_waiters.push_back(cur.clone());
        notify_watchers(&mut state, self.inner.capacity, Direction::Send);
        drop(state);

        loop {
            cur.sched.block_current(&cur);
            if let Some(msg) = cur.mailbox.lock().unwrap().take() {
                return Ok(msg);
            }
            let state = self.inner.state.lock().unwrap();
            if state.released {
                return Err(Error::InvalidHandle("channel released"));
            }
        }
    }

    /// Send without blocking, reporting `Full` when the channel cannot
    /// take the message right now.
    pub fn try_send(&self, msg: Message) -> std::result::Result<(), TrySendError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.released {
            drop(state);
            return Err(TrySendError::Released(msg));
        }
        if let Some(receiver) = state.recv_waiters.pop_front() {
            *receiver.mailbox.lock().unwrap() = Some(msg);
            drop(state);
            wake(&receiver);
            return Ok(());
        }
        if state.buffer.len() < self.inner.capacity {
            state.buffer.push_back(msg);
            notify_watchers(&mut state, self.inner.capacity, Direction::Receive);
            return Ok(());
        }
        drop(state);
        Err(TrySendError::Full(msg))
    }

    /// Receive without blocking.
    pub fn try_receive(&self) -> std::result::Result<Message, TryRecvError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.released {
            return Err(TryRecvError::Released);
        }
        if let Some(msg) = state.buffer.pop_front() {
            promote_sender(&mut state, self.inner.capacity);
            notify_watchers(&mut state, self.inner.capacity, Direction::Send);
            return Ok(msg);
        }
        if let Some(waiter) = state.send_waiters.pop_front() {
            waiter.delivered.store(true, Ordering::SeqCst);
            drop(state);
            wake(&waiter.strand);
            return Ok(waiter.msg);
        }
        Err(TryRecvError::Empty)
    }

    /// Transfer a channel handle through this channel. The transferred
    /// channel's count rises by one before the send; the receiver owns
    /// that reference and releases it when done. A failed send undoes
    /// the bump.
    pub fn send_chan(&self, chan: &Chan) -> Result<()> {
        let alias = {
            let mut state = chan.inner.state.lock().unwrap();
            if state.released {
                return Err(Error::InvalidHandle("channel released"));
            }
            state.refs += 1;
            Chan {
                inner: chan.inner.clone(),
            }
        };
        self.send(Message::Chan(alias))
    }

    /// Receive a message that must be a channel handle. A plain data
    /// message is consumed and reported as `InvalidOperation`.
    pub fn receive_chan(&self) -> Result<Chan> {
        match self.receive()? {
            Message::Chan(chan) => Ok(chan),
            Message::Data(_) => Err(Error::InvalidOperation("message is not a channel")),
        }
    }

    /// Give up this reference. When the last reference goes, the
    /// channel drains: buffered channel handles are released in turn,
    /// and every strand parked on the channel fails with
    /// `InvalidHandle`.
    pub fn release(self) -> Result<()> {
        release_inner(&self.inner)
    }
}

impl Clone for Chan {
    /// Another counted reference: the channel now needs one more
    /// [`Chan::release`]. Cloning a stale handle yields a stale handle.
    fn clone(&self) -> Chan {
        let mut state = self.inner.state.lock().unwrap();
        if !state.released {
            state.refs += 1;
        }
        drop(state);
        Chan {
            inner: self.inner.clone(),
        }
    }
}

impl PartialEq for Chan {
    fn eq(&self, other: &Chan) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Chan {}

impl fmt::Debug for Chan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chan({})", self.inner.id)
    }
}

pub(crate) fn release_inner(inner: &Arc<ChanInner>) -> Result<()> {
    let mut state = inner.state.lock().unwrap();
    if state.released {
        return Err(Error::InvalidHandle("channel already released"));
    }
    state.refs -= 1;
    if state.refs > 0 {
        return Ok(());
    }
    state.released = true;
    let drained: Vec<Message> = state.buffer.drain(..).collect();
    let senders: Vec<SendWaiter> = state.send_waiters.drain(..).collect();
    let receivers: Vec<Arc<Strand>> = state.recv_waiters.drain(..).collect();
    let watchers: Vec<Watcher> = state.watchers.drain(..).collect();
    drop(state);
    log::trace!("channel {} released", inner.id);

    // Nested releases and wakes run outside the lock: a drained message
    // may hold the last reference to another channel.
    for msg in drained {
        dispose_message(msg);
    }
    for waiter in senders {
        dispose_message(waiter.msg);
        wake(&waiter.strand);
    }
    for receiver in receivers {
        wake(&receiver);
    }
    for watcher in watchers {
        wake(&watcher.rec.strand);
    }
    Ok(())
}

/// Drop a message that will never reach a receiver, undoing the count
/// bump a channel transfer gave it.
pub(crate) fn dispose_message(msg: Message) {
    match msg {
        Message::Data(_) => {}
        Message::Chan(chan) => {
            let _ = release_inner(&chan.inner);
        }
    }
}

/// Would an operation in `dir` complete right now without blocking?
fn ready(state: &ChanState, capacity: usize, dir: Direction) -> bool {
    match dir {
        Direction::Receive => !state.buffer.is_empty() || !state.send_waiters.is_empty(),
        Direction::Send => {
            !state.recv_waiters.is_empty() || (capacity > 0 && state.buffer.len() < capacity)
        }
    }
}

/// Move the oldest parked sender's message into a freed buffer slot.
fn promote_sender(state: &mut ChanState, capacity: usize) {
    if state.buffer.len() < capacity {
        if let Some(waiter) = state.send_waiters.pop_front() {
            waiter.delivered.store(true, Ordering::SeqCst);
            state.buffer.push_back(waiter.msg);
            wake(&waiter.strand);
        }
    }
}

/// Fire at most one group registration for a readiness transition in
/// `dir`: the oldest watcher whose wait has not already won elsewhere.
/// Stale registrations met along the way are dropped.
fn notify_watchers(state: &mut ChanState, capacity: usize, dir: Direction) {
    if !ready(state, capacity, dir) {
        return;
    }
    let mut idx = 0;
    while idx < state.watchers.len() {
        if state.watchers[idx].dir != dir {
            idx += 1;
            continue;
        }
        let watcher = match state.watchers.remove(idx) {
            Some(watcher) => watcher,
            None => break,
        };
        let claimed = {
            let mut winner = watcher.rec.winner.lock().unwrap();
            match *winner {
                None => {
                    *winner = Some(watcher.member_idx);
                    true
                }
                Some(_) => false,
            }
        };
        if claimed {
            wake(&watcher.rec.strand);
            return;
        }
    }
}

/// Group-wait registration. Reports `Ok(true)` when the member is ready
/// right now (claiming the wait record if it is still open) and
/// `Ok(false)` after parking a watcher entry.
pub(crate) fn register_watcher(
    inner: &Arc<ChanInner>,
    dir: Direction,
    member_idx: usize,
    rec: &Arc<WaitRecord>,
) -> Result<bool> {
    let mut state = inner.state.lock().unwrap();
    if state.released {
        return Err(Error::InvalidHandle("channel released"));
    }
    if ready(&state, inner.capacity, dir) {
        let mut winner = rec.winner.lock().unwrap();
        if winner.is_none() {
            *winner = Some(member_idx);
        }
        return Ok(true);
    }
    state.watchers.push_back(Watcher {
        dir,
        member_idx,
        rec: rec.clone(),
    });
    Ok(false)
}

/// Remove every watcher entry a finished group wait left behind.
pub(crate) fn remove_watchers_of(inner: &Arc<ChanInner>, rec: &Arc<WaitRecord>) {
    let mut state = inner.state.lock().unwrap();
    state.watchers.retain(|w| !Arc::ptr_eq(&w.rec, rec));
}

pub(crate) fn is_released(inner: &Arc<ChanInner>) -> bool {
    inner.state.lock().unwrap().released
}
