//! Cancellation tokens with optional deadlines, shared between the reader
//! thread and the database workers of a pipeline.

use crossbeam_channel::{at, bounded, never, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canceled {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Errors that may wrap a [`Canceled`] and should then be treated as a clean stop.
pub trait Cancellation {
    fn is_cancellation(&self) -> bool;
}

impl Cancellation for Canceled {
    fn is_cancellation(&self) -> bool {
        true
    }
}

struct Token {
    canceled: AtomicBool,
    // dropping the sender wakes every receiver of `done`
    sender: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
    children: Mutex<Vec<Weak<Token>>>,
}

impl Token {
    fn new() -> Arc<Token> {
        let (sender, done) = bounded(0);
        Arc::new(Token {
            canceled: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            done,
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let children = match self.children.lock() {
            Ok(mut children) => std::mem::take(&mut *children),
            Err(_) => Vec::new(),
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    fn child(self: &Arc<Token>) -> Arc<Token> {
        let child = Token::new();
        if let Ok(mut children) = self.children.lock() {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // checked after registering, so a concurrent cancel cannot be missed
        if self.canceled.load(Ordering::SeqCst) {
            child.cancel();
        }
        child
    }
}

/// A cancellation scope. Cloning shares the same token.
#[derive(Clone)]
pub struct Context {
    token: Arc<Token>,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Context::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline)
            .field("err", &self.err())
            .finish()
    }
}

impl Context {
    pub fn background() -> Context {
        Context {
            token: Token::new(),
            deadline: None,
        }
    }

    /// A child that is canceled with its parent, but can also be canceled alone.
    pub fn with_cancel(&self) -> Context {
        Context {
            token: self.token.child(),
            deadline: self.deadline,
        }
    }

    /// A child whose deadline is `timeout` from now, or the parent's if that is sooner.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Context {
        let mut child = self.with_cancel();
        child.deadline = Some(match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        });
        child
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn err(&self) -> Option<Canceled> {
        if self.token.canceled.load(Ordering::SeqCst) {
            return Some(Canceled::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Canceled::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn check(&self) -> Result<(), Canceled> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Becomes ready (disconnected) once the context is canceled.
    pub fn done(&self) -> &Receiver<()> {
        &self.token.done
    }

    fn timer(&self) -> Receiver<Instant> {
        match self.deadline {
            Some(deadline) => at(deadline),
            None => never(),
        }
    }

    /// Blocks until `value` is sent or the context ends.
    /// `Ok(false)` means the receiving side is gone.
    pub fn send<T>(&self, sender: &Sender<T>, value: T) -> Result<bool, Canceled> {
        self.check()?;
        let timer = self.timer();
        select! {
            send(sender, value) -> res => Ok(res.is_ok()),
            recv(self.token.done) -> _ => Err(Canceled::Canceled),
            recv(timer) -> _ => Err(Canceled::DeadlineExceeded),
        }
    }

    /// Blocks until a value arrives or the context ends.
    /// `Ok(None)` means the channel is closed and drained.
    pub fn recv<T>(&self, receiver: &Receiver<T>) -> Result<Option<T>, Canceled> {
        self.check()?;
        let timer = self.timer();
        select! {
            recv(receiver) -> res => Ok(res.ok()),
            recv(self.token.done) -> _ => Err(Canceled::Canceled),
            recv(timer) -> _ => Err(Canceled::DeadlineExceeded),
        }
    }
}

/// Error group: the first non-cancellation error wins and cancels the group's context.
pub struct Group<E> {
    parent: Context,
    ctx: Context,
    first: Mutex<Option<E>>,
    interrupted: AtomicBool,
}

impl<E: Cancellation> Group<E> {
    pub fn new(parent: &Context) -> Group<E> {
        Group {
            parent: parent.clone(),
            ctx: parent.with_cancel(),
            first: Mutex::new(None),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn fail(&self, err: E) {
        if err.is_cancellation() {
            self.interrupted.store(true, Ordering::SeqCst);
        } else {
            if let Ok(mut first) = self.first.lock() {
                if first.is_none() {
                    *first = Some(err);
                }
            }
        }
        self.ctx.cancel();
    }

    pub fn report(&self, res: Result<(), E>) {
        if let Err(err) = res {
            self.fail(err);
        }
    }

    pub fn failed(&self) -> bool {
        self.first.lock().map(|first| first.is_some()).unwrap_or(true)
    }

    /// The first recorded error. Without one, a member stopped by the parent
    /// context (canceled or past its deadline) fails the group with that cause.
    pub fn finish(self) -> Result<(), E>
    where
        E: From<Canceled>,
    {
        let first = match self.first.into_inner() {
            Ok(first) => first,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(err) = first {
            return Err(err);
        }
        match self.parent.err() {
            Some(cause) if self.interrupted.load(Ordering::SeqCst) => Err(cause.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn parent_cancels_child() {
        let parent = Context::background();
        let child = parent.with_cancel();
        assert_eq!(child.err(), None);
        parent.cancel();
        assert_eq!(child.err(), Some(Canceled::Canceled));
        assert!(child.done().recv().is_err());
    }

    #[test]
    fn child_does_not_cancel_parent() {
        let parent = Context::background();
        let child = parent.with_cancel();
        child.cancel();
        assert_eq!(parent.err(), None);
    }

    #[test]
    fn child_of_canceled_parent_starts_canceled() {
        let parent = Context::background();
        parent.cancel();
        assert_eq!(parent.with_cancel().err(), Some(Canceled::Canceled));
    }

    #[test]
    fn deadline_interrupts_blocked_send() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let (tx, _rx) = bounded::<u8>(0);
        assert_eq!(ctx.send(&tx, 1), Err(Canceled::DeadlineExceeded));
    }

    #[test]
    fn child_deadline_never_exceeds_parent() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(3600));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[test]
    fn recv_reports_closed_channel() {
        let ctx = Context::background();
        let (tx, rx) = unbounded::<u8>();
        tx.send(7).unwrap();
        drop(tx);
        assert_eq!(ctx.recv(&rx), Ok(Some(7)));
        assert_eq!(ctx.recv(&rx), Ok(None));
    }

    #[test]
    fn group_keeps_first_real_error() {
        #[derive(Debug, PartialEq)]
        enum E {
            Stop,
            Real(u8),
        }
        impl Cancellation for E {
            fn is_cancellation(&self) -> bool {
                *self == E::Stop
            }
        }
        impl From<Canceled> for E {
            fn from(_: Canceled) -> Self {
                E::Stop
            }
        }

        let group = Group::new(&Context::background());
        group.fail(E::Stop);
        assert!(group.context().err().is_some());
        group.fail(E::Real(1));
        group.fail(E::Real(2));
        assert_eq!(group.finish(), Err(E::Real(1)));
    }

    #[test]
    fn group_reports_parent_cancellation() {
        #[derive(Debug, PartialEq)]
        struct Stopped(Canceled);
        impl Cancellation for Stopped {
            fn is_cancellation(&self) -> bool {
                true
            }
        }
        impl From<Canceled> for Stopped {
            fn from(cause: Canceled) -> Self {
                Stopped(cause)
            }
        }

        // stopping itself is fine
        let group: Group<Stopped> = Group::new(&Context::background());
        group.fail(Stopped(Canceled::Canceled));
        assert_eq!(group.finish(), Ok(()));

        // members interrupted by an expired parent are not
        let parent = Context::background().with_timeout(Duration::from_millis(1));
        let group: Group<Stopped> = Group::new(&parent);
        std::thread::sleep(Duration::from_millis(5));
        group.report(group.context().check().map_err(Stopped));
        assert_eq!(group.finish(), Err(Stopped(Canceled::DeadlineExceeded)));

        // a parent that expires after everyone finished does not matter
        let parent = Context::background().with_timeout(Duration::from_millis(1));
        let group: Group<Stopped> = Group::new(&parent);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(group.finish(), Ok(()));
    }
}
