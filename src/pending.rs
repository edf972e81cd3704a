use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use log::trace;
use tokio::sync::oneshot;

use crate::{
    command::Token,
    error::{Error, Result},
    response::ReplyRecord,
};

/// Lifecycle of a connection to the probe daemon.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

type Slot = oneshot::Sender<Result<ReplyRecord>>;

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    next_token: Token,
    slots: HashMap<Token, Slot>,
}

/// Outstanding requests keyed by token.
///
/// Guarded by a blocking mutex: no critical section awaits, and cancellation
/// has to deregister from `Drop`.
#[derive(Debug)]
pub(crate) struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Open,
                next_token: 1,
                slots: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(
        &self,
    ) -> Result<(Token, oneshot::Receiver<Result<ReplyRecord>>)> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Open => {}
            ConnectionState::Closing => {
                return Err(Error::Process("connection is closing".into()))
            }
            ConnectionState::Closed => return Err(Error::Process("connection is closed".into())),
        }
        let token = inner.next_token;
        inner.next_token += 1;
        let (tx, rx) = oneshot::channel();
        inner.slots.insert(token, tx);
        Ok((token, rx))
    }

    /// Hands `result` to the request owning `token`.
    ///
    /// Returns `false` when no live request owns the token.
    pub(crate) fn resolve(&self, token: Token, result: Result<ReplyRecord>) -> bool {
        let slot = self.lock().slots.remove(&token);
        match slot {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub(crate) fn cancel(&self, token: Token) -> bool {
        self.lock().slots.remove(&token).is_some()
    }

    pub(crate) fn begin_close(&self) {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Open {
            inner.state = ConnectionState::Closing;
        }
    }

    /// Moves to `Closed` and fails every outstanding request with `reason`.
    pub(crate) fn close(&self, reason: &str) -> usize {
        let slots: Vec<Slot> = {
            let mut inner = self.lock();
            inner.state = ConnectionState::Closed;
            inner.slots.drain().map(|(_, tx)| tx).collect()
        };
        let failed = slots.len();
        for tx in slots {
            let _ = tx.send(Err(Error::Process(reason.into())));
        }
        failed
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.lock().slots.len()
    }
}

/// A submitted command awaiting its reply.
///
/// Dropping it before the reply arrives deregisters the token; the reply is
/// then discarded by the reader.
#[derive(Debug)]
pub struct PendingReply {
    token: Token,
    rx: oneshot::Receiver<Result<ReplyRecord>>,
    table: Arc<PendingTable>,
}

impl PendingReply {
    pub(crate) fn new(
        token: Token,
        rx: oneshot::Receiver<Result<ReplyRecord>>,
        table: Arc<PendingTable>,
    ) -> Self {
        Self { token, rx, table }
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

impl Future for PendingReply {
    type Output = Result<ReplyRecord>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let token = self.token;
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled(token)),
        })
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.table.cancel(self.token) {
            trace!("request {} dropped before its reply", self.token);
        }
    }
}
