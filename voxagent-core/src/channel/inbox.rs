//! Rendezvous queue between the socket driver and envelope consumers.
//!
//! Two queues, never both non-empty: envelopes that arrived with nobody
//! waiting, and consumers waiting with nothing buffered. An arriving envelope
//! goes straight to the oldest waiter if there is one; a consumer takes the
//! oldest buffered envelope if there is one.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, VoxError};
use crate::protocol::Envelope;

/// What a waiting consumer is eventually handed.
#[derive(Debug)]
enum Pulled {
    Item(Envelope),
    Done,
    Failed(String),
}

#[derive(Debug, Clone)]
enum Terminal {
    Closed,
    Failed(String),
}

#[derive(Default)]
struct InboxState {
    buffered: VecDeque<Envelope>,
    waiters: VecDeque<oneshot::Sender<Pulled>>,
    terminal: Option<Terminal>,
}

impl InboxState {
    /// Give `envelope` to the oldest live waiter; returns it if none is left.
    fn hand_to_waiter(&mut self, envelope: Envelope) -> Option<Envelope> {
        let mut pending = Pulled::Item(envelope);
        while let Some(waiter) = self.waiters.pop_front() {
            // A waiter whose future was dropped hands the envelope back.
            match waiter.send(pending) {
                Ok(()) => return None,
                Err(returned) => pending = returned,
            }
        }
        match pending {
            Pulled::Item(envelope) => Some(envelope),
            Pulled::Done | Pulled::Failed(_) => None,
        }
    }
}

/// A pending `pull()`. Dropped before completion, it returns an envelope
/// that was already handed to it.
struct Waiter<'a> {
    inbox: &'a Inbox,
    rx: oneshot::Receiver<Pulled>,
    finished: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.rx.close();
        if let Ok(Pulled::Item(envelope)) = self.rx.try_recv() {
            self.inbox.restore(envelope);
        }
    }
}

/// Inbound envelope queue with FIFO hand-off to concurrent consumers.
#[derive(Default)]
pub struct Inbox {
    state: Mutex<InboxState>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand an envelope to the oldest live waiter, or buffer it.
    ///
    /// Envelopes delivered after the inbox reached a terminal state are
    /// dropped.
    pub fn deliver(&self, envelope: Envelope) {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return;
        }
        if let Some(envelope) = state.hand_to_waiter(envelope) {
            state.buffered.push_back(envelope);
        }
    }

    /// Put back an envelope whose consumer went away after it was handed
    /// over. It becomes the next envelope served.
    fn restore(&self, envelope: Envelope) {
        let mut state = self.state.lock();
        if matches!(state.terminal, Some(Terminal::Failed(_))) {
            return;
        }
        if let Some(envelope) = state.hand_to_waiter(envelope) {
            state.buffered.push_front(envelope);
        }
    }

    /// Wait for the next envelope.
    ///
    /// `Ok(None)` once the channel closed cleanly and every buffered envelope
    /// has been consumed. A transport failure is reported as soon as it is
    /// known, ahead of anything still buffered.
    pub async fn pull(&self) -> Result<Option<Envelope>> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(Terminal::Failed(reason)) = &state.terminal {
                return Err(VoxError::Channel(reason.clone()));
            }
            if let Some(envelope) = state.buffered.pop_front() {
                return Ok(Some(envelope));
            }
            if matches!(state.terminal, Some(Terminal::Closed)) {
                return Ok(None);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let mut waiter = Waiter {
            inbox: self,
            rx,
            finished: false,
        };
        let pulled = (&mut waiter.rx).await;
        waiter.finished = true;

        match pulled {
            Ok(Pulled::Item(envelope)) => Ok(Some(envelope)),
            Ok(Pulled::Done) => Ok(None),
            Ok(Pulled::Failed(reason)) => Err(VoxError::Channel(reason)),
            // The inbox itself was dropped.
            Err(_) => Ok(None),
        }
    }

    /// Mark a clean end of stream. Waiters are released with end-of-stream;
    /// buffered envelopes stay available.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return;
        }
        state.terminal = Some(Terminal::Closed);
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Pulled::Done);
        }
    }

    /// Mark a transport failure. Waiters and all later pulls see the error.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return;
        }
        state.terminal = Some(Terminal::Failed(reason.clone()));
        state.buffered.clear();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Pulled::Failed(reason.clone()));
        }
    }

    /// `(buffered envelopes, waiting consumers)`.
    pub fn queue_depths(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.buffered.len(), state.waiters.len())
    }
}
