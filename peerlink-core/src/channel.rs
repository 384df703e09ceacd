//! In-process bidirectional byte channel with explicit close.
//!
//! [`Channel::pair`] returns two connected ends. Both ends share one close
//! signal: closing either end closes the pair. Segments already delivered to
//! an end stay readable after close (`Closing`); once drained, reads fail.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How a read waits for data.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReadMode {
    /// Wait until at least one byte is available; return up to `len` bytes
    /// (a whole segment when `len == 0`).
    WaitAny,
    /// Wait until exactly `len` bytes are available. `len == 0` behaves as `WaitAny`.
    WaitAll,
    /// Return whatever is buffered right now, possibly nothing.
    DontWait,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelState {
    Open,
    /// Closed, but this end still has buffered data to drain.
    Closing,
    Closed,
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
}

#[derive(Default)]
struct Inbox {
    segments: Mutex<VecDeque<Bytes>>,
    notify: Notify,
}

/// One end of a channel pair. Cloning yields another handle to the same end.
#[derive(Clone)]
pub struct Channel {
    inbound: Arc<Inbox>,
    outbound: Arc<Inbox>,
    closed: CancellationToken,
}

impl Channel {
    /// Two connected ends: bytes written to one are read from the other.
    pub fn pair() -> (Channel, Channel) {
        let a_to_b = Arc::new(Inbox::default());
        let b_to_a = Arc::new(Inbox::default());
        let closed = CancellationToken::new();
        let a = Channel {
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
            closed: closed.clone(),
        };
        let b = Channel {
            inbound: a_to_b,
            outbound: b_to_a,
            closed,
        };
        (a, b)
    }

    /// Read from this end. Fails with [`ChannelError::Closed`] once the pair is
    /// closed and nothing satisfying the request is buffered.
    pub async fn read(&self, len: usize, mode: ReadMode) -> Result<Bytes, ChannelError> {
        loop {
            let notified = self.inbound.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(bytes) = self.take(len, mode) {
                return Ok(bytes);
            }
            if self.closed.is_cancelled() {
                return Err(ChannelError::Closed);
            }
            if mode == ReadMode::DontWait {
                return Ok(Bytes::new());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.cancelled() => {}
            }
        }
    }

    fn take(&self, len: usize, mode: ReadMode) -> Option<Bytes> {
        let mut segments = self.inbound.segments.lock();
        if mode == ReadMode::WaitAll && len > 0 {
            let available: usize = segments.iter().map(Bytes::len).sum();
            if available < len {
                return None;
            }
            let mut out = BytesMut::with_capacity(len);
            while out.len() < len {
                let Some(mut seg) = segments.pop_front() else {
                    break;
                };
                let need = len - out.len();
                if seg.len() > need {
                    segments.push_front(seg.split_off(need));
                }
                out.extend_from_slice(&seg);
            }
            return Some(out.freeze());
        }
        let mut seg = segments.pop_front()?;
        if len > 0 && seg.len() > len {
            segments.push_front(seg.split_off(len));
        }
        Some(seg)
    }

    /// Queue bytes for the other end. Empty writes are ignored.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        self.outbound.segments.lock().push_back(data);
        self.outbound.notify.notify_waiters();
        Ok(())
    }

    /// Close both ends. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn state(&self) -> ChannelState {
        if !self.closed.is_cancelled() {
            ChannelState::Open
        } else if self.inbound.segments.lock().is_empty() {
            ChannelState::Closed
        } else {
            ChannelState::Closing
        }
    }

    /// Resolves once the pair is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Token cancelled when the pair closes. Cancelling it does not close the pair.
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.child_token()
    }

    /// Close this channel when `token` is cancelled.
    pub fn close_on(&self, token: &CancellationToken) {
        if token.is_cancelled() {
            self.close();
            return;
        }
        let token = token.clone();
        let channel = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => channel.close(),
                _ = channel.closed() => {}
            }
        });
    }

    /// Tie two channels together: closing either closes the other.
    pub fn link(&self, other: &Channel) {
        if self.is_closed() || other.is_closed() {
            self.close();
            other.close();
            return;
        }
        let a = self.clone();
        let b = other.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = a.closed() => b.close(),
                _ = b.closed() => a.close(),
            }
        });
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state())
            .finish()
    }
}
