use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

enum State<R> {
    Ready(Option<R>),
    Queued(oneshot::Receiver<R>),
    Failed,
}

/// Completion handle of
/// [`run_when_memory_available`](crate::RegionGroup::run_when_memory_available).
///
/// Resolves to the closure's result, or to [`Error::GroupShutdown`] if the
/// group was shut down while the closure waited.
#[must_use = "the result of the admitted closure is only observable through the handle"]
pub struct Admission<R> {
    state: State<R>,
}

// never pinned structurally: the result is moved out by value
impl<R> Unpin for Admission<R> {}

impl<R> core::fmt::Debug for Admission<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match &self.state {
            State::Ready(Some(_)) => "ready",
            State::Ready(None) => "taken",
            State::Queued(_) => "queued",
            State::Failed => "failed",
        };
        f.debug_struct("Admission").field("state", &state).finish()
    }
}

impl<R> Admission<R> {
    #[inline]
    pub(crate) fn ready(value: R) -> Self {
        Self {
            state: State::Ready(Some(value)),
        }
    }

    #[inline]
    pub(crate) fn queued(rx: oneshot::Receiver<R>) -> Self {
        Self {
            state: State::Queued(rx),
        }
    }

    /// Whether the closure has run or the request has failed.
    pub fn is_ready(&mut self) -> bool {
        let State::Queued(rx) = &mut self.state else {
            return true;
        };
        match rx.try_recv() {
            Ok(value) => {
                self.state = State::Ready(Some(value));
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.state = State::Failed;
                true
            }
        }
    }

    /// The result without waiting, if there is one.
    pub fn try_take(&mut self) -> Option<Result<R>> {
        if !self.is_ready() {
            return None;
        }
        match &mut self.state {
            State::Ready(value) => value.take().map(Ok),
            State::Failed => Some(Err(Error::GroupShutdown)),
            State::Queued(_) => None,
        }
    }
}

impl<R> Future for Admission<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            State::Ready(value) => match value.take() {
                Some(value) => Poll::Ready(Ok(value)),
                None => panic!("`Admission` polled after completion"),
            },
            State::Failed => Poll::Ready(Err(Error::GroupShutdown)),
            State::Queued(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(value)) => {
                    this.state = State::Ready(None);
                    Poll::Ready(Ok(value))
                }
                Poll::Ready(Err(_)) => {
                    this.state = State::Failed;
                    Poll::Ready(Err(Error::GroupShutdown))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
