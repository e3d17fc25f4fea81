//! Stream-of-streams multiplexer: sources appended over time are drained strictly in
//! registration order into one output stream.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use futures_util::stream::{BoxStream, Stream};

use crate::error::{StepflowError, StepflowErrorCode};

pub type StitchSource<T> = BoxStream<'static, Result<T, StepflowError>>;

struct StitchState<T> {
    sources: VecDeque<StitchSource<T>>,
    closed: bool,
    terminated: bool,
    waker: Option<Waker>,
}

type SharedState<T> = Arc<Mutex<StitchState<T>>>;

fn lock<T>(state: &SharedState<T>) -> MutexGuard<'_, StitchState<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates the output stream and the handle used to feed it.
pub fn stitchable_stream<T>() -> (StitchableStream<T>, StitchHandle<T>) {
    let state = Arc::new(Mutex::new(StitchState {
        sources: VecDeque::new(),
        closed: false,
        terminated: false,
        waker: None,
    }));
    (
        StitchableStream {
            state: state.clone(),
        },
        StitchHandle { state },
    )
}

pub struct StitchHandle<T> {
    state: SharedState<T>,
}

impl<T> Clone for StitchHandle<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> StitchHandle<T> {
    /// Registers `source` behind every source appended so far.
    pub fn append(&self, source: StitchSource<T>) -> Result<(), StepflowError> {
        let mut state = lock(&self.state);
        if state.closed {
            drop(state);
            drop(source);
            return Err(StepflowError::new(
                StepflowErrorCode::StreamClosed,
                "Cannot add a stream to a closed stitchable stream",
            ));
        }
        state.sources.push_back(source);
        let waker = state.waker.take();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// No more sources will be appended; the output ends once the queue drains.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        let waker = state.waker.take();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

pub struct StitchableStream<T> {
    state: SharedState<T>,
}

impl<T> StitchableStream<T> {
    /// Drops every registered source and ends the output.
    pub fn cancel(&mut self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.terminated = true;
        state.waker = None;
        let sources = std::mem::take(&mut state.sources);
        drop(state);
        drop(sources);
    }
}

impl<T> Stream for StitchableStream<T> {
    type Item = Result<T, StepflowError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            // The head leaves the queue while it is polled so it may append to this stream.
            let mut head = {
                let mut state = lock(&this.state);
                if state.terminated {
                    return Poll::Ready(None);
                }
                match state.sources.pop_front() {
                    Some(head) => head,
                    None if state.closed => {
                        state.terminated = true;
                        return Poll::Ready(None);
                    }
                    None => {
                        state.waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                }
            };

            match head.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(item))) => {
                    lock(&this.state).sources.push_front(head);
                    return Poll::Ready(Some(Ok(item)));
                }
                Poll::Ready(Some(Err(error))) => {
                    drop(head);
                    let mut state = lock(&this.state);
                    state.terminated = true;
                    state.closed = true;
                    let remaining = std::mem::take(&mut state.sources);
                    drop(state);
                    drop(remaining);
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    drop(head);
                }
                Poll::Pending => {
                    lock(&this.state).sources.push_front(head);
                    return Poll::Pending;
                }
            }
        }
    }
}

impl<T> Drop for StitchableStream<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
