//! Tee for a single-consumer stream: every fork observes the full item sequence.
//!
//! Whichever fork is polled pulls from the source and copies the item into the buffers of
//! the other forks. While retention is on, the hub also keeps every item for forks created
//! later; [`EventHub::stop_retaining`] releases that buffer.
//!
//! The source is taken out of the hub while it is polled, so code running inside the source
//! may create or drop forks. Forks polled meanwhile wait for the polling fork to finish.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Wake, Waker};

use futures_util::stream::{BoxStream, Stream};

use crate::error::StepflowError;

type Item<T> = Result<T, StepflowError>;

struct HubState<T> {
    source: Option<BoxStream<'static, Item<T>>>,
    forks: HashMap<u64, VecDeque<Item<T>>>,
    retained: Option<Vec<Item<T>>>,
    next_fork_id: u64,
    finished: bool,
    /// A fork holds the source and is polling it.
    polling: bool,
}

/// Wakes every fork waiting on the shared source, whichever fork registered last.
#[derive(Default)]
struct HubWaker {
    waiting: Mutex<Vec<Waker>>,
}

impl HubWaker {
    fn register(&self, waker: &Waker) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if !waiting.iter().any(|existing| existing.will_wake(waker)) {
            waiting.push(waker.clone());
        }
    }
}

impl Wake for HubWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let waiting = std::mem::take(
            &mut *self.waiting.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for waker in waiting {
            waker.wake();
        }
    }
}

struct HubShared<T> {
    state: Mutex<HubState<T>>,
    waker: Arc<HubWaker>,
}

impl<T> HubShared<T> {
    fn state(&self) -> MutexGuard<'_, HubState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct EventHub<T> {
    shared: Arc<HubShared<T>>,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> EventHub<T> {
    pub fn new(source: BoxStream<'static, Item<T>>) -> Self {
        Self {
            shared: Arc::new(HubShared {
                state: Mutex::new(HubState {
                    source: Some(source),
                    forks: HashMap::new(),
                    retained: Some(Vec::new()),
                    next_fork_id: 0,
                    finished: false,
                    polling: false,
                }),
                waker: Arc::new(HubWaker::default()),
            }),
        }
    }

    /// A new reader that starts with every retained item.
    pub fn fork(&self) -> EventFork<T> {
        let mut state = self.shared.state();
        let id = state.next_fork_id;
        state.next_fork_id += 1;
        let backlog = state
            .retained
            .as_ref()
            .map(|retained| retained.iter().cloned().collect::<VecDeque<_>>())
            .unwrap_or_default();
        state.forks.insert(id, backlog);
        drop(state);
        EventFork {
            shared: self.shared.clone(),
            id,
        }
    }

    pub fn stop_retaining(&self) {
        self.shared.state().retained = None;
    }

    /// Drops the source; forks drain what they buffered, then end.
    pub fn cancel(&self) {
        let source = {
            let mut state = self.shared.state();
            state.finished = true;
            state.source.take()
        };
        drop(source);
        self.shared.waker.wake_by_ref();
    }
}

pub struct EventFork<T> {
    shared: Arc<HubShared<T>>,
    id: u64,
}

impl<T: Clone> Stream for EventFork<T> {
    type Item = Item<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut state = this.shared.state();

        if let Some(item) = state
            .forks
            .get_mut(&this.id)
            .and_then(|buffer| buffer.pop_front())
        {
            return Poll::Ready(Some(item));
        }
        if state.finished {
            return Poll::Ready(None);
        }

        this.shared.waker.register(cx.waker());
        if state.polling {
            return Poll::Pending;
        }
        let Some(mut source) = state.source.take() else {
            state.finished = true;
            return Poll::Ready(None);
        };
        state.polling = true;
        drop(state);

        let hub_waker = Waker::from(this.shared.waker.clone());
        let mut hub_cx = Context::from_waker(&hub_waker);
        let polled = source.as_mut().poll_next(&mut hub_cx);

        let mut state = this.shared.state();
        state.polling = false;
        let (output, spent) = match polled {
            Poll::Ready(Some(item)) => {
                let id = this.id;
                for (fork_id, buffer) in state.forks.iter_mut() {
                    if *fork_id != id {
                        buffer.push_back(item.clone());
                    }
                }
                if let Some(retained) = state.retained.as_mut() {
                    retained.push(item.clone());
                }
                if item.is_err() {
                    state.finished = true;
                }
                (Poll::Ready(Some(item)), state.finished)
            }
            Poll::Ready(None) => {
                state.finished = true;
                (Poll::Ready(None), true)
            }
            // Cancelled while the source was out of the hub.
            Poll::Pending if state.finished => (Poll::Ready(None), true),
            Poll::Pending => (Poll::Pending, false),
        };
        if spent {
            drop(state);
            drop(source);
        } else {
            state.source = Some(source);
            drop(state);
        }
        if output.is_ready() {
            this.shared.waker.wake_by_ref();
        }
        output
    }
}

impl<T> Drop for EventFork<T> {
    fn drop(&mut self) {
        self.shared.state().forks.remove(&self.id);
    }
}
