//! Split promise: a [`Resolver`] settles once, any number of [`Resolvable`] handles await it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::StepflowError;

struct Slot<T> {
    value: Mutex<Option<Result<T, StepflowError>>>,
    notify: Notify,
}

impl<T> Slot<T> {
    fn value(&self) -> MutexGuard<'_, Option<Result<T, StepflowError>>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: Result<T, StepflowError>) {
        let mut guard = self.value();
        if guard.is_none() {
            *guard = Some(outcome);
        }
        drop(guard);
        self.notify.notify_waiters();
    }
}

pub fn resolvable<T>() -> (Resolver<T>, Resolvable<T>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
        notify: Notify::new(),
    });
    (
        Resolver {
            slot: Some(slot.clone()),
        },
        Resolvable { slot },
    )
}

/// Producer side. Dropping it unsettled rejects the value with `cancelled`.
pub struct Resolver<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Resolver<T> {
    pub fn resolve(mut self, value: T) {
        if let Some(slot) = self.slot.take() {
            slot.settle(Ok(value));
        }
    }

    pub fn reject(mut self, error: StepflowError) {
        if let Some(slot) = self.slot.take() {
            slot.settle(Err(error));
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.settle(Err(StepflowError::cancelled(
                "the stream was dropped before the value was available",
            )));
        }
    }
}

pub struct Resolvable<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Resolvable<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone> Resolvable<T> {
    pub async fn get(&self) -> Result<T, StepflowError> {
        loop {
            let notified = self.slot.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.slot.value().clone() {
                return outcome;
            }

            notified.await;
        }
    }

    pub fn is_settled(&self) -> bool {
        self.slot.value().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::StepflowErrorCode;

    #[tokio::test]
    async fn waiters_see_value_resolved_later() {
        let (resolver, value) = resolvable::<String>();
        let waiter = {
            let value = value.clone();
            tokio::spawn(async move { value.get().await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!value.is_settled());
        resolver.resolve("done".to_string());

        let outcome = waiter.await.expect("waiter task should not panic");
        assert_eq!(outcome, Ok("done".to_string()));
        assert_eq!(value.get().await, Ok("done".to_string()));
    }

    #[tokio::test]
    async fn rejection_reaches_every_handle() {
        let (resolver, value) = resolvable::<u32>();
        let other = value.clone();

        resolver.reject(StepflowError::aborted());

        assert_eq!(value.get().await.map_err(|e| e.code), Err(StepflowErrorCode::Aborted));
        assert_eq!(other.get().await.map_err(|e| e.code), Err(StepflowErrorCode::Aborted));
    }

    #[tokio::test]
    async fn dropped_resolver_rejects_with_cancelled() {
        let (resolver, value) = resolvable::<u32>();
        drop(resolver);

        let error = value.get().await.expect_err("value was never produced");
        assert_eq!(error.code, StepflowErrorCode::Cancelled);
    }
}
