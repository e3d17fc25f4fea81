use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use stepflow_ai::{
    stitchable_stream, EventHub, StepflowError, StepflowErrorCode, StitchSource,
};
use tokio::sync::mpsc;

fn ready_source(items: Vec<u32>) -> StitchSource<u32> {
    stream::iter(items.into_iter().map(Ok)).boxed()
}

fn channel_source() -> (mpsc::UnboundedSender<u32>, StitchSource<u32>) {
    let (sender, receiver) = mpsc::unbounded_channel::<u32>();
    let source = stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|value| (Ok(value), receiver))
    })
    .boxed();
    (sender, source)
}

struct Tracked {
    inner: BoxStream<'static, Result<u32, StepflowError>>,
    dropped: Arc<AtomicBool>,
}

impl Stream for Tracked {
    type Item = Result<u32, StepflowError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

fn tracked(source: StitchSource<u32>) -> (Arc<AtomicBool>, StitchSource<u32>) {
    let dropped = Arc::new(AtomicBool::new(false));
    let wrapped = Tracked {
        inner: source,
        dropped: dropped.clone(),
    };
    (dropped, wrapped.boxed())
}

async fn collect_ok(stream: impl Stream<Item = Result<u32, StepflowError>> + Unpin) -> Vec<u32> {
    stream
        .map(|item| item.expect("no stream errors expected"))
        .collect()
        .await
}

#[tokio::test]
async fn sources_drain_in_registration_order_without_interleaving() {
    let (output, handle) = stitchable_stream::<u32>();
    let (first_sender, first) = channel_source();

    handle.append(first).expect("append first");
    handle.append(ready_source(vec![10, 11])).expect("append second");
    handle.close();

    let consumer = tokio::spawn(collect_ok(output));
    tokio::time::sleep(Duration::from_millis(5)).await;
    first_sender.send(1).expect("send 1");
    first_sender.send(2).expect("send 2");
    drop(first_sender);

    let items = consumer.await.expect("consumer task should not panic");
    assert_eq!(items, vec![1, 2, 10, 11]);
}

#[tokio::test]
async fn output_waits_for_a_source_until_closed() {
    let (output, handle) = stitchable_stream::<u32>();
    let consumer = tokio::spawn(collect_ok(output));

    tokio::time::sleep(Duration::from_millis(5)).await;
    handle.append(ready_source(vec![7])).expect("append");
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(!consumer.is_finished());
    handle.close();

    let items = tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .expect("close should end the output")
        .expect("consumer task should not panic");
    assert_eq!(items, vec![7]);
}

#[tokio::test]
async fn append_after_close_fails() {
    let (_output, handle) = stitchable_stream::<u32>();
    handle.close();

    let error = handle
        .append(ready_source(vec![1]))
        .expect_err("closed stream rejects sources");
    assert_eq!(error.code, StepflowErrorCode::StreamClosed);
    assert!(handle.is_closed());
}

#[tokio::test]
async fn source_error_terminates_output_and_drops_queued_sources() {
    let (mut output, handle) = stitchable_stream::<u32>();
    let failing = stream::iter(vec![
        Ok(1),
        Err(StepflowError::new(StepflowErrorCode::ProviderTransport, "reset")),
        Ok(2),
    ])
    .boxed();
    let (queued_dropped, queued) = tracked(ready_source(vec![99]));

    handle.append(failing).expect("append failing");
    handle.append(queued).expect("append queued");

    assert_eq!(output.next().await.map(|item| item.ok()), Some(Some(1)));
    let error = output
        .next()
        .await
        .expect("error item")
        .expect_err("second item is the error");
    assert_eq!(error.code, StepflowErrorCode::ProviderTransport);
    assert!(output.next().await.is_none());
    assert!(queued_dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn cancel_drops_every_registered_source() {
    let (mut output, handle) = stitchable_stream::<u32>();
    let (_first_sender, first) = channel_source();
    let (first_dropped, first) = tracked(first);
    let (second_dropped, second) = tracked(ready_source(vec![5]));

    handle.append(first).expect("append first");
    handle.append(second).expect("append second");
    assert!(!first_dropped.load(Ordering::SeqCst));

    output.cancel();

    assert!(first_dropped.load(Ordering::SeqCst));
    assert!(second_dropped.load(Ordering::SeqCst));
    assert!(output.next().await.is_none());
    assert!(handle.append(ready_source(vec![1])).is_err());
}

#[tokio::test]
async fn dropping_the_output_cancels_sources() {
    let (output, handle) = stitchable_stream::<u32>();
    let (dropped, source) = tracked(ready_source(vec![1]));
    handle.append(source).expect("append");

    drop(output);

    assert!(dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn a_source_may_append_its_successor_while_being_drained() {
    let (output, handle) = stitchable_stream::<u32>();
    let inner_handle = handle.clone();
    let chaining = stream::once(async move {
        inner_handle
            .append(ready_source(vec![2, 3]))
            .expect("append from inside a source");
        inner_handle.close();
        Ok(1)
    })
    .boxed();
    handle.append(chaining).expect("append chaining");

    let items = tokio::time::timeout(Duration::from_secs(1), collect_ok(output))
        .await
        .expect("chained sources should drain");
    assert_eq!(items, vec![1, 2, 3]);
}

#[tokio::test]
async fn forks_observe_identical_sequences() {
    let (output, handle) = stitchable_stream::<u32>();
    handle.append(ready_source(vec![1, 2])).expect("append");
    handle.append(ready_source(vec![3])).expect("append");
    handle.close();
    let hub = EventHub::new(output.boxed());

    let first = hub.fork();
    let second = hub.fork();
    let (left, right) = tokio::join!(collect_ok(first), collect_ok(second));

    assert_eq!(left, vec![1, 2, 3]);
    assert_eq!(right, vec![1, 2, 3]);
}

#[tokio::test]
async fn forks_on_separate_tasks_wake_each_other() {
    let (output, handle) = stitchable_stream::<u32>();
    let (sender, source) = channel_source();
    handle.append(source).expect("append");
    handle.close();
    let hub = EventHub::new(output.boxed());

    let left = tokio::spawn(collect_ok(hub.fork()));
    let right = tokio::spawn(collect_ok(hub.fork()));
    tokio::time::sleep(Duration::from_millis(5)).await;
    for value in [4, 5, 6] {
        sender.send(value).expect("send");
    }
    drop(sender);

    let left = tokio::time::timeout(Duration::from_secs(1), left)
        .await
        .expect("left fork finishes")
        .expect("left task should not panic");
    let right = tokio::time::timeout(Duration::from_secs(1), right)
        .await
        .expect("right fork finishes")
        .expect("right task should not panic");
    assert_eq!(left, vec![4, 5, 6]);
    assert_eq!(right, vec![4, 5, 6]);
}

#[tokio::test]
async fn late_forks_replay_retained_items_until_retention_stops() {
    let (output, handle) = stitchable_stream::<u32>();
    handle.append(ready_source(vec![1, 2, 3])).expect("append");
    handle.close();
    let hub = EventHub::new(output.boxed());

    let mut early = hub.fork();
    assert_eq!(early.next().await.map(|item| item.ok()), Some(Some(1)));

    let late = hub.fork();
    hub.stop_retaining();
    let unretained = hub.fork();

    assert_eq!(collect_ok(late).await, vec![1, 2, 3]);
    assert_eq!(collect_ok(early).await, vec![2, 3]);
    // Forks always see items produced after their creation.
    assert_eq!(collect_ok(unretained).await, vec![2, 3]);
}

#[tokio::test]
async fn fork_errors_are_delivered_to_every_fork_once() {
    let (output, handle) = stitchable_stream::<u32>();
    handle
        .append(
            stream::iter(vec![
                Ok(1),
                Err(StepflowError::new(StepflowErrorCode::CallbackFailed, "boom")),
            ])
            .boxed(),
        )
        .expect("append");
    let hub = EventHub::new(output.boxed());

    for fork in [hub.fork(), hub.fork()] {
        let items: Vec<_> = fork.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(
            items[1].as_ref().map_err(|error| error.code.clone()),
            Err(StepflowErrorCode::CallbackFailed)
        );
    }
}

#[tokio::test]
async fn forks_can_be_created_and_dropped_while_the_source_is_polled() {
    let slot: Arc<OnceLock<EventHub<u32>>> = Arc::new(OnceLock::new());
    let created = Arc::new(Mutex::new(Vec::new()));
    let source_slot = slot.clone();
    let source_created = created.clone();
    let source = stream::iter(vec![1u32, 2, 3])
        .map(move |value| {
            if let Some(hub) = source_slot.get() {
                drop(hub.fork());
                source_created.lock().expect("forks lock").push(hub.fork());
            }
            Ok(value)
        })
        .boxed();
    let hub = EventHub::new(source);
    assert!(slot.set(hub.clone()).is_ok());

    let reader = hub.fork();
    let first = tokio::time::timeout(Duration::from_secs(1), collect_ok(reader))
        .await
        .expect("forking from inside the source must not block");
    assert_eq!(first, vec![1, 2, 3]);

    let forks = std::mem::take(&mut *created.lock().expect("forks lock"));
    assert_eq!(forks.len(), 3);
    for fork in forks {
        assert_eq!(collect_ok(fork).await, vec![1, 2, 3]);
    }
}
