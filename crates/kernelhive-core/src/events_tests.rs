use super::*;
use futures::StreamExt;
use kernelhive_protocols::{ErrorInfo, StreamName};
use std::sync::atomic::AtomicUsize;

#[test]
fn test_listeners_called_in_subscription_order() {
    let listeners = EventListeners::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let l1 = log.clone();
    listeners.subscribe(EventKind::Stream, move |_| l1.lock().push("first"));
    let l2 = log.clone();
    listeners.subscribe(EventKind::Stream, move |_| l2.lock().push("second"));

    listeners.dispatch(&StreamEvent::stdout("x"));
    assert_eq!(*log.lock(), vec!["first", "second"]);
}

#[test]
fn test_dispatch_filters_by_kind() {
    let listeners = EventListeners::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    listeners.subscribe(EventKind::ExecuteError, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });

    listeners.dispatch(&StreamEvent::stdout("ignored"));
    listeners.dispatch(&StreamEvent::ExecuteError(ErrorInfo::new("E", "v")));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unsubscribe_from_inside_callback() {
    let listeners = Arc::new(EventListeners::new());
    let hits = Arc::new(AtomicUsize::new(0));
    let own_id = Arc::new(Mutex::new(None::<ListenerId>));

    let (l, h, slot) = (listeners.clone(), hits.clone(), own_id.clone());
    let id = listeners.subscribe(EventKind::Stream, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
        if let Some(id) = *slot.lock() {
            l.unsubscribe(id);
        }
    });
    *own_id.lock() = Some(id);

    listeners.dispatch(&StreamEvent::stdout("a"));
    listeners.dispatch(&StreamEvent::stdout("b"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(listeners.count(EventKind::Stream), 0);
}

#[test]
fn test_unsubscribe_unknown_id() {
    let listeners = EventListeners::new();
    let id = listeners.subscribe(EventKind::Stream, |_| {});
    assert!(listeners.unsubscribe(id));
    assert!(!listeners.unsubscribe(id));
}

#[test]
fn test_normalize_output() {
    let event = EventMultiplexer::normalize_output(RawOutput::Stderr("oops".to_string()));
    assert_eq!(event.stream_text(StreamName::Stderr), Some("oops"));

    let event = EventMultiplexer::normalize_output(RawOutput::UpdateDisplay {
        data: MimeBundle::text("50%"),
        metadata: MimeBundle::new(),
        display_id: "bar".to_string(),
    });
    match event {
        StreamEvent::UpdateDisplayData(d) => assert_eq!(d.display_id.as_deref(), Some("bar")),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn test_normalize_outcome() {
    let event = EventMultiplexer::normalize_outcome(3, Ok(Some(MimeBundle::text("9")))).unwrap();
    assert!(matches!(event, StreamEvent::ExecuteResult(ExecuteResult { execution_count: 3, .. })));
    assert!(EventMultiplexer::normalize_outcome(1, Ok(None)).is_none());
    let event = EventMultiplexer::normalize_outcome(1, Err(ErrorInfo::new("E", "v"))).unwrap();
    assert_eq!(event.kind(), EventKind::ExecuteError);
}

#[test]
fn test_execution_numbering() {
    let mux = EventMultiplexer::new();
    assert_eq!(mux.begin_execution(), 1);
    assert_eq!(mux.begin_execution(), 2);
    assert_eq!(mux.execution_count(), 2);
}

#[tokio::test]
async fn test_stream_is_not_restartable() {
    let mux = EventMultiplexer::new();
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    mux.publish(StreamEvent::stdout("1"), &tx).await;
    mux.publish(StreamEvent::stdout("2"), &tx).await;
    drop(tx);

    let mut stream = ExecutionStream::new("k", "r", rx);
    let events: Vec<StreamEvent> = (&mut stream).collect().await;
    assert_eq!(events.len(), 2);
    assert!(stream.is_terminated());
    assert!(stream.next().await.is_none());
    assert_eq!(stream.kernel_id(), "k");
}

#[tokio::test]
async fn test_publish_reaches_listeners_without_consumer() {
    let mux = EventMultiplexer::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    mux.listeners().subscribe(EventKind::Stream, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    drop(rx);
    mux.publish(StreamEvent::stdout("x"), &tx).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_listener_is_isolated() {
    let mux = EventMultiplexer::new();
    let hits = Arc::new(AtomicUsize::new(0));
    mux.listeners().subscribe(EventKind::Stream, |_| panic!("listener bug"));
    let h = hits.clone();
    mux.listeners().subscribe(EventKind::Stream, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    mux.publish(StreamEvent::stdout("a"), &tx).await;
    mux.publish(StreamEvent::stdout("b"), &tx).await;
    drop(tx);

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    let events: Vec<StreamEvent> = ExecutionStream::new("k", "r", rx).collect().await;
    assert_eq!(events, vec![StreamEvent::stdout("a"), StreamEvent::stdout("b")]);
    assert_eq!(mux.listeners().count(EventKind::Stream), 2);
}

#[tokio::test]
async fn test_publish_waits_for_slow_consumer() {
    let mux = Arc::new(EventMultiplexer::new());
    let (tx, rx) = mpsc::channel(1);
    mux.publish(StreamEvent::stdout("1"), &tx).await;

    let producer = {
        let mux = mux.clone();
        tokio::spawn(async move {
            mux.publish(StreamEvent::stdout("2"), &tx).await;
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!producer.is_finished());

    let mut stream = ExecutionStream::new("k", "r", rx);
    assert_eq!(stream.next().await, Some(StreamEvent::stdout("1")));
    producer.await.unwrap();
    assert_eq!(stream.next().await, Some(StreamEvent::stdout("2")));
    assert!(stream.next().await.is_none());
}
