#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Panicking adapters, retriers, serializers, consumers and monitors must not
//! leave a request pending.

mod common;

use bytes::Bytes;
use common::{ScriptedTransport, Step, eventually, get};
use modkit_http_session::{
    BoxError, ErrorKind, EventMonitor, RequestError, RequestSnapshot, RequestState,
    ResponseHead, ResponseSerializer, Session, SessionBuilder, adapter_fn, retrier_fn,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const URL: &str = "https://api.example.com/items";

fn builder(transport: &ScriptedTransport) -> SessionBuilder {
    Session::builder()
        .transport(transport.clone())
        .without_user_agent()
}

struct ExplodingSerializer;

impl ResponseSerializer for ExplodingSerializer {
    type Output = ();

    fn serialize(
        &self,
        _request: Option<&http::Request<Bytes>>,
        _response: Option<&ResponseHead>,
        _data: Option<&Bytes>,
    ) -> Result<(), BoxError> {
        panic!("serializer bug");
    }
}

struct ExplodingMonitor;

impl EventMonitor for ExplodingMonitor {
    fn request_did_create(&self, _request: &RequestSnapshot) {
        panic!("monitor bug");
    }
}

#[tokio::test]
async fn test_panicking_adapter_fails_the_attempt() {
    let transport = ScriptedTransport::new([Step::ok("unused")]);
    let session = builder(&transport)
        .adapter(adapter_fn(|_, _| panic!("adapter bug")))
        .build()
        .unwrap();

    let request = session.start(get(URL));
    let response = tokio::time::timeout(Duration::from_secs(2), request.response_bytes())
        .await
        .expect("request must not hang on a panicking adapter");

    assert!(matches!(
        response.result,
        Err(RequestError::AdaptationFailed { attempt: 1, .. })
    ));
    assert_eq!(request.state(), RequestState::Finished);
    assert_eq!(transport.begin_count(), 0);
    assert_eq!(session.live_request_count().await, 0);
}

#[tokio::test]
async fn test_panicking_retrier_keeps_original_error() {
    let transport = ScriptedTransport::new([Step::Fail]);
    let session = builder(&transport)
        .retrier(retrier_fn(|_, _, _| panic!("retrier bug")))
        .build()
        .unwrap();

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        session.start(get(URL)).response_bytes(),
    )
    .await
    .expect("request must not hang on a panicking retrier");

    let Err(RequestError::RetryPolicyFailed { original, .. }) = &response.result else {
        panic!("expected RetryPolicyFailed, got {:?}", response.result);
    };
    assert_eq!(original.kind(), ErrorKind::TransportFailed);
    assert_eq!(session.live_request_count().await, 0);
}

#[tokio::test]
async fn test_panicking_serializer_does_not_block_other_consumers() {
    let transport = ScriptedTransport::new([Step::ok("payload")]);
    let session = builder(&transport).build().unwrap();

    let request = session.start(get(URL));
    let broken = request.response_with(ExplodingSerializer);
    let healthy = request.response_bytes();
    let (broken, healthy) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(broken, healthy)
    })
    .await
    .expect("consumers must not hang on a panicking serializer");

    assert!(matches!(
        broken.result,
        Err(RequestError::SerializationFailed(_))
    ));
    assert_eq!(healthy.value().map(|b| &b[..]), Some(&b"payload"[..]));
    assert_eq!(request.state(), RequestState::Finished);

    let late = tokio::time::timeout(
        Duration::from_secs(2),
        request.response_with(ExplodingSerializer),
    )
    .await
    .expect("late consumer must not hang on a panicking serializer");
    assert!(matches!(
        late.result,
        Err(RequestError::SerializationFailed(_))
    ));
}

#[tokio::test]
async fn test_panicking_callback_does_not_starve_later_consumers() {
    let transport = ScriptedTransport::new([Step::ok("payload")]);
    let session = builder(&transport).build().unwrap();
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);

    let request = session.start(get(URL));
    request.response_callback(modkit_http_session::BytesSerializer, |_| {
        panic!("callback bug");
    });
    request.response_callback(modkit_http_session::BytesSerializer, move |response| {
        assert!(response.result.is_ok());
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let last = request.response_string().await;

    assert_eq!(last.value().map(String::as_str), Some("payload"));
    eventually(|| served.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_panicking_inline_monitor_is_contained() {
    let transport = ScriptedTransport::new([Step::ok("payload")]);
    let session = builder(&transport)
        .event_monitor(ExplodingMonitor)
        .build()
        .unwrap();

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        session.start(get(URL)).response_string(),
    )
    .await
    .expect("request must not hang on a panicking monitor");

    assert_eq!(response.value().map(String::as_str), Some("payload"));
    assert_eq!(session.live_request_count().await, 0);
}
