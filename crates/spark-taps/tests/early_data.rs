//! 0-RTT：预连接登记的消息随拨号携带，或在建立后按普通消息发送。

mod common;

use bytes::Bytes;
use common::{A, B, Harness, settle};
use spark_taps::test_stubs::{MockStack, Script};
use spark_taps::{EventKind, OutboundMessage};

fn framed(content: &[u8]) -> Bytes {
    let mut out = (content.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(content);
    Bytes::from(out)
}

#[tokio::test(start_paused = true)]
async fn early_data_rides_the_handshake() {
    let harness = Harness::new(MockStack::reliable("tcp", 1).with_early_data());
    harness.stack.script(A, Script::succeed_after(10));

    let mut preconnection = harness.context.preconnect(vec![harness.specifier()]);
    let hello = preconnection.initial_send(OutboundMessage::new("hello"));
    let connection = preconnection.initiate().expect("initiate");

    harness.handler.wait_for(EventKind::Sent, 1).await;
    settle().await;

    assert_eq!(harness.stack.early_data(), vec![(A, vec![(hello, framed(b"hello"))])]);
    assert_eq!(harness.handler.kinds(), vec![EventKind::Ready, EventKind::Sent]);
    assert_eq!(harness.handler.message_events(hello), vec![EventKind::Sent]);
    assert!(harness.stack.flow_to(A).expect("flow").writes().is_empty());

    // 建立后签发的引用接着 0-RTT 消息继续递增。
    let next = connection.send("after").expect("send");
    assert!(next > hello);
}

#[tokio::test(start_paused = true)]
async fn stack_without_early_data_sends_after_ready() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    harness.stack.script(A, Script::succeed_after(10));

    let mut preconnection = harness.context.preconnect(vec![harness.specifier()]);
    let hello = preconnection.initial_send(OutboundMessage::new("hello"));
    let _connection = preconnection.initiate().expect("initiate");

    harness.handler.wait_for(EventKind::Sent, 1).await;

    assert!(harness.stack.early_data().is_empty());
    let writes = harness.stack.flow_to(A).expect("flow").writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].reference, hello);
    assert!(writes[0].idempotent);
    assert_eq!(writes[0].payload, framed(b"hello"));
}

#[tokio::test(start_paused = true)]
async fn early_data_is_reported_once_when_the_first_attempt_fails() {
    let harness = Harness::new(MockStack::reliable("tcp", 1).with_early_data());
    harness.stack.script(A, Script::refuse_after(20));
    harness.stack.script(B, Script::succeed_after(30));

    let mut preconnection = harness.context.preconnect(vec![harness.specifier()]);
    let hello = preconnection.initial_send(OutboundMessage::new("hello"));
    let _connection = preconnection.initiate().expect("initiate");

    harness.handler.wait_for(EventKind::Sent, 1).await;
    settle().await;

    let carried: Vec<_> = harness.stack.early_data().into_iter().map(|(addr, _)| addr).collect();
    assert_eq!(carried, vec![B]);
    assert_eq!(harness.handler.message_events(hello), vec![EventKind::Sent]);
}

#[tokio::test(start_paused = true)]
async fn native_stack_carries_unframed_early_data() {
    let harness = Harness::new(MockStack::unreliable("udp", 1).with_early_data());
    harness.stack.script(A, Script::succeed_after(0));

    let mut preconnection = harness.context.preconnect(vec![harness.specifier()]);
    let hello = preconnection.initial_send(OutboundMessage::new("hello"));
    let _connection = preconnection.initiate().expect("initiate");

    harness.handler.wait_for(EventKind::Sent, 1).await;
    assert_eq!(
        harness.stack.early_data(),
        vec![(A, vec![(hello, Bytes::from_static(b"hello"))])]
    );
}
