//! 回环地址上的端到端验证：真实套接字、真实解析器、引擎默认分帧。

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use spark_taps::test_stubs::RecordingHandler;
use spark_taps::{
    Antecedent, CandidateSpecifier, Connection, EstablishmentConfig, Event, EventKind, LocalSpecifier,
    RemoteSpecifier, TapsError, TransportContext,
};
use spark_taps_tcp::{SystemResolver, TcpStack};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const PATIENCE: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn context(handler: Arc<RecordingHandler>) -> TransportContext {
    TransportContext::builder()
        .config(EstablishmentConfig::default().with_establishment_timeout(PATIENCE))
        .stack(Arc::new(TcpStack::new()))
        .resolver(Arc::new(SystemResolver::new()))
        .event_handler(handler)
        .build()
        .expect("context")
}

async fn wait(handler: &RecordingHandler, kind: EventKind, count: usize) {
    tokio::time::timeout(PATIENCE, handler.wait_for(kind, count))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {count} {kind:?} events: {:?}", handler.kinds()));
}

fn accepted_connection(handler: &RecordingHandler) -> Connection {
    handler
        .events()
        .into_iter()
        .find_map(|event| match event {
            Event::Ready {
                connection,
                antecedent: Some(Antecedent::Listener(_)),
            } => Some(connection),
            _ => None,
        })
        .expect("inbound connection")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_cross_a_loopback_connection() {
    init_tracing();
    let handler = RecordingHandler::new();
    let context = context(handler.clone());

    let listener = context
        .listen(
            CandidateSpecifier::new(
                RemoteSpecifier::new(),
                context.new_transport_parameters(),
                context.new_security_parameters(),
            )
            .with_local(LocalSpecifier::new().with_address(LOOPBACK).with_port(0)),
        )
        .expect("listen");
    let bound = listener.bound().await;
    assert_eq!(bound.len(), 1);
    let port = bound[0].addr.port();
    assert_ne!(port, 0);

    let client = context
        .initiate(CandidateSpecifier::new(
            RemoteSpecifier::new().with_hostname("127.0.0.1").with_port(port),
            context.new_transport_parameters(),
            context.new_security_parameters(),
        ))
        .expect("initiate");
    wait(&handler, EventKind::Ready, 2).await;
    let server = accepted_connection(&handler);

    client.send("ping").expect("send ping");
    let request = tokio::time::timeout(PATIENCE, server.receive())
        .await
        .expect("ping in time")
        .expect("ping");
    assert_eq!(&request.payload()[..], b"ping");

    server.send("pong").expect("send pong");
    let reply = tokio::time::timeout(PATIENCE, client.receive())
        .await
        .expect("pong in time")
        .expect("pong");
    assert_eq!(&reply.payload()[..], b"pong");
    wait(&handler, EventKind::Sent, 2).await;

    client.close();
    wait(&handler, EventKind::Closed, 2).await;

    listener.stop();
    wait(&handler, EventKind::ListenerStopped, 1).await;
    assert_eq!(handler.count(EventKind::Error), 0, "{:?}", handler.kinds());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_port_fails_every_candidate() {
    init_tracing();
    let port = {
        let probe = std::net::TcpListener::bind((LOOPBACK, 0)).expect("probe bind");
        probe.local_addr().expect("probe addr").port()
    };
    let handler = RecordingHandler::new();
    let context = context(handler.clone());

    let connection = context
        .initiate(CandidateSpecifier::new(
            RemoteSpecifier::new().with_address(LOOPBACK).with_port(port),
            context.new_transport_parameters(),
            context.new_security_parameters(),
        ))
        .expect("initiate");
    wait(&handler, EventKind::Error, 1).await;

    let errors: Vec<TapsError> = handler
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::Error { error, .. } => Some(error),
            _ => None,
        })
        .collect();
    assert!(
        matches!(&errors[0], TapsError::AllCandidatesFailed { failures } if failures.len() == 1),
        "{errors:?}"
    );
    assert_eq!(handler.count(EventKind::Ready), 0);
    assert!(connection.path().is_none());
}
