//! The admission gate: `max_connections` is a hard cap, not advisory.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use floodgate_core::{
    CodecConduit, Conduit, ConnectionHandler, ConnectionId, Delegator, HandlerError, HandlerEvent,
    IoSystemConfig, ServerSettings, WorkerId,
};
use floodgate_http::{HttpRequest, HttpResponse, HttpServerCodec};
use floodgate_io::IoSystem;
use tokio::{io::AsyncReadExt, net::TcpStream, time};

struct SilentHandler;

impl ConnectionHandler for SilentHandler {
    type Msg = HttpRequest;
    type Reply = HttpResponse;

    fn on_message(
        &mut self,
        _msg: HttpRequest,
    ) -> Result<Vec<HandlerEvent<HttpResponse>>, HandlerError> {
        Ok(Vec::new())
    }
}

struct CountingDelegator {
    created: Arc<AtomicUsize>,
}

impl Delegator for CountingDelegator {
    fn accept_new_connection(&mut self, _id: ConnectionId) -> Option<Box<dyn Conduit>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Some(CodecConduit::boxed(HttpServerCodec::new(), SilentHandler))
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met within 10s");
}

#[tokio::test]
async fn third_connection_over_the_cap_is_refused() {
    let system = IoSystem::start(IoSystemConfig::new("test").with_num_workers(2)).unwrap();

    let created = Arc::new(AtomicUsize::new(0));
    let factory_created = Arc::clone(&created);
    let settings = ServerSettings::new("cap", 0)
        .with_interface("127.0.0.1")
        .with_max_connections(2);
    let server = system
        .attach_server(settings, move |_worker: WorkerId| {
            Box::new(CountingDelegator { created: Arc::clone(&factory_created) })
                as Box<dyn Delegator>
        })
        .unwrap();
    let addr = server.bound().await.unwrap();

    let first = TcpStream::connect(addr).await.unwrap();
    let second = TcpStream::connect(addr).await.unwrap();
    let third = TcpStream::connect(addr).await.unwrap();

    let metrics = system.metrics();
    let connects = metrics.rate("cap.connects");
    let refused = metrics.rate("cap.refused");

    wait_until(|| connects.total() == 3 && refused.total() == 1).await;
    wait_until(|| created.load(Ordering::SeqCst) == 2).await;

    // Exactly two handlers exist and the counter reflects them.
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(server.open_connections(), 2);

    // Exactly one of the three sockets was closed on the spot; the admitted
    // ones stay open (the read just times out).
    let mut closed = 0;
    for mut stream in [first, second, third] {
        let mut buf = [0u8; 1];
        match time::timeout(Duration::from_millis(300), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => closed += 1,
            _ => {},
        }
    }
    assert_eq!(closed, 1);

    system.shutdown().await;
}

#[tokio::test]
async fn delegator_refusal_closes_the_socket() {
    struct RefuseAll;

    impl Delegator for RefuseAll {
        fn accept_new_connection(&mut self, _id: ConnectionId) -> Option<Box<dyn Conduit>> {
            None
        }
    }

    let system = IoSystem::start(IoSystemConfig::new("test").with_num_workers(1)).unwrap();
    let settings = ServerSettings::new("turnaway", 0).with_interface("127.0.0.1");
    let server = system
        .attach_server(settings, |_worker: WorkerId| Box::new(RefuseAll) as Box<dyn Delegator>)
        .unwrap();
    let addr = server.bound().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();

    // The worker closes it with cause Refused, which comes back through
    // the server's closed rate and the open-connection count.
    let closed = system.metrics().rate("turnaway.closed");
    wait_until(|| closed.tagged_total("cause", "refused") == 1).await;
    wait_until(|| server.open_connections() == 0).await;

    let mut buf = [0u8; 1];
    let read = time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))), "socket should be closed: {read:?}");

    system.shutdown().await;
}
