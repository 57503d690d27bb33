//! End-to-end behavior of the system: request/response flow, outbound
//! connections, idle timeouts, shutdown modes, broadcasts, tasks, and
//! worker restart.

use std::{
    any::Any,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use floodgate_core::{
    CodecConduit, Conduit, ConnectionHandler, ConnectionId, Delegator, HandlerError, HandlerEvent,
    IoSystemConfig, ServerSettings, WorkerId,
};
use floodgate_http::{
    HttpClientCodec, HttpRequest, HttpResponse, HttpServerCodec, Method, ResponseParser,
};
use floodgate_io::{IoSystem, ServerStatus, SystemError, Task};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met within 10s");
}

fn test_system(workers: usize) -> IoSystem {
    IoSystem::start(IoSystemConfig::new("test").with_num_workers(workers)).unwrap()
}

fn local(name: &str) -> ServerSettings {
    ServerSettings::new(name, 0).with_interface("127.0.0.1")
}

/// Responds to every request with the request's path in the body.
struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    type Msg = HttpRequest;
    type Reply = HttpResponse;

    fn on_message(
        &mut self,
        request: HttpRequest,
    ) -> Result<Vec<HandlerEvent<HttpResponse>>, HandlerError> {
        Ok(vec![HandlerEvent::Send(HttpResponse::ok(request.path))])
    }
}

struct EchoDelegator;

impl Delegator for EchoDelegator {
    fn accept_new_connection(&mut self, _id: ConnectionId) -> Option<Box<dyn Conduit>> {
        Some(CodecConduit::boxed(HttpServerCodec::new(), EchoHandler))
    }
}

fn echo_factory() -> impl floodgate_core::DelegatorFactory {
    |_worker: WorkerId| Box::new(EchoDelegator) as Box<dyn Delegator>
}

async fn read_response(stream: &mut TcpStream) -> HttpResponse {
    let mut parser = ResponseParser::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("response timed out")
            .expect("read failed");
        assert!(n > 0, "server closed before a full response arrived");
        let mut responses = parser.decode(&buf[..n]).expect("bad response bytes");
        if let Some(response) = responses.pop() {
            return response;
        }
    }
}

#[tokio::test]
async fn request_flows_through_worker_and_back() {
    let system = test_system(2);
    let server = system.attach_server(local("echo"), echo_factory()).unwrap();
    let addr = server.bound().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

    let response = read_response(&mut stream).await;
    assert_eq!(response.code.status, 200);
    assert_eq!(&response.body[..], b"/ping");

    // Same connection, second request: codec state carries over cleanly.
    stream.write_all(b"GET /pong HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(&response.body[..], b"/pong");

    system.shutdown().await;
}

/// Client-side handler: fires one request on connect, records responses.
struct RecordingClient {
    path: String,
    responses: Arc<Mutex<Vec<HttpResponse>>>,
}

impl ConnectionHandler for RecordingClient {
    type Msg = HttpResponse;
    type Reply = HttpRequest;

    fn on_connected(
        &mut self,
        _id: ConnectionId,
    ) -> Result<Vec<HandlerEvent<HttpRequest>>, HandlerError> {
        let request =
            HttpRequest::new(Method::Get, self.path.clone()).with_header("Host", "localhost");
        Ok(vec![HandlerEvent::Send(request)])
    }

    fn on_message(
        &mut self,
        response: HttpResponse,
    ) -> Result<Vec<HandlerEvent<HttpRequest>>, HandlerError> {
        self.responses.lock().unwrap().push(response);
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn outbound_connect_shares_the_worker_pool() {
    let system = test_system(2);
    let server = system.attach_server(local("echo"), echo_factory()).unwrap();
    let addr = server.bound().await.unwrap();

    let responses = Arc::new(Mutex::new(Vec::new()));
    let client = RecordingClient { path: "/from-client".to_string(), responses: Arc::clone(&responses) };
    let conduit = CodecConduit::boxed(HttpClientCodec::new(), client);

    system.connect(addr, conduit).await.unwrap();

    wait_until(|| responses.lock().unwrap().len() == 1).await;
    let got = responses.lock().unwrap();
    assert_eq!(got[0].code.status, 200);
    assert_eq!(&got[0].body[..], b"/from-client");
    drop(got);

    system.shutdown().await;
}

#[tokio::test]
async fn idle_connections_are_closed_with_idle_timeout() {
    let system = test_system(1);
    let settings = local("dozy").with_max_idle_time(Duration::from_millis(200));
    let server = system.attach_server(settings, echo_factory()).unwrap();
    let addr = server.bound().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();

    let closed = system.metrics().rate("dozy.closed");
    wait_until(|| closed.tagged_total("cause", "idle_timeout") == 1).await;
    wait_until(|| server.open_connections() == 0).await;

    let mut buf = [0u8; 1];
    let read = time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))), "socket should be closed: {read:?}");

    system.shutdown().await;
}

#[tokio::test]
async fn activity_resets_the_idle_clock() {
    let system = test_system(1);
    let settings = local("lively").with_max_idle_time(Duration::from_millis(700));
    let server = system.attach_server(settings, echo_factory()).unwrap();
    let addr = server.bound().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Keep talking for over twice the bound; the connection must survive.
    for _ in 0..5 {
        stream.write_all(b"GET /beat HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let response = read_response(&mut stream).await;
        assert_eq!(response.code.status, 200);
        time::sleep(Duration::from_millis(300)).await;
    }
    assert_eq!(server.open_connections(), 1);

    system.shutdown().await;
}

#[tokio::test]
async fn kill_shutdown_closes_connections_immediately() {
    let system = test_system(2);
    let server = system.attach_server(local("doomed"), echo_factory()).unwrap();
    let addr = server.bound().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.open_connections() == 1).await;

    server.shutdown(true).await;
    assert_eq!(server.status(), ServerStatus::Terminated);

    let mut buf = [0u8; 1];
    let read = time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))), "socket should be closed: {read:?}");

    // Refused after shutdown: the listener is gone.
    let followup = TcpStream::connect(addr).await;
    if let Ok(mut stream) = followup {
        let read = time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))), "no one should be listening");
    }

    system.shutdown().await;
}

/// Handler that emits a farewell on graceful shutdown.
struct WavingHandler;

impl ConnectionHandler for WavingHandler {
    type Msg = HttpRequest;
    type Reply = HttpResponse;

    fn on_message(
        &mut self,
        _request: HttpRequest,
    ) -> Result<Vec<HandlerEvent<HttpResponse>>, HandlerError> {
        Ok(Vec::new())
    }

    fn on_shutdown(&mut self) -> Vec<HandlerEvent<HttpResponse>> {
        vec![HandlerEvent::Send(HttpResponse::ok("goodbye")), HandlerEvent::Close]
    }
}

struct WavingDelegator;

impl Delegator for WavingDelegator {
    fn accept_new_connection(&mut self, _id: ConnectionId) -> Option<Box<dyn Conduit>> {
        Some(CodecConduit::boxed(HttpServerCodec::new(), WavingHandler))
    }
}

#[tokio::test]
async fn graceful_shutdown_lets_handlers_finish_writing() {
    let system = test_system(1);
    let server = system
        .attach_server(local("polite"), |_worker: WorkerId| {
            Box::new(WavingDelegator) as Box<dyn Delegator>
        })
        .unwrap();
    let addr = server.bound().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.open_connections() == 1).await;

    server.shutdown(false).await;

    // The farewell response arrives before the close.
    let response = read_response(&mut stream).await;
    assert_eq!(&response.body[..], b"goodbye");

    let closed = system.metrics().rate("polite.closed");
    wait_until(|| closed.tagged_total("cause", "server_shutdown") == 1).await;

    system.shutdown().await;
}

struct BroadcastCounter {
    hits: Arc<AtomicUsize>,
}

impl Delegator for BroadcastCounter {
    fn accept_new_connection(&mut self, _id: ConnectionId) -> Option<Box<dyn Conduit>> {
        Some(CodecConduit::boxed(HttpServerCodec::new(), EchoHandler))
    }

    fn handle_broadcast(&mut self, msg: &floodgate_core::BroadcastMsg) {
        if msg.downcast_ref::<String>().map(String::as_str) == Some("ping") {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn broadcast_reaches_the_delegator_on_every_worker() {
    let system = test_system(2);
    let hits = Arc::new(AtomicUsize::new(0));
    let factory_hits = Arc::clone(&hits);
    let server = system
        .attach_server(local("chatty"), move |_worker: WorkerId| {
            Box::new(BroadcastCounter { hits: Arc::clone(&factory_hits) }) as Box<dyn Delegator>
        })
        .unwrap();
    server.bound().await.unwrap();

    server.delegator_broadcast(Arc::new("ping".to_string()));

    // One delegator per worker, each hit once.
    wait_until(|| hits.load(Ordering::SeqCst) == 2).await;

    system.shutdown().await;
}

struct RecordingTask {
    bound_to: Arc<Mutex<Option<WorkerId>>>,
    seen: Arc<Mutex<Vec<u32>>>,
}

impl Task for RecordingTask {
    fn on_bound(&mut self, worker: WorkerId) {
        *self.bound_to.lock().unwrap() = Some(worker);
    }

    fn on_message(&mut self, msg: Box<dyn Any + Send>) {
        if let Ok(value) = msg.downcast::<u32>() {
            self.seen.lock().unwrap().push(*value);
        }
    }
}

#[tokio::test]
async fn tasks_bind_to_a_worker_and_receive_messages() {
    let system = test_system(2);

    let bound_to = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let task = RecordingTask { bound_to: Arc::clone(&bound_to), seen: Arc::clone(&seen) };

    let proxy = system.run(Box::new(task)).await.unwrap();
    wait_until(|| bound_to.lock().unwrap().is_some()).await;

    proxy.send(Box::new(7u32)).unwrap();
    proxy.send(Box::new(11u32)).unwrap();
    wait_until(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![7, 11]);

    system.shutdown().await;
}

struct PanickingHandler;

impl ConnectionHandler for PanickingHandler {
    type Msg = HttpRequest;
    type Reply = HttpResponse;

    fn on_message(
        &mut self,
        _request: HttpRequest,
    ) -> Result<Vec<HandlerEvent<HttpResponse>>, HandlerError> {
        panic!("handler blew up");
    }
}

struct PanickingDelegator;

impl Delegator for PanickingDelegator {
    fn accept_new_connection(&mut self, _id: ConnectionId) -> Option<Box<dyn Conduit>> {
        Some(CodecConduit::boxed(HttpServerCodec::new(), PanickingHandler))
    }
}

#[tokio::test]
async fn crashed_worker_is_restarted_with_empty_state() {
    let system = test_system(1);
    let server = system
        .attach_server(local("fragile"), |_worker: WorkerId| {
            Box::new(PanickingDelegator) as Box<dyn Delegator>
        })
        .unwrap();
    let addr = server.bound().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.open_connections() == 1).await;

    // Trip the panic; the worker dies with the connection on it.
    stream.write_all(b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

    let restarts = system.metrics().counter("worker_restarts");
    wait_until(|| restarts.value() == 1).await;

    // The loss is reconciled with the server's accounting...
    wait_until(|| server.open_connections() == 0).await;
    let closed = system.metrics().rate("fragile.closed");
    assert_eq!(closed.tagged_total("cause", "worker_failure"), 1);

    // ...and the restarted worker accepts new connections for the same
    // server.
    let _second = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.open_connections() == 1).await;

    system.shutdown().await;
}

#[tokio::test]
async fn handler_errors_close_only_their_own_connection() {
    struct FailingHandler;

    impl ConnectionHandler for FailingHandler {
        type Msg = HttpRequest;
        type Reply = HttpResponse;

        fn on_message(
            &mut self,
            _request: HttpRequest,
        ) -> Result<Vec<HandlerEvent<HttpResponse>>, HandlerError> {
            Err(HandlerError::msg("application failure"))
        }
    }

    struct FailingDelegator;

    impl Delegator for FailingDelegator {
        fn accept_new_connection(&mut self, _id: ConnectionId) -> Option<Box<dyn Conduit>> {
            Some(CodecConduit::boxed(HttpServerCodec::new(), FailingHandler))
        }
    }

    let system = test_system(1);
    let server = system
        .attach_server(local("flaky"), |_worker: WorkerId| {
            Box::new(FailingDelegator) as Box<dyn Delegator>
        })
        .unwrap();
    let addr = server.bound().await.unwrap();

    let mut failing = TcpStream::connect(addr).await.unwrap();
    let healthy = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.open_connections() == 2).await;

    failing.write_all(b"GET /fail HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

    let closed = system.metrics().rate("flaky.closed");
    wait_until(|| closed.tagged_total("cause", "handler_error") == 1).await;

    // The worker survived; the other connection is untouched.
    assert_eq!(server.open_connections(), 1);
    assert_eq!(system.metrics().counter("worker_restarts").value(), 0);
    drop(healthy);

    system.shutdown().await;
}

#[tokio::test]
async fn protocol_violations_close_with_their_cause() {
    let system = test_system(1);
    let server = system.attach_server(local("strict"), echo_factory()).unwrap();
    let addr = server.bound().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"NOT HTTP AT ALL\n").await.unwrap();

    let closed = system.metrics().rate("strict.closed");
    wait_until(|| closed.tagged_total("cause", "protocol_violation") == 1).await;

    system.shutdown().await;
}

#[tokio::test]
async fn zero_worker_system_rejects_everything() {
    let system = test_system(0);

    let attach = system.attach_server(local("nowhere"), echo_factory());
    assert!(matches!(attach, Err(SystemError::NoWorkers)));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let bound_to = Arc::new(Mutex::new(None));
    let task = RecordingTask { bound_to, seen };
    let run = system.run(Box::new(task)).await;
    assert!(matches!(run, Err(SystemError::NoWorkers)));

    system.shutdown().await;
}
