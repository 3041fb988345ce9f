//! End-to-end dispatcher tests against an in-process fake runner.
//!
//! The fake runner speaks the real control protocol over a socket pair
//! and connects fake workers to the real rendezvous socket, so every
//! host-side path (admission, FIFO acquisition, broadcast load, timeout,
//! cancel, delete, respawn bookkeeping) runs exactly as in production.
//! Only the clone/pivot machinery is faked, since namespace privileges
//! are not available everywhere tests run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use kiln_core::framing::FrameCodec;
use kiln_core::messages::{
    Ack, CallbackRequest, ExecRequest, ExecResponse, ExecStatus, WireMessage,
};
use kiln_core::{CodeToken, ErrorKind, ExecutionToken, ServiceConfig};
use kiln_host::dispatcher::{Dispatcher, ExecuteOutcome, LoadSource, LoadSpec, UdfRequest};
use kiln_host::functions::FunctionRegistry;
use kiln_host::pool::{WorkerPool, run_acceptor};
use kiln_host::runner::ControlClient;
use kiln_host::sideband::{Metadata, Sideband};
use kiln_host::ResponsePayload;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------
// Fake runner
// ----------------------------------------------------------------------

struct FakeEntry {
    egress: bool,
    workers: HashMap<String, CancellationToken>,
}

struct FakeRunner {
    rendezvous: PathBuf,
    log_dir: PathBuf,
    entries: HashMap<String, FakeEntry>,
    /// Spawn attempts that report failure instead of connecting.
    fail_spawns: usize,
    exits_tx: mpsc::UnboundedSender<(String, String)>,
}

impl FakeRunner {
    fn spawn_worker(&mut self, code_token: &str) -> Option<WireMessage> {
        if self.fail_spawns > 0 {
            self.fail_spawns -= 1;
            return Some(WireMessage::SpawnFailed(kiln_core::messages::SpawnFailed {
                code_token: code_token.to_owned(),
                message: "injected spawn failure".to_owned(),
            }));
        }
        let Some(entry) = self.entries.get_mut(code_token) else {
            return None;
        };
        let execution_token = ExecutionToken::generate().to_string();
        let cancel = CancellationToken::new();
        entry
            .workers
            .insert(execution_token.clone(), cancel.clone());
        tokio::spawn(fake_worker(
            self.rendezvous.clone(),
            self.log_dir.clone(),
            code_token.to_owned(),
            execution_token,
            entry.egress,
            cancel,
            self.exits_tx.clone(),
        ));
        None
    }
}

/// Drives the runner side of the control channel and respawns workers
/// whose connections ended while their entry is still loaded.
async fn fake_runner(control: UnixStream, rendezvous: PathBuf, log_dir: PathBuf, fail_spawns: usize) {
    let mut framed = Framed::new(control, FrameCodec::new());
    let (exits_tx, mut exits_rx) = mpsc::unbounded_channel::<(String, String)>();
    let mut runner = FakeRunner {
        rendezvous,
        log_dir,
        entries: HashMap::new(),
        fail_spawns,
        exits_tx,
    };
    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(Ok(frame)) = frame else { return };
                let Ok(message) = WireMessage::decode(&frame) else { return };
                match message {
                    WireMessage::LoadBinary(load) => {
                        let ack = if !load.source_code_token.is_empty()
                            && !runner.entries.contains_key(&load.source_code_token)
                        {
                            Ack {
                                request_id: load.request_id,
                                ok: false,
                                message: format!("unknown source token {}", load.source_code_token),
                            }
                        } else {
                            runner.entries.insert(
                                load.code_token.clone(),
                                FakeEntry {
                                    egress: load.enable_log_egress,
                                    workers: HashMap::new(),
                                },
                            );
                            Ack {
                                request_id: load.request_id,
                                ok: true,
                                message: String::new(),
                            }
                        };
                        let ok = ack.ok;
                        let _ = framed.send(Bytes::from(WireMessage::Ack(ack).encode())).await;
                        if ok {
                            for _ in 0..load.n_workers {
                                if let Some(event) = runner.spawn_worker(&load.code_token) {
                                    let _ = framed.send(Bytes::from(event.encode())).await;
                                }
                            }
                        }
                    }
                    WireMessage::DeleteBinary(delete) => {
                        if let Some(entry) = runner.entries.remove(&delete.code_token) {
                            for cancel in entry.workers.values() {
                                cancel.cancel();
                            }
                        }
                        let ack = WireMessage::Ack(Ack {
                            request_id: delete.request_id,
                            ok: true,
                            message: String::new(),
                        });
                        let _ = framed.send(Bytes::from(ack.encode())).await;
                    }
                    WireMessage::CancelExecution(cancel_msg) => {
                        for entry in runner.entries.values() {
                            if let Some(cancel) = entry.workers.get(&cancel_msg.execution_token) {
                                cancel.cancel();
                            }
                        }
                        let ack = WireMessage::Ack(Ack {
                            request_id: cancel_msg.request_id,
                            ok: true,
                            message: String::new(),
                        });
                        let _ = framed.send(Bytes::from(ack.encode())).await;
                    }
                    WireMessage::Shutdown(shutdown) => {
                        let ack = WireMessage::Ack(Ack {
                            request_id: shutdown.request_id,
                            ok: true,
                            message: String::new(),
                        });
                        let _ = framed.send(Bytes::from(ack.encode())).await;
                        return;
                    }
                    _ => {}
                }
            }
            exited = exits_rx.recv() => {
                let Some((code_token, execution_token)) = exited else { return };
                let still_loaded = runner
                    .entries
                    .get_mut(&code_token)
                    .map(|entry| {
                        entry.workers.remove(&execution_token);
                        true
                    })
                    .unwrap_or(false);
                if still_loaded {
                    if let Some(event) = runner.spawn_worker(&code_token) {
                        let _ = framed.send(Bytes::from(event.encode())).await;
                    }
                }
            }
        }
    }
}

/// One fake worker: rendezvous hello, then the serve loop. Handlers:
///
/// - `Sample`: responds `"Hello, world!"`
/// - `Echo`: responds with the first input
/// - `Sleep`: sleeps for the millis in the first input, then responds
/// - `Fail`: structured handler error
/// - `Crash`: drops the connection without responding
/// - `LogA`: writes "A" to its log file, then responds
/// - `CallHost`: invokes host function `lookup` and echoes its reply
async fn fake_worker(
    rendezvous: PathBuf,
    log_dir: PathBuf,
    code_token: String,
    execution_token: String,
    egress: bool,
    cancel: CancellationToken,
    exits: mpsc::UnboundedSender<(String, String)>,
) {
    let run = async {
        let mut stream = UnixStream::connect(&rendezvous).await.ok()?;
        stream.write_all(code_token.as_bytes()).await.ok()?;
        stream.write_all(execution_token.as_bytes()).await.ok()?;
        let mut framed = Framed::new(stream, FrameCodec::new());
        loop {
            let frame = tokio::select! {
                frame = framed.next() => frame,
                () = cancel.cancelled() => return Some(()),
            };
            let request = match frame {
                Some(Ok(payload)) => match WireMessage::decode(&payload) {
                    Ok(WireMessage::ExecRequest(request)) => request,
                    _ => return Some(()),
                },
                _ => return Some(()),
            };
            let response = match request.handler_name.as_str() {
                "Crash" => return Some(()),
                "Sleep" => {
                    let millis: u64 = request
                        .inputs
                        .first()
                        .and_then(|input| std::str::from_utf8(input).ok())
                        .and_then(|text| text.parse().ok())
                        .unwrap_or(10);
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_millis(millis)) => {}
                        () = cancel.cancelled() => return Some(()),
                    }
                    ok_response(&request, b"\"slept\"".to_vec())
                }
                "Sample" => ok_response(&request, b"\"Hello, world!\"".to_vec()),
                "Echo" => ok_response(
                    &request,
                    request.inputs.first().cloned().unwrap_or_default(),
                ),
                "Fail" => ExecResponse {
                    uuid: request.uuid.clone(),
                    status: ExecStatus::HandlerError as i32,
                    output: Vec::new(),
                    error_message: "deliberate failure".to_owned(),
                    metrics: HashMap::new(),
                },
                "LogA" => {
                    if egress {
                        let path = log_dir.join(format!("{execution_token}.log"));
                        let _ = std::fs::write(path, "A");
                    }
                    ok_response(&request, b"\"logged\"".to_vec())
                }
                "CallHost" => {
                    let callback = WireMessage::CallbackRequest(CallbackRequest {
                        uuid: request.uuid.clone(),
                        function_name: "lookup".to_owned(),
                        io_payload: b"key".to_vec(),
                    });
                    framed.send(Bytes::from(callback.encode())).await.ok()?;
                    let reply = framed.next().await?.ok()?;
                    let payload = match WireMessage::decode(&reply) {
                        Ok(WireMessage::CallbackResponse(reply)) => reply.io_payload,
                        _ => return Some(()),
                    };
                    ok_response(&request, payload)
                }
                _ => ExecResponse {
                    uuid: request.uuid.clone(),
                    status: ExecStatus::HandlerNotFound as i32,
                    output: Vec::new(),
                    error_message: format!("no handler {}", request.handler_name),
                    metrics: HashMap::new(),
                },
            };
            framed
                .send(Bytes::from(WireMessage::ExecResponse(response).encode()))
                .await
                .ok()?;
        }
    };
    let _ = run.await;
    let _ = exits.send((code_token, execution_token));
}

fn ok_response(request: &ExecRequest, output: Vec<u8>) -> ExecResponse {
    let mut metrics = HashMap::new();
    metrics.insert("udf.handler_duration_ns".to_owned(), 1_000u64);
    ExecResponse {
        uuid: request.uuid.clone(),
        status: ExecStatus::Ok as i32,
        output,
        error_message: String::new(),
        metrics,
    }
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

struct Harness {
    dispatcher: Arc<Dispatcher>,
    _dir: tempfile::TempDir,
}

async fn harness_with(
    mutate: impl FnOnce(&mut ServiceConfig),
    functions: FunctionRegistry,
    fail_spawns: usize,
) -> Harness {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });

    let dir = tempfile::tempdir().unwrap();
    let mut config = ServiceConfig {
        socket_dir: dir.path().join("sock"),
        log_dir: dir.path().join("log"),
        default_execute_timeout: Duration::from_secs(5),
        ..ServiceConfig::default()
    };
    mutate(&mut config);
    std::fs::create_dir_all(&config.socket_dir).unwrap();
    std::fs::create_dir_all(&config.log_dir).unwrap();

    let rendezvous = config.rendezvous_socket_path();
    let listener = tokio::net::UnixListener::bind(&rendezvous).unwrap();
    let (host_ctrl, runner_ctrl) = UnixStream::pair().unwrap();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let control = ControlClient::start(host_ctrl, config.max_frame_len, events_tx.clone());
    let pool = Arc::new(WorkerPool::new(config.max_frame_len));
    tokio::spawn(run_acceptor(listener, Arc::clone(&pool), events_tx));
    tokio::spawn(fake_runner(
        runner_ctrl,
        rendezvous,
        config.log_dir.clone(),
        fail_spawns,
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        config,
        pool,
        control,
        Arc::new(Sideband::new()),
        Arc::new(functions),
    ));
    dispatcher.spawn_event_task(events_rx);
    Harness {
        dispatcher,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}, FunctionRegistry::with_log_binding(), 0).await
}

fn request(handler: &str, inputs: &[&[u8]]) -> UdfRequest {
    UdfRequest {
        handler_name: handler.to_owned(),
        inputs: inputs.iter().map(|input| input.to_vec()).collect(),
        ..UdfRequest::default()
    }
}

fn callback() -> (
    kiln_host::ExecuteCallback,
    oneshot::Receiver<ExecuteOutcome>,
) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }),
        rx,
    )
}

async fn load(dispatcher: &Arc<Dispatcher>, workers: usize) -> CodeToken {
    dispatcher
        .load(LoadSpec {
            source: LoadSource::BinaryBytes(b"#!udf-test-binary\x00payload".to_vec()),
            worker_count: Some(workers),
            log_egress: false,
        })
        .await
        .unwrap()
}

async fn wait_for_idle(dispatcher: &Arc<Dispatcher>, token: &CodeToken, want: usize, within: Duration) {
    let deadline = Instant::now() + within;
    loop {
        if dispatcher.pool().idle_count(token) >= want {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "idle count never reached {want} (at {})",
            dispatcher.pool().idle_count(token)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ----------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn load_brings_up_requested_workers() {
    let h = harness().await;
    let token = load(&h.dispatcher, 2).await;
    assert_eq!(token.as_str().len(), 36);
    assert_eq!(h.dispatcher.pool().idle_count(&token), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_roundtrip_delivers_output_and_scopes_metadata() {
    let h = harness().await;
    let token = load(&h.dispatcher, 2).await;

    let (cb, rx) = callback();
    let mut metadata = Metadata::new();
    metadata.insert("tenant".to_owned(), "acme".to_owned());
    let uuid = h
        .dispatcher
        .execute(&token, request("Sample", &[b"Hello"]), metadata, cb)
        .unwrap();
    assert_eq!(uuid.as_str().len(), 36);

    let outcome = rx.await.unwrap();
    let response = outcome.result.unwrap();
    match response.payload {
        ResponsePayload::Json(text) => assert!(text.contains("Hello, world!")),
        ResponsePayload::Bytes(_) => panic!("expected json payload by default"),
    }
    assert!(response.metrics.contains_key("udf.handler_duration_ns"));
    // No egress was requested at load.
    assert_eq!(outcome.logs.unwrap_err().kind(), ErrorKind::NotFound);
    // Metadata sideband is scoped to the request lifetime.
    assert_eq!(h.dispatcher.sideband().len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn sideband_entry_exists_exactly_while_running() {
    let h = harness().await;
    let token = load(&h.dispatcher, 1).await;

    let mut metadata = Metadata::new();
    metadata.insert("tenant".to_owned(), "acme".to_owned());
    let (cb, rx) = callback();
    let uuid = h
        .dispatcher
        .execute(&token, request("Sleep", &[b"500"]), metadata, cb)
        .unwrap();

    // While the request runs, exactly its one entry is live and it is
    // addressable by the request uuid.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.dispatcher.sideband().len(), 1);
    let tenant = h
        .dispatcher
        .sideband()
        .with_value(uuid.as_str(), |entry| entry.metadata["tenant"].clone());
    assert_eq!(tenant.as_deref(), Some("acme"));

    let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.result.is_ok());
    assert_eq!(h.dispatcher.sideband().len(), 0);
    assert_eq!(
        h.dispatcher.sideband().with_value(uuid.as_str(), |_| ()),
        None
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_output_tag_skips_json() {
    let h = harness().await;
    let token = load(&h.dispatcher, 1).await;
    let mut req = request("Echo", &[&[0xFF, 0xFE]]);
    req.tags
        .insert("roma.input_type".to_owned(), "bytes".to_owned());
    let (cb, rx) = callback();
    h.dispatcher
        .execute(&token, req, Metadata::new(), cb)
        .unwrap();
    let outcome = rx.await.unwrap();
    assert_eq!(
        outcome.result.unwrap().payload,
        ResponsePayload::Bytes(vec![0xFF, 0xFE])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_rejections_are_synchronous() {
    let h = harness().await;
    let token = load(&h.dispatcher, 1).await;

    let (cb, _rx) = callback();
    let err = h
        .dispatcher
        .execute(&token, request("", &[]), Metadata::new(), cb)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let (cb, _rx) = callback();
    let mut oversized = Metadata::new();
    oversized.insert("k".to_owned(), "v".repeat(1024 * 1024));
    let err = h
        .dispatcher
        .execute(&token, request("Echo", &[]), oversized, cb)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let (cb, _rx) = callback();
    let err = h
        .dispatcher
        .execute(
            &CodeToken::generate(),
            request("Echo", &[]),
            Metadata::new(),
            cb,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let (cb, _rx) = callback();
    let mut req = request("Echo", &[]);
    req.tags
        .insert("roma.timeout".to_owned(), "whenever".to_owned());
    let err = h
        .dispatcher
        .execute(&token, req, Metadata::new(), cb)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_cap_returns_queue_full() {
    let h = harness_with(
        |config| config.worker_queue_cap = 5,
        FunctionRegistry::new(),
        0,
    )
    .await;
    let token = load(&h.dispatcher, 2).await; // cap = 2 * 5 = 10

    let completions = Arc::new(AtomicUsize::new(0));
    let mut receivers = Vec::new();
    let mut rejected = 0;
    for _ in 0..11 {
        let (cb, rx) = callback();
        match h
            .dispatcher
            .execute(&token, request("Sleep", &[b"50"]), Metadata::new(), cb)
        {
            Ok(_) => receivers.push(rx),
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::QueueFull);
                rejected += 1;
            }
        }
    }
    assert_eq!(rejected, 1);
    for rx in receivers {
        let outcome = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.result.is_ok());
        completions.fetch_add(1, Ordering::SeqCst);
    }
    assert_eq!(completions.load(Ordering::SeqCst), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn acquisition_is_fifo_per_token() {
    let h = harness().await;
    let token = load(&h.dispatcher, 1).await;

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut receivers = Vec::new();
    for index in 0..4 {
        let order = Arc::clone(&order);
        let (tx, rx) = oneshot::channel();
        let cb: kiln_host::ExecuteCallback = Box::new(move |outcome: ExecuteOutcome| {
            order.lock().unwrap().push(index);
            let _ = tx.send(outcome);
        });
        h.dispatcher
            .execute(&token, request("Sleep", &[b"30"]), Metadata::new(), cb)
            .unwrap();
        receivers.push(rx);
    }
    for rx in receivers {
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
    }
    // One worker serves all four, so completion order is acquisition
    // order, which is admission order.
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_fires_and_worker_is_replaced() {
    let h = harness().await;
    let token = load(&h.dispatcher, 1).await;

    let mut req = request("Sleep", &[b"60000"]);
    req.tags.insert("roma.timeout".to_owned(), "1s".to_owned());
    let (cb, rx) = callback();
    let started = Instant::now();
    h.dispatcher
        .execute(&token, req, Metadata::new(), cb)
        .unwrap();
    let outcome = rx.await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Timeout);
    assert!(elapsed >= Duration::from_millis(950), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "fired late: {elapsed:?}");

    // The hung worker was killed and a replacement reaches Idle.
    wait_for_idle(&h.dispatcher, &token, 1, Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_running_request_recovers_pool() {
    let h = harness().await;
    let token = load(&h.dispatcher, 2).await;

    let (cb, rx) = callback();
    let uuid = h
        .dispatcher
        .execute(&token, request("Sleep", &[b"60000"]), Metadata::new(), cb)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    h.dispatcher.cancel(&uuid);
    let outcome = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("cancel must resolve within a second")
        .unwrap();
    assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1));

    wait_for_idle(&h.dispatcher, &token, 2, Duration::from_secs(5)).await;

    // Cancelling a finished request is a no-op.
    h.dispatcher.cancel(&uuid);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_queued_request_dequeues_it() {
    let h = harness().await;
    let token = load(&h.dispatcher, 1).await;

    let (cb_a, rx_a) = callback();
    h.dispatcher
        .execute(&token, request("Sleep", &[b"300"]), Metadata::new(), cb_a)
        .unwrap();
    let (cb_b, rx_b) = callback();
    let uuid_b = h
        .dispatcher
        .execute(&token, request("Echo", &[b"x"]), Metadata::new(), cb_b)
        .unwrap();

    h.dispatcher.cancel(&uuid_b);
    let outcome_b = tokio::time::timeout(Duration::from_secs(1), rx_b)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome_b.result.unwrap_err().kind(), ErrorKind::Cancelled);

    // The in-flight request is untouched.
    let outcome_a = tokio::time::timeout(Duration::from_secs(5), rx_a)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome_a.result.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_crash_surfaces_transport_error_and_respawns() {
    let h = harness().await;
    let token = load(&h.dispatcher, 2).await;

    let (cb, rx) = callback();
    h.dispatcher
        .execute(&token, request("Crash", &[]), Metadata::new(), cb)
        .unwrap();
    let outcome = rx.await.unwrap();
    assert_eq!(
        outcome.result.unwrap_err().kind(),
        ErrorKind::TransportError
    );

    // The runner notices the death and brings a replacement to Idle.
    wait_for_idle(&h.dispatcher, &token, 2, Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn structured_udf_failure_keeps_worker() {
    let h = harness().await;
    let token = load(&h.dispatcher, 1).await;

    let (cb, rx) = callback();
    h.dispatcher
        .execute(&token, request("Fail", &[]), Metadata::new(), cb)
        .unwrap();
    let outcome = rx.await.unwrap();
    let err = outcome.result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UdfFailure);
    assert!(err.to_string().contains("deliberate failure"));

    // Same worker serves the next request immediately.
    let (cb, rx) = callback();
    h.dispatcher
        .execute(&token, request("Echo", &[b"still alive"]), Metadata::new(), cb)
        .unwrap();
    assert!(rx.await.unwrap().result.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn all_or_nothing_load_tears_down_survivors() {
    let h = harness_with(|_| {}, FunctionRegistry::new(), 1).await;
    let err = h
        .dispatcher
        .load(LoadSpec {
            source: LoadSource::BinaryBytes(b"payload".to_vec()),
            worker_count: Some(3),
            log_egress: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WorkerUnavailable);
    assert!(err.to_string().contains("injected spawn failure"));
}

#[tokio::test(flavor = "multi_thread")]
async fn alias_survives_deletion_of_original_and_captures_logs() {
    let h = harness().await;
    let token = load(&h.dispatcher, 2).await;
    let alias = h
        .dispatcher
        .load_for_logging(&token, Some(2))
        .await
        .unwrap();
    assert_ne!(alias, token);

    h.dispatcher.delete(&token);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Execute on the original now fails...
    let (cb, _rx) = callback();
    let err = h
        .dispatcher
        .execute(&token, request("Echo", &[]), Metadata::new(), cb)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // ...but the alias keeps serving, with captured logs.
    let (cb, rx) = callback();
    h.dispatcher
        .execute(&alias, request("LogA", &[]), Metadata::new(), cb)
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.result.is_ok());
    assert_eq!(outcome.logs.unwrap(), "A");
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_drains_in_flight_requests_with_cancelled() {
    let h = harness().await;
    let token = load(&h.dispatcher, 1).await;

    let (cb, rx) = callback();
    h.dispatcher
        .execute(&token, request("Sleep", &[b"60000"]), Metadata::new(), cb)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.dispatcher.delete(&token);
    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Cancelled);

    let (cb, _rx) = callback();
    let err = h
        .dispatcher
        .execute(&token, request("Echo", &[]), Metadata::new(), cb)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_execute_preserves_submission_order() {
    let h = harness().await;
    let token = load(&h.dispatcher, 2).await;

    let (tx, rx) = oneshot::channel();
    let requests = vec![
        request("Echo", &[b"first"]),
        request("Fail", &[]),
        request("Echo", &[b"third"]),
    ];
    let admissions = h.dispatcher.batch_execute(
        &token,
        requests,
        &Metadata::new(),
        Box::new(move |outcomes| {
            let _ = tx.send(outcomes);
        }),
    );
    assert_eq!(admissions.len(), 3);
    assert!(admissions.iter().all(Result::is_ok));

    let outcomes = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    match &outcomes[0].result {
        Ok(response) => assert_eq!(response.payload, ResponsePayload::Json("first".to_owned())),
        Err(e) => panic!("first outcome failed: {e}"),
    }
    assert_eq!(
        outcomes[1].result.as_ref().unwrap_err().kind(),
        ErrorKind::UdfFailure
    );
    match &outcomes[2].result {
        Ok(response) => assert_eq!(response.payload, ResponsePayload::Json("third".to_owned())),
        Err(e) => panic!("third outcome failed: {e}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_callbacks_route_through_function_registry() {
    let functions = FunctionRegistry::new();
    functions
        .register(
            "lookup",
            Box::new(|entry, payload| {
                assert_eq!(payload, b"key");
                Ok(entry
                    .metadata
                    .get("tenant")
                    .cloned()
                    .unwrap_or_default()
                    .into_bytes())
            }),
        )
        .unwrap();
    let h = harness_with(|_| {}, functions, 0).await;
    let token = load(&h.dispatcher, 1).await;

    let mut metadata = Metadata::new();
    metadata.insert("tenant".to_owned(), "acme".to_owned());
    let (cb, rx) = callback();
    h.dispatcher
        .execute(&token, request("CallHost", &[]), metadata, cb)
        .unwrap();
    let outcome = rx.await.unwrap();
    assert_eq!(
        outcome.result.unwrap().payload,
        ResponsePayload::Json("acme".to_owned())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn load_for_logging_of_unknown_token_is_not_found() {
    let h = harness().await;
    let err = h
        .dispatcher
        .load_for_logging(&CodeToken::generate(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
