use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tether_client_channel::{
    CallArgs, ConnectArgs, ConnectResult, Connector, StreamOp, Subchannel, Transport,
    transport::testing::EndpointTransport,
};
use tether_core::{
    ChannelArgs, ConnectivityState, CoreError, Endpoint, ErrorCategory, ShutdownSignal,
    SliceBuffer, codes, endpoint::testing::MemoryEndpoint, keys,
};
use tokio::{sync::mpsc, time::Instant};

#[derive(Clone, Copy, Debug)]
enum Outcome {
    Fail,
    Succeed,
    Hang,
}

/// 按脚本返回结果的连接器，记录每次连接的时刻与并发度。
struct ScriptedConnector {
    outcomes: Mutex<VecDeque<Outcome>>,
    attempts: Mutex<Vec<Instant>>,
    peers: Mutex<Vec<Arc<MemoryEndpoint>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    shutdowns: AtomicUsize,
    signal: ShutdownSignal,
}

impl ScriptedConnector {
    fn new(outcomes: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            attempts: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            signal: ShutdownSignal::new(),
        })
    }

    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().expect("attempts").clone()
    }

    fn peer(&self, index: usize) -> Arc<MemoryEndpoint> {
        Arc::clone(&self.peers.lock().expect("peers")[index])
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _args: ConnectArgs) -> Result<ConnectResult, CoreError> {
        self.attempts.lock().expect("attempts").push(Instant::now());
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .lock()
            .expect("outcomes")
            .pop_front()
            .unwrap_or(Outcome::Fail);
        let result = match outcome {
            Outcome::Fail => Err(CoreError::new(codes::TRANSPORT_CONNECT_FAILED, "refused")),
            Outcome::Succeed => {
                let (client, server) = MemoryEndpoint::pair("client", "backend");
                self.peers.lock().expect("peers").push(server);
                let transport = EndpointTransport::new(client);
                transport.start_reading(SliceBuffer::new());
                Ok(ConnectResult {
                    transport,
                    channel_args: ChannelArgs::new(),
                })
            }
            Outcome::Hang => {
                let why = self.signal.triggered().await;
                Err(CoreError::wrap(codes::CONNECTOR_SHUTDOWN, "Connector shutdown", why))
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn shutdown(&self, why: CoreError) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.signal.trigger(why);
    }
}

type States = mpsc::UnboundedReceiver<(ConnectivityState, Option<CoreError>)>;

async fn next_state(states: &mut States) -> (ConnectivityState, Option<CoreError>) {
    states.recv().await.expect("state stream open")
}

/// 定时器以毫秒为刻度，允许一个刻度的误差。
fn assert_delay(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual <= expected + Duration::from_millis(1),
        "delay {actual:?}, expected {expected:?}"
    );
}

async fn expect_states(states: &mut States, expected: &[ConnectivityState]) {
    for want in expected {
        assert_eq!(next_state(states).await.0, *want);
    }
}

#[tokio::test(start_paused = true)]
async fn lazy_connect_waits_for_first_watcher() {
    let connector = ScriptedConnector::new([Outcome::Succeed]);
    let subchannel = Subchannel::create(connector.clone(), "backend:1", &ChannelArgs::new());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(connector.attempts().is_empty());
    assert_eq!(subchannel.check_connectivity(), ConnectivityState::Idle);

    let mut states = subchannel.watch_states();
    expect_states(
        &mut states,
        &[
            ConnectivityState::Idle,
            ConnectivityState::Connecting,
            ConnectivityState::Ready,
        ],
    )
    .await;
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test]
async fn only_one_connect_is_in_flight() {
    let connector = ScriptedConnector::new([Outcome::Hang]);
    let subchannel = Subchannel::create(connector.clone(), "backend:1", &ChannelArgs::new());

    let mut states = subchannel.watch_states();
    for _ in 0..3 {
        subchannel.notify_on_state_change(ConnectivityState::Idle, Box::new(|_, _| {}));
    }
    expect_states(
        &mut states,
        &[ConnectivityState::Idle, ConnectivityState::Connecting],
    )
    .await;
    for _ in 0..3 {
        subchannel.notify_on_state_change(ConnectivityState::Connecting, Box::new(|_, _| {}));
        tokio::task::yield_now().await;
    }
    assert_eq!(connector.attempts().len(), 1);
    assert_eq!(connector.max_in_flight.load(Ordering::SeqCst), 1);

    drop(subchannel);
    let (state, error) = next_state(&mut states).await;
    assert_eq!(state, ConnectivityState::Shutdown);
    assert_eq!(error.map(|e| e.code()), Some(codes::SUBCHANNEL_DISCONNECTED));
    assert_eq!(connector.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn fixed_backoff_spaces_retries_evenly() {
    let connector = ScriptedConnector::new([Outcome::Fail, Outcome::Fail, Outcome::Succeed]);
    let args = ChannelArgs::new().with_int(keys::FIXED_RECONNECT_BACKOFF_MS, 1_000);
    let subchannel = Subchannel::create(connector.clone(), "backend:1", &args);

    let mut states = subchannel.watch_states();
    expect_states(
        &mut states,
        &[ConnectivityState::Idle, ConnectivityState::Connecting],
    )
    .await;
    let (state, error) = next_state(&mut states).await;
    assert_eq!(state, ConnectivityState::TransientFailure);
    let error = error.expect("failure status");
    assert_eq!(error.code(), codes::SUBCHANNEL_CONNECT_FAILED);
    assert_eq!(error.message(), "Connect Failed");
    assert_eq!(error.category(), ErrorCategory::Unavailable);
    assert!(error.find_code(codes::TRANSPORT_CONNECT_FAILED).is_some());

    expect_states(
        &mut states,
        &[
            ConnectivityState::Connecting,
            ConnectivityState::TransientFailure,
            ConnectivityState::Connecting,
            ConnectivityState::Ready,
        ],
    )
    .await;
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 3);
    assert_delay(attempts[1] - attempts[0], Duration::from_secs(1));
    assert_delay(attempts[2] - attempts[1], Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_grows_between_failures() {
    let connector = ScriptedConnector::new([Outcome::Fail, Outcome::Fail, Outcome::Fail]);
    let args = ChannelArgs::new()
        .with_int(keys::INITIAL_RECONNECT_BACKOFF_MS, 1_000)
        .with_int(keys::MIN_RECONNECT_BACKOFF_MS, 100)
        .with_int(keys::MAX_RECONNECT_BACKOFF_MS, 60_000);
    let subchannel = Subchannel::create(connector.clone(), "backend:1", &args);

    let mut states = subchannel.watch_states();
    while connector.attempts().len() < 3 {
        next_state(&mut states).await;
    }
    let attempts = connector.attempts();
    assert_delay(attempts[1] - attempts[0], Duration::from_secs(1));
    let second = (attempts[2] - attempts[1]).as_secs_f64();
    assert!(
        (1.6 * 0.8 - 1e-3..=1.6 * 1.2 + 1e-3).contains(&second),
        "second retry delay {second}s outside 1.6s ± 20%"
    );
}

#[tokio::test]
async fn transport_loss_reconnects_without_backoff() {
    let connector = ScriptedConnector::new([Outcome::Succeed, Outcome::Succeed]);
    let args = ChannelArgs::new().with_int(keys::FIXED_RECONNECT_BACKOFF_MS, 60_000);
    let subchannel = Subchannel::create(connector.clone(), "backend:1", &args);

    let mut states = subchannel.watch_states();
    expect_states(
        &mut states,
        &[
            ConnectivityState::Idle,
            ConnectivityState::Connecting,
            ConnectivityState::Ready,
        ],
    )
    .await;
    let first = subchannel.connected_subchannel().expect("connected");

    connector
        .peer(0)
        .shutdown(CoreError::new(codes::ENDPOINT_SHUTDOWN, "backend went away"));
    let (state, error) = next_state(&mut states).await;
    assert_eq!(state, ConnectivityState::TransientFailure);
    let error = error.expect("loss status");
    assert_eq!(error.code(), codes::TRANSPORT_LOST);
    assert_eq!(error.message(), "Transport lost");

    expect_states(
        &mut states,
        &[ConnectivityState::Connecting, ConnectivityState::Ready],
    )
    .await;
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert!(attempts[1] - attempts[0] < Duration::from_secs(1));

    let second = subchannel.connected_subchannel().expect("reconnected");
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(
        first.check_connectivity(),
        ConnectivityState::TransientFailure
    );
    drop(first);
}

#[tokio::test]
async fn last_strong_drop_releases_connection() {
    let connector = ScriptedConnector::new([Outcome::Succeed]);
    let subchannel = Subchannel::create(connector.clone(), "backend:1", &ChannelArgs::new());
    let spare = subchannel.clone();
    let weak = subchannel.downgrade();

    let mut states = subchannel.watch_states();
    expect_states(
        &mut states,
        &[
            ConnectivityState::Idle,
            ConnectivityState::Connecting,
            ConnectivityState::Ready,
        ],
    )
    .await;
    let connected = Arc::downgrade(&subchannel.connected_subchannel().expect("connected"));

    drop(subchannel);
    assert_eq!(weak.check_connectivity(), ConnectivityState::Ready);
    drop(spare);
    assert_eq!(next_state(&mut states).await.0, ConnectivityState::Shutdown);
    assert!(weak.upgrade().is_none());
    assert!(connected.upgrade().is_none());

    let backend = connector.peer(0);
    let mut slices = SliceBuffer::new();
    let err = backend
        .read(&mut slices, false)
        .await
        .expect_err("client side closed");
    assert_eq!(err.code(), codes::ENDPOINT_CLOSED);
}

#[tokio::test]
async fn cancelled_watch_fires_once_with_cancellation() {
    let connector = ScriptedConnector::new([Outcome::Hang]);
    let subchannel = Subchannel::create(connector.clone(), "backend:1", &ChannelArgs::new());
    let fired = Arc::new(Mutex::new(Vec::new()));

    let observed = Arc::clone(&fired);
    let id = subchannel
        .notify_on_state_change(
            ConnectivityState::Idle,
            Box::new(move |state, error| {
                observed
                    .lock()
                    .expect("fired")
                    .push((state, error.map(|e| e.code())));
            }),
        )
        .expect("registered");
    subchannel.cancel_watch(id);
    subchannel.cancel_watch(id);

    assert_eq!(
        *fired.lock().expect("fired"),
        vec![(ConnectivityState::Idle, Some(codes::WATCH_CANCELLED))]
    );
}

#[tokio::test]
async fn calls_flow_over_the_ready_connection() {
    let connector = ScriptedConnector::new([Outcome::Succeed]);
    let subchannel = Subchannel::create(connector.clone(), "backend:1", &ChannelArgs::new());
    let mut states = subchannel.watch_states();
    expect_states(
        &mut states,
        &[
            ConnectivityState::Idle,
            ConnectivityState::Connecting,
            ConnectivityState::Ready,
        ],
    )
    .await;

    let connected = subchannel.connected_subchannel().expect("connected");
    connected.ping().await.expect("ping");
    let mut call = connected
        .create_call(&CallArgs {
            path: "/echo.Echo/Say".into(),
            deadline: None,
        })
        .expect("call");
    assert_eq!(call.peer(), "backend");
    call.process_op(StreamOp::SendMessage(SliceBuffer::from("hello")))
        .await
        .expect("send");
    call.process_op(StreamOp::SendClose).await.expect("close");

    let backend = connector.peer(0);
    let mut slices = SliceBuffer::new();
    backend.read(&mut slices, false).await.expect("message");
    assert_eq!(slices.to_vec(), b"hello");
}
