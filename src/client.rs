use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    codec::Codecs,
    config::Config,
    demand::Demand,
    discovery::Discovery,
    error::StreamError,
    msg::{Empty, ErrorMessage, ProtocolMessage, Step, SubscriptionRequest},
    stream::StreamData,
    subscriber::{channel_subscriber, ElementStream, Subscriber},
    transport::{Channel, Outbox},
    uri::StreamUri,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial = 0,
    AwaitingAck = 1,
    Active = 2,
    Terminal = 3,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Initial,
            1 => State::AwaitingAck,
            2 => State::Active,
            _ => State::Terminal,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            State::Initial => "not yet subscribed",
            State::AwaitingAck => "awaiting acknowledgement",
            State::Active => "active",
            State::Terminal => "terminated",
        }
    }
}

/// State visible to both the delivery task and the subscriber's handle.
/// Only the delivery task writes `state`.
struct Shared {
    uri: String,
    state: AtomicU8,
    cancelled: AtomicBool,
    demand: Demand,
    outbox: Outbox,
}

impl Shared {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// The subscriber's handle on a live subscription, handed over in
/// `on_subscribe`.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<Shared>,
}

impl Subscription {
    /// Asks for `n` more elements. A zero request is a usage error and is
    /// never sent. Once the subscription has terminated or been cancelled
    /// this does nothing.
    pub fn request(&self, n: u64) -> Result<(), StreamError> {
        Demand::check(n)?;
        if self.shared.state() != State::Active || self.is_cancelled() {
            debug!("request({}) on {} ignored, subscription not active", n, self.shared.uri);
            return Ok(());
        }
        self.shared.demand.increase(n, &self.shared.outbox)
    }

    /// Sends CANCEL, every time it is called. The subscription ends when the
    /// remote side confirms with COMPLETE/ERROR or the channel closes; data
    /// arriving in between is dropped.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        if let Err(e) = self.shared.outbox.send(Step::Cancel, &Empty {}) {
            debug!("cancel on {} not sent: {}", self.shared.uri, e);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> u64 {
        self.shared.demand.outstanding()
    }
}

/// Client side of the protocol for one subscription.
pub struct ClientProtocol {
    uri: StreamUri,
    channel: Arc<dyn Channel>,
    subscriber: Box<dyn Subscriber>,
    codecs: Arc<Codecs>,
    shared: Arc<Shared>,
}

impl ClientProtocol {
    pub fn new(
        uri: StreamUri,
        channel: Arc<dyn Channel>,
        subscriber: impl Subscriber + 'static,
        config: &Config,
        discovery: &dyn Discovery,
    ) -> Self {
        let codecs = Arc::new(Codecs::new(config.codecs.clone()));
        let outbox = Outbox::new(
            channel.clone(),
            codecs.clone(),
            discovery.codecs_for_service(uri.service()),
            &config.service_name,
            uri.service(),
        );
        let shared = Arc::new(Shared {
            uri: uri.to_string(),
            state: AtomicU8::new(State::Initial as u8),
            cancelled: AtomicBool::new(false),
            demand: Demand::default(),
            outbox,
        });

        Self {
            uri,
            channel,
            subscriber: Box::new(subscriber),
            codecs,
            shared,
        }
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Sends SUBSCRIBE and spawns the task that delivers inbound messages to
    /// the subscriber. Fails before anything is sent if the stream arguments
    /// cannot be decoded or encoded.
    pub fn start(mut self) -> Result<JoinHandle<()>, StreamError> {
        self.subscribe()?;
        Ok(tokio::spawn(self.run()))
    }

    pub(crate) fn subscribe(&mut self) -> Result<(), StreamError> {
        let request = SubscriptionRequest {
            path: self.uri.path().to_owned(),
            args: self.uri.args()?,
        };
        let msg = self
            .shared
            .outbox
            .message(Step::Subscribe, &request)
            .map_err(|e| StreamError::Codec(e.to_string()))?;

        self.shared.set_state(State::AwaitingAck);
        info!("subscription ++: {}", self.uri);
        if let Err(e) = self.shared.outbox.deliver(msg) {
            warn!("subscribe to {} not sent: {}", self.uri, e);
            self.fail(StreamError::ConnectionFailure);
        }
        Ok(())
    }

    async fn run(mut self) {
        let channel = self.channel.clone();
        while self.state() != State::Terminal {
            let msg = channel.recv().await;
            self.handle(msg);
        }
        info!("subscription --: {}", self.uri);
    }

    /// Applies one inbound message, or channel closure for `None`.
    pub(crate) fn handle(&mut self, msg: Option<ProtocolMessage>) {
        let state = self.state();
        if state == State::Terminal {
            debug!("{} terminated, ignoring {:?}", self.uri, msg.map(|m| m.step));
            return;
        }

        let Some(msg) = msg else {
            debug!("channel for {} closed", self.uri);
            self.complete();
            return;
        };
        debug!("recv {} [{}] from {}", msg.step, msg.id, msg.from_service);

        match msg.step {
            Step::Ack if state == State::AwaitingAck => {
                self.shared.set_state(State::Active);
                self.subscriber.on_subscribe(Subscription {
                    shared: self.shared.clone(),
                });
            }
            Step::Nack if state == State::AwaitingAck => self.fail(StreamError::NotFound),
            Step::Data if state == State::Active => {
                if self.shared.cancelled.load(Ordering::Acquire) {
                    debug!("{} cancelled, dropping [{}]", self.uri, msg.id);
                    return;
                }
                self.shared.demand.consume();
                let element = StreamData::new(msg, self.codecs.clone());
                self.subscriber.on_next(element);
            }
            Step::Error => {
                let message = self
                    .codecs
                    .decode::<ErrorMessage>(&msg.payload, &msg.content_type)
                    .map(|e| e.message)
                    .unwrap_or_else(|_| String::from("remote stream failed"));
                self.fail(StreamError::Remote(message));
            }
            Step::Complete => self.complete(),
            Step::ServiceNotFound => {
                self.fail(StreamError::ServiceNotFound(self.uri.service().to_owned()))
            }
            Step::ConnectionFailure => self.fail(StreamError::ConnectionFailure),
            Step::Other(name) => self.fail(StreamError::UnknownStep(name)),
            step => self.fail(StreamError::UnexpectedStep {
                step: step.to_string(),
                state: state.describe().to_owned(),
            }),
        }
    }

    fn fail(&mut self, error: StreamError) {
        self.shared.set_state(State::Terminal);
        warn!("subscription {} failed: {}", self.uri, error);
        self.subscriber.on_error(error);
    }

    fn complete(&mut self) {
        self.shared.set_state(State::Terminal);
        debug!("subscription {} complete", self.uri);
        self.subscriber.on_complete();
    }
}

/// Subscribes to `uri` over `channel` and returns its elements as a stream.
pub fn subscribe(
    uri: &str,
    channel: Arc<dyn Channel>,
    config: &Config,
    discovery: &dyn Discovery,
    prefetch: u64,
) -> Result<ElementStream, StreamError> {
    let uri = StreamUri::parse(uri)?;
    let (subscriber, elements) = channel_subscriber(prefetch);
    ClientProtocol::new(uri, channel, subscriber, config, discovery).start()?;
    Ok(elements)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        discovery::StaticDiscovery,
        msg::RequestMessage,
        transport::{pair, MemoryChannel},
    };

    #[derive(Debug, Clone, PartialEq)]
    enum Signal {
        Subscribed,
        Next(serde_json::Value),
        Error(StreamError),
        Complete,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        signals: Arc<Mutex<Vec<Signal>>>,
        subscription: Arc<Mutex<Option<Subscription>>>,
        initial: u64,
    }

    impl Recorder {
        fn requesting(initial: u64) -> Self {
            Self {
                initial,
                ..Default::default()
            }
        }

        fn signals(&self) -> Vec<Signal> {
            self.signals.lock().unwrap().clone()
        }

        fn subscription(&self) -> Subscription {
            self.subscription.lock().unwrap().clone().unwrap()
        }

        fn push(&self, signal: Signal) {
            self.signals.lock().unwrap().push(signal);
        }
    }

    impl Subscriber for Recorder {
        fn on_subscribe(&mut self, subscription: Subscription) {
            self.push(Signal::Subscribed);
            if self.initial > 0 {
                subscription.request(self.initial).unwrap();
            }
            *self.subscription.lock().unwrap() = Some(subscription);
        }

        fn on_next(&mut self, element: StreamData) {
            self.push(Signal::Next(element.value().unwrap().clone()));
        }

        fn on_error(&mut self, error: StreamError) {
            self.push(Signal::Error(error));
        }

        fn on_complete(&mut self) {
            self.push(Signal::Complete);
        }
    }

    struct Harness {
        protocol: ClientProtocol,
        server: MemoryChannel,
        recorder: Recorder,
        codecs: Codecs,
    }

    impl Harness {
        fn new(uri: &str, recorder: Recorder) -> Self {
            let (client, server) = pair();
            let protocol = ClientProtocol::new(
                StreamUri::parse(uri).unwrap(),
                Arc::new(client),
                recorder.clone(),
                &Config::new("client"),
                &StaticDiscovery::default(),
            );
            Self {
                protocol,
                server,
                recorder,
                codecs: Codecs::default(),
            }
        }

        fn subscribed(initial: u64) -> Self {
            let mut harness = Self::new("stream://orders/active", Recorder::requesting(initial));
            harness.protocol.subscribe().unwrap();
            harness.sent();
            harness.inbound(Step::Ack, &Empty {});
            harness
        }

        fn inbound<T: serde::Serialize>(&mut self, step: Step, body: &T) {
            let encoded = self.codecs.encode(body, &[]).unwrap();
            let msg = ProtocolMessage::new(step, "orders", "client", encoded);
            self.protocol.handle(Some(msg));
        }

        fn sent(&self) -> Vec<ProtocolMessage> {
            std::iter::from_fn(|| self.server.try_recv()).collect()
        }

        fn steps_sent(&self) -> Vec<Step> {
            self.sent().into_iter().map(|m| m.step).collect()
        }
    }

    #[test]
    fn subscribe_carries_path_and_args() {
        let mut harness = Harness::new(
            "stream://orders/active?region=eu&label=two%20word",
            Recorder::default(),
        );
        assert_eq!(harness.protocol.state(), State::Initial);
        harness.protocol.subscribe().unwrap();
        assert_eq!(harness.protocol.state(), State::AwaitingAck);

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].step, Step::Subscribe);
        assert_eq!(sent[0].to_service, "orders");
        assert_eq!(sent[0].from_service, "client");
        let request: SubscriptionRequest = harness
            .codecs
            .decode(&sent[0].payload, &sent[0].content_type)
            .unwrap();
        assert_eq!(request.path, "/active");
        assert_eq!(request.args.get("label"), Some("two word"));
        assert!(harness.recorder.signals().is_empty());
    }

    #[test]
    fn malformed_query_fails_before_sending() {
        let mut harness = Harness::new("stream://orders/active?region", Recorder::default());
        assert!(matches!(
            harness.protocol.subscribe(),
            Err(StreamError::MalformedUri(_))
        ));
        assert!(harness.sent().is_empty());
        assert_eq!(harness.protocol.state(), State::Initial);
    }

    #[test]
    fn ack_then_request_sends_one_request() {
        let harness = Harness::subscribed(3);
        assert_eq!(harness.protocol.state(), State::Active);

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].step, Step::Request);
        let body: RequestMessage = harness
            .codecs
            .decode(&sent[0].payload, &sent[0].content_type)
            .unwrap();
        assert_eq!(body.n, 3);
        assert_eq!(harness.recorder.subscription().outstanding(), 3);
    }

    #[test]
    fn data_is_delivered_after_subscribe() {
        let mut harness = Harness::subscribed(2);
        harness.inbound(Step::Data, &"first");
        harness.inbound(Step::Data, &"second");
        harness.inbound(Step::Complete, &Empty {});

        assert_eq!(
            harness.recorder.signals(),
            vec![
                Signal::Subscribed,
                Signal::Next("first".into()),
                Signal::Next("second".into()),
                Signal::Complete,
            ]
        );
        assert_eq!(harness.protocol.state(), State::Terminal);
        assert_eq!(harness.recorder.subscription().outstanding(), 0);
    }

    #[test]
    fn nack_fails_without_subscribe() {
        let mut harness = Harness::new("stream://orders/missing", Recorder::default());
        harness.protocol.subscribe().unwrap();
        harness.inbound(Step::Nack, &Empty {});

        assert_eq!(
            harness.recorder.signals(),
            vec![Signal::Error(StreamError::NotFound)]
        );
        assert_eq!(harness.protocol.state(), State::Terminal);
    }

    #[test]
    fn remote_error_is_surfaced_verbatim() {
        let mut harness = Harness::subscribed(1);
        harness.inbound(
            Step::Error,
            &ErrorMessage {
                message: "disk on fire".into(),
            },
        );
        assert_eq!(
            harness.recorder.signals().last(),
            Some(&Signal::Error(StreamError::Remote("disk on fire".into())))
        );
    }

    #[test]
    fn closure_while_active_completes_once() {
        let mut harness = Harness::subscribed(1);
        harness.protocol.handle(None);
        harness.protocol.handle(None);

        let completes = harness
            .recorder
            .signals()
            .into_iter()
            .filter(|s| *s == Signal::Complete)
            .count();
        assert_eq!(completes, 1);
    }

    #[test]
    fn transport_events_name_their_cause() {
        let mut harness = Harness::new("stream://billing/x", Recorder::default());
        harness.protocol.subscribe().unwrap();
        harness
            .protocol
            .handle(Some(ProtocolMessage::transport_event(Step::ServiceNotFound, "billing")));
        let signals = harness.recorder.signals();
        assert_eq!(
            signals,
            vec![Signal::Error(StreamError::ServiceNotFound("billing".into()))]
        );
        if let Signal::Error(e) = &signals[0] {
            assert_eq!(e.to_string(), "Service billing does not exist");
        }

        let mut harness = Harness::subscribed(1);
        harness
            .protocol
            .handle(Some(ProtocolMessage::transport_event(Step::ConnectionFailure, "orders")));
        assert_eq!(
            harness.recorder.signals().last(),
            Some(&Signal::Error(StreamError::ConnectionFailure))
        );
    }

    #[test]
    fn unknown_step_is_reported_as_bug() {
        let mut harness = Harness::subscribed(1);
        harness.inbound(Step::Other("resume".into()), &Empty {});

        let signals = harness.recorder.signals();
        let errors: Vec<_> = signals
            .iter()
            .filter_map(|s| match s {
                Signal::Error(e) => Some(e.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("[resume]"));
        assert!(errors[0].contains("bug"));
    }

    #[test]
    fn data_before_ack_is_a_protocol_violation() {
        let mut harness = Harness::new("stream://orders/active", Recorder::default());
        harness.protocol.subscribe().unwrap();
        harness.inbound(Step::Data, &1);

        assert!(matches!(
            harness.recorder.signals().as_slice(),
            [Signal::Error(StreamError::UnexpectedStep { .. })]
        ));
    }

    #[test]
    fn nothing_is_delivered_after_terminal() {
        let mut harness = Harness::subscribed(5);
        harness.inbound(Step::Complete, &Empty {});
        harness.inbound(Step::Data, &1);
        harness.inbound(
            Step::Error,
            &ErrorMessage {
                message: "late".into(),
            },
        );
        harness.protocol.handle(None);

        assert_eq!(
            harness.recorder.signals(),
            vec![Signal::Subscribed, Signal::Complete]
        );
    }

    #[test]
    fn request_after_terminal_sends_nothing() {
        let mut harness = Harness::subscribed(0);
        let subscription = harness.recorder.subscription();
        harness.inbound(Step::Complete, &Empty {});

        subscription.request(10).unwrap();
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn zero_request_is_a_local_error() {
        let harness = Harness::subscribed(0);
        let subscription = harness.recorder.subscription();

        assert_eq!(subscription.request(0), Err(StreamError::InvalidDemand(0)));
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn cancel_twice_sends_cancel_twice() {
        let harness = Harness::subscribed(0);
        let subscription = harness.recorder.subscription();

        subscription.cancel();
        subscription.cancel();
        assert_eq!(harness.steps_sent(), vec![Step::Cancel, Step::Cancel]);
        assert_eq!(harness.protocol.state(), State::Active);
    }

    #[test]
    fn cancel_drops_data_and_waits_for_remote_terminal() {
        let mut harness = Harness::subscribed(4);
        harness.sent();
        let subscription = harness.recorder.subscription();
        subscription.cancel();

        harness.inbound(Step::Data, &"in flight");
        subscription.request(1).unwrap();
        harness.inbound(Step::Complete, &Empty {});

        assert_eq!(
            harness.recorder.signals(),
            vec![Signal::Subscribed, Signal::Complete]
        );
        assert_eq!(harness.steps_sent(), vec![Step::Cancel]);
    }

    #[test]
    fn cancel_on_closed_channel_does_not_panic() {
        let harness = Harness::subscribed(0);
        let subscription = harness.recorder.subscription();
        drop(harness);
        subscription.cancel();
    }

    #[tokio::test]
    async fn started_protocol_runs_until_terminal() {
        let (client, server) = pair();
        let recorder = Recorder::requesting(2);
        let handle = ClientProtocol::new(
            StreamUri::parse("stream://orders/active").unwrap(),
            Arc::new(client),
            recorder.clone(),
            &Config::default(),
            &StaticDiscovery::default(),
        )
        .start()
        .unwrap();

        let codecs = Codecs::default();
        let reply = |step: Step, body: &str| {
            let encoded = codecs.encode(&body, &[]).unwrap();
            ProtocolMessage::new(step, "orders", "client", encoded)
        };

        assert_eq!(server.recv().await.unwrap().step, Step::Subscribe);
        server.send(reply(Step::Ack, "")).unwrap();
        assert_eq!(server.recv().await.unwrap().step, Step::Request);
        server.send(reply(Step::Data, "a")).unwrap();
        server.close();

        handle.await.unwrap();
        assert_eq!(
            recorder.signals(),
            vec![Signal::Subscribed, Signal::Next("a".into()), Signal::Complete]
        );
    }
}
