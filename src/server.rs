use std::{
    collections::BTreeMap,
    iter::Peekable,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    codec::Codecs,
    config::Config,
    discovery::Discovery,
    msg::{
        Args, Empty, ErrorMessage, OperationDescriptor, ProtocolDescriptor, ProtocolMessage,
        RequestMessage, Step, SubscriptionRequest, PROTOCOL,
    },
    transport::{Channel, Outbox},
};

/// Produces the elements of one subscription. Called from the server's
/// delivery task; emission goes through the [`Emitter`] given at open.
pub trait Producer: Send {
    /// The subscriber is willing to take `n` more elements.
    fn request(&mut self, n: u64);

    /// Stop emitting and release resources.
    fn cancel(&mut self);

    /// Continue emitting after [`Emitter::resume_later`], once the messages
    /// already waiting on the channel have been handled.
    fn resume(&mut self) {}
}

pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> &str {
        "stream"
    }

    fn open(&self, args: &Args, emitter: Emitter) -> Box<dyn Producer>;
}

pub trait PublisherLookup: Send + Sync {
    fn resolve(&self, path: &str) -> Option<Arc<dyn Publisher>>;

    fn publishers(&self) -> Vec<Arc<dyn Publisher>>;
}

/// Publishers keyed by stream path. Leading slashes are not significant.
#[derive(Default)]
pub struct DefaultPublisherLookup {
    publishers: RwLock<BTreeMap<String, Arc<dyn Publisher>>>,
}

impl DefaultPublisherLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `publisher`, replacing any previous one with the same name.
    pub fn register(&self, publisher: impl Publisher + 'static) {
        let key = normalize(publisher.name()).to_owned();
        info!("publisher ++: {}", key);
        self.publishers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::new(publisher));
    }
}

impl PublisherLookup for DefaultPublisherLookup {
    fn resolve(&self, path: &str) -> Option<Arc<dyn Publisher>> {
        self.publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(normalize(path))
            .cloned()
    }

    fn publishers(&self) -> Vec<Arc<dyn Publisher>> {
        self.publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Wake-ups from an emitter to the delivery task that owns its producer.
#[derive(Default)]
struct Wakeups {
    finished: Notify,
    resume: Notify,
}

/// Server-side handle a producer emits through. Only the first terminal
/// signal is sent; everything after it is refused.
#[derive(Clone)]
pub struct Emitter {
    outbox: Arc<Outbox>,
    closed: Arc<AtomicBool>,
    wakeups: Arc<Wakeups>,
}

impl Emitter {
    fn new(outbox: Arc<Outbox>, wakeups: Arc<Wakeups>) -> Self {
        Self {
            outbox,
            closed: Arc::new(AtomicBool::new(false)),
            wakeups,
        }
    }

    /// Schedules a [`Producer::resume`] call on the delivery task.
    pub fn resume_later(&self) {
        if !self.is_closed() {
            self.wakeups.resume.notify_one();
        }
    }

    pub fn emit<T: Serialize + ?Sized>(&self, item: &T) -> Result<()> {
        if self.is_closed() {
            bail!("stream already terminated");
        }
        self.outbox.send(Step::Data, item)
    }

    pub fn complete(&self) {
        if self.close() {
            if let Err(e) = self.outbox.send(Step::Complete, &Empty {}) {
                debug!("complete not sent: {}", e);
            }
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        if self.close() {
            let body = ErrorMessage {
                message: message.into(),
            };
            if let Err(e) = self.outbox.send(Step::Error, &body) {
                debug!("error not sent: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.wakeups.finished.notify_one();
        }
        first
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    AwaitingSubscribe,
    Streaming,
    Closed,
}

/// Server side of the protocol for one inbound channel.
pub struct ServerProtocol {
    channel: Arc<dyn Channel>,
    lookup: Arc<dyn PublisherLookup>,
    discovery: Arc<dyn Discovery>,
    codecs: Arc<Codecs>,
    service_name: String,
    state: ServerState,
    producer: Option<Box<dyn Producer>>,
    emitter: Option<Emitter>,
    wakeups: Arc<Wakeups>,
}

impl ServerProtocol {
    pub fn new(
        channel: Arc<dyn Channel>,
        lookup: Arc<dyn PublisherLookup>,
        config: &Config,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        Self {
            channel,
            lookup,
            discovery,
            codecs: Arc::new(Codecs::new(config.codecs.clone())),
            service_name: config.service_name.clone(),
            state: ServerState::AwaitingSubscribe,
            producer: None,
            emitter: None,
            wakeups: Arc::default(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub async fn run(mut self) {
        let channel = self.channel.clone();
        let wakeups = self.wakeups.clone();
        while self.state != ServerState::Closed {
            tokio::select! {
                biased;
                msg = channel.recv() => self.handle(msg),
                _ = wakeups.finished.notified() => self.check_finished(),
                _ = wakeups.resume.notified() => {
                    self.resume();
                    tokio::task::yield_now().await;
                }
            }
        }
        debug!("server protocol closed");
    }

    pub(crate) fn handle(&mut self, msg: Option<ProtocolMessage>) {
        let Some(msg) = msg else {
            debug!("channel closed in {:?}", self.state);
            self.shutdown();
            return;
        };
        debug!("recv {} [{}] from {}", msg.step, msg.id, msg.from_service);

        match (self.state, &msg.step) {
            (ServerState::AwaitingSubscribe, Step::Subscribe) => self.subscribe(&msg),
            (ServerState::Streaming, Step::Request) => self.request(&msg),
            (ServerState::Streaming, Step::Cancel) => self.cancel(),
            (state, Step::Request | Step::Cancel) => {
                warn!("{} from {} ignored in {:?}", msg.step, msg.from_service, state);
            }
            (state, step) => {
                warn!("unexpected step [{}] in {:?}", step, state);
                let message = format!("unexpected step [{}]", step);
                match &self.emitter {
                    Some(emitter) => emitter.error(message),
                    None => self.reject(&msg.from_service, Step::Error, &ErrorMessage { message }),
                }
                self.shutdown();
            }
        }
        self.check_finished();
    }

    fn outbox_for(&self, service: &str) -> Outbox {
        Outbox::new(
            self.channel.clone(),
            self.codecs.clone(),
            self.discovery.codecs_for_service(service),
            &self.service_name,
            service,
        )
    }

    fn reject<T: Serialize>(&self, service: &str, step: Step, body: &T) {
        if let Err(e) = self.outbox_for(service).send(step, body) {
            debug!("reply to {} not sent: {}", service, e);
        }
    }

    fn subscribe(&mut self, msg: &ProtocolMessage) {
        let remote = msg.from_service.as_str();
        let request: SubscriptionRequest = match self.codecs.decode(&msg.payload, &msg.content_type) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed subscribe from {}: {}", remote, e);
                let message = format!("malformed subscription request: {}", e);
                self.reject(remote, Step::Error, &ErrorMessage { message });
                self.state = ServerState::Closed;
                return;
            }
        };

        let Some(publisher) = self.lookup.resolve(&request.path) else {
            info!("no publisher for {} requested by {}", request.path, remote);
            self.reject(remote, Step::Nack, &Empty {});
            self.state = ServerState::Closed;
            return;
        };

        let outbox = Arc::new(self.outbox_for(remote));
        if let Err(e) = outbox.send(Step::Ack, &Empty {}) {
            warn!("ack to {} not sent: {}", remote, e);
            self.state = ServerState::Closed;
            return;
        }

        info!("subscriber ++: [{}] {}", request.path, remote);
        let emitter = Emitter::new(outbox, self.wakeups.clone());
        self.producer = Some(publisher.open(&request.args, emitter.clone()));
        self.emitter = Some(emitter);
        self.state = ServerState::Streaming;
    }

    fn request(&mut self, msg: &ProtocolMessage) {
        let n = match self.codecs.decode::<RequestMessage>(&msg.payload, &msg.content_type) {
            Ok(RequestMessage { n: 0 }) => Err(String::from("demand must be positive")),
            Ok(RequestMessage { n }) => Ok(n),
            Err(e) => Err(format!("malformed request: {}", e)),
        };
        match n {
            Ok(n) => {
                if let Some(producer) = self.producer.as_mut() {
                    producer.request(n);
                }
            }
            Err(message) => {
                warn!("{} from {}", message, msg.from_service);
                if let Some(emitter) = &self.emitter {
                    emitter.error(message);
                }
                self.shutdown();
            }
        }
    }

    fn cancel(&mut self) {
        if let Some(producer) = self.producer.as_mut() {
            producer.cancel();
        }
        if let Some(emitter) = &self.emitter {
            emitter.complete();
        }
        self.shutdown();
    }

    fn resume(&mut self) {
        if self.state != ServerState::Streaming {
            return;
        }
        if let Some(producer) = self.producer.as_mut() {
            producer.resume();
        }
        self.check_finished();
    }

    fn check_finished(&mut self) {
        let done = self.emitter.as_ref().map_or(false, Emitter::is_closed);
        if self.state == ServerState::Streaming && done {
            self.shutdown();
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut producer) = self.producer.take() {
            if !self.emitter.as_ref().map_or(false, Emitter::is_closed) {
                producer.cancel();
            }
            info!("subscriber --");
        }
        self.state = ServerState::Closed;
    }
}

/// Hosts publishers and runs a [`ServerProtocol`] for every accepted channel.
pub struct ServerStack {
    lookup: Arc<dyn PublisherLookup>,
    discovery: Arc<dyn Discovery>,
    config: Config,
}

impl ServerStack {
    pub fn new(
        lookup: Arc<dyn PublisherLookup>,
        config: Config,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        Self {
            lookup,
            discovery,
            config,
        }
    }

    pub fn accept(&self, channel: Arc<dyn Channel>) -> JoinHandle<()> {
        let protocol = ServerProtocol::new(
            channel,
            self.lookup.clone(),
            &self.config,
            self.discovery.clone(),
        );
        tokio::spawn(protocol.run())
    }

    pub fn descriptor(&self) -> ProtocolDescriptor {
        let operations = self
            .lookup
            .publishers()
            .iter()
            .map(|p| OperationDescriptor {
                name: p.name().to_owned(),
                kind: format!("[{}]", p.kind()),
            })
            .collect();

        ProtocolDescriptor {
            protocol: PROTOCOL.to_owned(),
            name: String::from("Reactive Streaming"),
            description: String::from(
                "Provides the semantics of the Reactive Stream API over a message protocol",
            ),
            operations,
        }
    }
}

/// Publishes the items of an iterator built per subscription, never
/// emitting more than has been requested. Items go out in bounded batches
/// per turn of the delivery task; outstanding credit carries over.
pub struct IterPublisher<F> {
    name: String,
    kind: String,
    factory: F,
}

impl<F> IterPublisher<F> {
    pub fn new(name: impl Into<String>, factory: F) -> Self {
        Self {
            name: name.into(),
            kind: String::from("iterator"),
            factory,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

impl<F, I> Publisher for IterPublisher<F>
where
    F: Fn(&Args) -> I + Send + Sync,
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Serialize + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn open(&self, args: &Args, emitter: Emitter) -> Box<dyn Producer> {
        Box::new(IterProducer {
            items: (self.factory)(args).into_iter().peekable(),
            credit: 0,
            emitter,
        })
    }
}

/// Items an [`IterPublisher`] emits before handing control back to the
/// delivery task.
const EMIT_BATCH: u64 = 128;

struct IterProducer<I: Iterator> {
    items: Peekable<I>,
    credit: u64,
    emitter: Emitter,
}

impl<I> IterProducer<I>
where
    I: Iterator,
    I::Item: Serialize,
{
    fn drain(&mut self) {
        let mut budget = EMIT_BATCH;
        while self.credit > 0 && budget > 0 {
            if self.emitter.is_closed() {
                return;
            }
            let Some(item) = self.items.next() else {
                break;
            };
            if let Err(e) = self.emitter.emit(&item) {
                warn!("emit failed: {}", e);
                return;
            }
            self.credit -= 1;
            budget -= 1;
        }

        if self.items.peek().is_none() {
            self.emitter.complete();
        } else if self.credit > 0 {
            self.emitter.resume_later();
        }
    }
}

impl<I> Producer for IterProducer<I>
where
    I: Iterator + Send,
    I::Item: Serialize + Send,
{
    fn request(&mut self, n: u64) {
        self.credit = self.credit.saturating_add(n);
        self.drain();
    }

    fn resume(&mut self) {
        self.drain();
    }

    fn cancel(&mut self) {
        debug!("iterator producer cancelled");
    }
}
