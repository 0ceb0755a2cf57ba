use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tracing::{debug, warn};

use crate::{client::Subscription, error::StreamError, stream::StreamData};

/// Receives the signals of one subscription: at most one `on_subscribe`,
/// any number of `on_next`, then exactly one of `on_error`/`on_complete`.
///
/// Callbacks run on the delivery task and must not block.
pub trait Subscriber: Send {
    fn on_subscribe(&mut self, subscription: Subscription);
    fn on_next(&mut self, element: StreamData);
    fn on_error(&mut self, error: StreamError);
    fn on_complete(&mut self);
}

impl<S: Subscriber + ?Sized> Subscriber for Box<S> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        (**self).on_subscribe(subscription)
    }

    fn on_next(&mut self, element: StreamData) {
        (**self).on_next(element)
    }

    fn on_error(&mut self, error: StreamError) {
        (**self).on_error(error)
    }

    fn on_complete(&mut self) {
        (**self).on_complete()
    }
}

/// A subscriber built from closures. Requests `batch` elements up front and
/// asks for another `batch` each time one has been fully delivered.
pub struct FnSubscriber<N, E, C> {
    batch: u64,
    received: u64,
    subscription: Option<Subscription>,
    on_next: N,
    on_error: E,
    on_complete: C,
}

pub fn subscriber<N, E, C>(batch: u64, on_next: N, on_error: E, on_complete: C) -> FnSubscriber<N, E, C>
where
    N: FnMut(StreamData) + Send,
    E: FnMut(StreamError) + Send,
    C: FnMut() + Send,
{
    FnSubscriber {
        batch: batch.max(1),
        received: 0,
        subscription: None,
        on_next,
        on_error,
        on_complete,
    }
}

impl<N, E, C> FnSubscriber<N, E, C> {
    fn request_batch(&self) {
        if let Some(subscription) = &self.subscription {
            if let Err(e) = subscription.request(self.batch) {
                warn!("batch request failed: {}", e);
            }
        }
    }
}

impl<N, E, C> Subscriber for FnSubscriber<N, E, C>
where
    N: FnMut(StreamData) + Send,
    E: FnMut(StreamError) + Send,
    C: FnMut() + Send,
{
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.subscription = Some(subscription);
        self.request_batch();
    }

    fn on_next(&mut self, element: StreamData) {
        (self.on_next)(element);
        self.received += 1;
        if self.received == self.batch {
            self.received = 0;
            self.request_batch();
        }
    }

    fn on_error(&mut self, error: StreamError) {
        self.subscription = None;
        (self.on_error)(error)
    }

    fn on_complete(&mut self) {
        self.subscription = None;
        (self.on_complete)()
    }
}

enum Event {
    Subscribed(Subscription),
    Next(StreamData),
    Error(StreamError),
    Complete,
}

/// Forwards every signal into an [`ElementStream`].
pub struct ChannelSubscriber {
    prefetch: u64,
    subscription: Option<Subscription>,
    tx: async_channel::Sender<Event>,
}

/// Elements of a subscription as a `futures::Stream`. Polling drives demand:
/// `prefetch` elements are requested on subscribe and topped up once half of
/// them have been consumed. Dropping the stream cancels the subscription.
pub struct ElementStream {
    prefetch: u64,
    consumed: u64,
    done: bool,
    subscription: Option<Subscription>,
    events: Pin<Box<async_channel::Receiver<Event>>>,
}

pub fn channel_subscriber(prefetch: u64) -> (ChannelSubscriber, ElementStream) {
    let prefetch = prefetch.max(1);
    let (tx, rx) = async_channel::unbounded();
    (
        ChannelSubscriber {
            prefetch,
            subscription: None,
            tx,
        },
        ElementStream {
            prefetch,
            consumed: 0,
            done: false,
            subscription: None,
            events: Box::pin(rx),
        },
    )
}

impl ChannelSubscriber {
    fn forward(&mut self, event: Event) {
        if self.tx.try_send(event).is_err() {
            debug!("element stream dropped, discarding signal");
            self.abandon();
        }
    }

    /// Nobody reads the elements any more, so stop the stream at its source.
    fn abandon(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            if !subscription.is_cancelled() {
                subscription.cancel();
            }
        }
    }
}

impl Subscriber for ChannelSubscriber {
    fn on_subscribe(&mut self, subscription: Subscription) {
        if self.tx.is_closed() {
            debug!("element stream gone before subscribe, cancelling");
            subscription.cancel();
            return;
        }
        if let Err(e) = subscription.request(self.prefetch) {
            warn!("prefetch request failed: {}", e);
        }
        self.subscription = Some(subscription.clone());
        self.forward(Event::Subscribed(subscription));
    }

    fn on_next(&mut self, element: StreamData) {
        self.forward(Event::Next(element));
    }

    fn on_error(&mut self, error: StreamError) {
        self.subscription = None;
        self.forward(Event::Error(error));
        self.tx.close();
    }

    fn on_complete(&mut self) {
        self.subscription = None;
        self.forward(Event::Complete);
        self.tx.close();
    }
}

impl ElementStream {
    /// Cancels the subscription and ends the stream.
    pub fn cancel(&mut self) {
        while self.subscription.is_none() {
            match self.events.try_recv() {
                Ok(Event::Subscribed(subscription)) => self.subscription = Some(subscription),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        self.events.close();
        self.done = true;
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    fn refill(&mut self) {
        self.consumed += 1;
        if self.consumed < (self.prefetch / 2).max(1) {
            return;
        }
        if let Some(subscription) = &self.subscription {
            if let Err(e) = subscription.request(self.consumed) {
                warn!("refill request failed: {}", e);
            }
        }
        self.consumed = 0;
    }
}

impl Stream for ElementStream {
    type Item = Result<StreamData, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            match this.events.as_mut().poll_next(cx) {
                Poll::Ready(Some(Event::Subscribed(subscription))) => {
                    this.subscription = Some(subscription);
                }
                Poll::Ready(Some(Event::Next(element))) => {
                    this.refill();
                    return Poll::Ready(Some(Ok(element)));
                }
                Poll::Ready(Some(Event::Error(error))) => {
                    this.done = true;
                    this.subscription = None;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(Some(Event::Complete)) | Poll::Ready(None) => {
                    this.done = true;
                    this.subscription = None;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for ElementStream {
    fn drop(&mut self) {
        if !self.done {
            self.cancel();
        }
    }
}
