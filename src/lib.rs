//! Reactive streams over an ordered, asynchronous message channel.
//!
//! A client subscribes to a named stream on a remote service, receives
//! elements only as fast as it asks for them, and may cancel at any time.
//! [`ClientProtocol`] drives one subscription; [`ServerStack`] answers
//! subscriptions by resolving stream paths to [`Publisher`]s.

mod client;
mod codec;
mod config;
mod demand;
mod discovery;
mod error;
mod io;
pub mod msg;
pub mod net;
mod server;
mod stream;
mod subscriber;
mod transport;
mod uri;

pub use crate::client::{subscribe, ClientProtocol, State, Subscription};
pub use crate::codec::{Codecs, Encoded, JSON, MSGPACK};
pub use crate::config::Config;
pub use crate::discovery::{Discovery, StaticDiscovery};
pub use crate::error::StreamError;
pub use crate::msg::{Args, ProtocolMessage, Step, PROTOCOL};
pub use crate::server::{
    DefaultPublisherLookup, Emitter, IterPublisher, Producer, Publisher, PublisherLookup,
    ServerProtocol, ServerStack, ServerState,
};
pub use crate::stream::StreamData;
pub use crate::subscriber::{
    channel_subscriber, subscriber, ChannelSubscriber, ElementStream, FnSubscriber, Subscriber,
};
pub use crate::transport::{pair, Channel, MemoryChannel};
pub use crate::uri::{split_query, StreamUri};
