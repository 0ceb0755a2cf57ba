use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::{
    error::StreamError,
    msg::{RequestMessage, Step},
    transport::Outbox,
};

/// Forwards subscriber demand to the producer.
///
/// The producer side is the authority on how much it may still send; the
/// count kept here is only what has been asked for and not yet delivered,
/// for diagnostics.
#[derive(Debug, Default)]
pub(crate) struct Demand {
    outstanding: AtomicU64,
}

impl Demand {
    pub(crate) fn check(n: u64) -> Result<(), StreamError> {
        if n == 0 {
            return Err(StreamError::InvalidDemand(n));
        }
        Ok(())
    }

    /// Sends REQUEST(n). Sending is fire-and-forget: a broken channel will
    /// surface through the inbound side, not here.
    pub(crate) fn increase(&self, n: u64, outbox: &Outbox) -> Result<(), StreamError> {
        Self::check(n)?;
        if let Err(e) = outbox.send(Step::Request, &RequestMessage { n }) {
            warn!("request({}) not sent: {}", n, e);
            return Ok(());
        }
        self.add(n);
        Ok(())
    }

    pub(crate) fn consume(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub(crate) fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    fn add(&self, n: u64) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_add(n))
            });
    }
}
