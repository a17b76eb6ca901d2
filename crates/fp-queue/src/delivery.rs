//! A single message handed out by a subscription.
//!
//! Exactly one terminal operation may be applied to a [`Delivery`]:
//! [`Delivery::ack`], [`Delivery::requeue`] or [`Delivery::discard`]. Each one
//! consumes the value, so resolving a delivery twice does not compile. A
//! delivery dropped unresolved is logged; the broker redelivers it once the
//! channel goes away.

use async_trait::async_trait;
use std::fmt;
use tracing::warn;

use crate::Result;

/// Transport-side settlement of one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement; `requeue` puts the message back on the queue.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

pub struct Delivery {
    payload: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        message_id: Option<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            message_id,
            redelivered,
            acker: Some(acker),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Whether the broker has handed this message out before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Key used for idempotency checks: the broker message id when the
    /// producer set one, otherwise the payload text.
    pub fn identity(&self) -> String {
        match &self.message_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => String::from_utf8_lossy(&self.payload).into_owned(),
        }
    }

    pub async fn ack(mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn requeue(mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.reject(true).await,
            None => Ok(()),
        }
    }

    pub async fn discard(mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.reject(false).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .field("resolved", &self.acker.is_none())
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.acker.is_some() {
            warn!(
                identity = %self.identity(),
                "Delivery dropped without ack or requeue, broker will redeliver"
            );
        }
    }
}
