//! AMQP 0-9-1 transport (RabbitMQ) via lapin.
//!
//! One [`AmqpConnection`] is one TCP connection plus one channel. Consumption
//! uses manual acknowledgement; requeue is a `basic.nack` with `requeue=true`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker, options::*, types::FieldTable, BasicProperties, Channel, Connection,
    ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    Acknowledger, Delivery, DeliveryStream, QueueConnection, QueueConnector, QueueError, Result,
    SubscribeOptions,
};

/// Dials an AMQP broker.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connection_name: connection_name.into(),
        }
    }
}

#[async_trait]
impl QueueConnector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn QueueConnection>> {
        debug!(endpoint = %self.endpoint(), "Connecting to AMQP broker");

        let connection = Connection::connect(
            &self.uri,
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into()),
        )
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(200, "Channel setup failed").await;
                return Err(QueueError::Channel(e.to_string()));
            }
        };

        info!(endpoint = %self.endpoint(), "Connected to AMQP broker");
        Ok(Arc::new(AmqpConnection {
            connection,
            channel,
        }))
    }

    fn endpoint(&self) -> String {
        redact_uri(&self.uri)
    }
}

/// Strip `user:password@` from an AMQP URI.
fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://{}", &uri[..scheme_end], &uri[at + 1..])
        }
        _ => uri.to_string(),
    }
}

pub struct AmqpConnection {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl QueueConnection for AmqpConnection {
    async fn subscribe(&self, options: &SubscribeOptions) -> Result<DeliveryStream> {
        self.channel
            .basic_qos(options.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Channel(format!("Failed to set QoS: {}", e)))?;

        self.channel
            .queue_declare(
                &options.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Declare(e.to_string()))?;

        let consumer = self
            .channel
            .basic_consume(
                &options.queue_name,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Subscribe(e.to_string()))?;

        info!(queue = %options.queue_name, consumer_tag = %options.consumer_tag, "Subscribed to AMQP queue");

        let deliveries = consumer.map(|result| match result {
            Ok(delivery) => {
                let message_id = delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string());
                Ok(Delivery::new(
                    delivery.data,
                    message_id,
                    delivery.redelivered,
                    Box::new(AmqpAcker {
                        acker: delivery.acker,
                    }),
                ))
            }
            Err(e) => Err(QueueError::Subscribe(e.to_string())),
        });

        Ok(deliveries.boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(QueueError::Closed);
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?
            .await
            .map_err(|e| QueueError::Publish(format!("Publish confirm failed: {}", e)))?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Message published to AMQP");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "Shutdown").await {
                warn!(error = %e, "Failed to close AMQP channel");
            }
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "Shutdown")
                .await
                .map_err(|e| QueueError::Connection(e.to_string()))?;
        }
        info!("AMQP connection closed");
        Ok(())
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Ack(format!("ACK failed: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Ack(format!("NACK failed: {}", e)))
    }
}
