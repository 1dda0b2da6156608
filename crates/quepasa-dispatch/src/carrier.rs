//! Delivery transports: HTTP webhook and AMQP queue.

use crate::subscription::DispatchSubscription;
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::BasicProperties;
use quepasa_core::error::QpError;
use serde_json::Value;
use std::time::Duration;

/// One delivery attempt to one subscriber. Implementations are stateless
/// per call; retries and ordering live in the dispatcher.
#[async_trait]
pub trait Carrier: Send + Sync {
    async fn deliver(&self, sub: &DispatchSubscription, payload: &Value) -> Result<(), QpError>;
}

/// HTTP POST with a JSON body; success is any 2xx within the deadline.
pub struct WebhookCarrier {
    client: reqwest::Client,
}

impl WebhookCarrier {
    pub fn new(timeout: Duration) -> Result<Self, QpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QpError::Internal(format!("http client build failed: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Carrier for WebhookCarrier {
    async fn deliver(&self, sub: &DispatchSubscription, payload: &Value) -> Result<(), QpError> {
        let response = self
            .client
            .post(&sub.connection_string)
            .json(payload)
            .send()
            .await
            .map_err(|e| QpError::Transport(format!("webhook post failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QpError::Transport(format!(
                "webhook returned {status} for {}",
                sub.connection_string
            )));
        }
        Ok(())
    }
}

/// AMQP publish; success is the broker confirm.
///
/// The connection string is a standard AMQP URI; an optional `queue=`
/// query parameter names the target queue (default `quepasa`). Connections
/// are opened per delivery and closed after the confirm — subscriber
/// volume is low enough that pooling is not worth the state.
pub struct QueueCarrier;

impl QueueCarrier {
    /// Split the queue name out of the connection string.
    fn parse(connection_string: &str) -> (String, String) {
        let mut queue = "quepasa".to_string();
        let mut uri = connection_string.to_string();
        if let Some(pos) = connection_string.find('?') {
            let (base, query) = connection_string.split_at(pos);
            let mut kept = Vec::new();
            for pair in query[1..].split('&') {
                match pair.split_once('=') {
                    Some(("queue", name)) if !name.is_empty() => queue = name.to_string(),
                    _ => kept.push(pair),
                }
            }
            uri = if kept.is_empty() {
                base.to_string()
            } else {
                format!("{base}?{}", kept.join("&"))
            };
        }
        (uri, queue)
    }
}

#[async_trait]
impl Carrier for QueueCarrier {
    async fn deliver(&self, sub: &DispatchSubscription, payload: &Value) -> Result<(), QpError> {
        let (uri, queue) = Self::parse(&sub.connection_string);

        let conn = lapin::Connection::connect(&uri, lapin::ConnectionProperties::default())
            .await
            .map_err(|e| QpError::Transport(format!("amqp connect failed: {e}")))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| QpError::Transport(format!("amqp channel failed: {e}")))?;

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QpError::Transport(format!("amqp queue declare failed: {e}")))?;

        let body = serde_json::to_vec(payload)?;
        channel
            .basic_publish(
                "",
                &queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| QpError::Transport(format!("amqp publish failed: {e}")))?
            .await
            .map_err(|e| QpError::Transport(format!("amqp confirm failed: {e}")))?;

        let _ = conn.close(200, "bye").await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_uri_parsing() {
        let (uri, queue) = QueueCarrier::parse("amqp://guest:guest@mq:5672/%2f?queue=inbound");
        assert_eq!(uri, "amqp://guest:guest@mq:5672/%2f");
        assert_eq!(queue, "inbound");

        let (uri, queue) = QueueCarrier::parse("amqp://mq/vh?heartbeat=30&queue=x");
        assert_eq!(uri, "amqp://mq/vh?heartbeat=30");
        assert_eq!(queue, "x");

        let (uri, queue) = QueueCarrier::parse("amqp://mq");
        assert_eq!(uri, "amqp://mq");
        assert_eq!(queue, "quepasa");
    }
}
