//! CloudEvents-over-Kafka notifier.

use std::sync::Arc;
use std::time::Duration;

use omni_events::{CloudEvent, ImageEvent, EVENT_SOURCE, TOPIC_IMAGE_STATUS};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use thiserror::Error;
use tracing::{debug, error};

use super::{subject, Notifier};

/// Errors constructing the Kafka-backed notifier.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to create Kafka producer: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Publishes CloudEvents v1.0 JSON messages to the image status topic.
///
/// Each `notify` call builds the envelope and hands delivery to a
/// detached task; the producer's own buffering and the task boundary
/// keep callers unblocked.
pub struct CloudEventNotifier {
    producer: Arc<FutureProducer>,
    topic: &'static str,
}

impl CloudEventNotifier {
    pub fn new(brokers: &str) -> Result<Self, NotifyError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer: Arc::new(producer),
            topic: TOPIC_IMAGE_STATUS,
        })
    }
}

impl Notifier for CloudEventNotifier {
    fn notify(
        &self,
        event: ImageEvent,
        external_component: &str,
        external_id: &str,
        data: serde_json::Value,
    ) {
        let envelope = CloudEvent::new(
            event.as_str(),
            EVENT_SOURCE,
            subject(external_component, external_id),
            data,
        );

        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, event = %event, "failed to serialize event");
                return;
            }
        };

        let producer = self.producer.clone();
        let topic = self.topic;
        tokio::spawn(async move {
            let record = FutureRecord::to(topic).key(&envelope.id).payload(&payload);
            match producer.send(record, Duration::from_secs(5)).await {
                Ok(_) => {
                    debug!(
                        event = %envelope.event_type,
                        subject = %envelope.subject,
                        "event delivered"
                    );
                }
                Err((e, _)) => {
                    error!(
                        error = %e,
                        event = %envelope.event_type,
                        subject = %envelope.subject,
                        "failed to deliver event"
                    );
                }
            }
        });
    }
}
