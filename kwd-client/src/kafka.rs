//! Kafka-backed record log.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::log::RecordLog;

fn kafka_error(err: KafkaError) -> ClientError {
    match err {
        KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => ClientError::Timeout,
        other => ClientError::Transport(format!("kafka: {}", other)),
    }
}

/// Publishes records to Kafka topics keyed by subject.
pub struct KafkaRecordLog {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaRecordLog {
    /// `brokers` is a comma-separated bootstrap list.
    pub fn connect(brokers: &str, send_timeout: Duration) -> Result<Self> {
        let timeout_ms = send_timeout.as_millis().max(1).to_string();
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", &timeout_ms)
            .create()
            .map_err(kafka_error)?;
        info!(target: "keyward::kafka", brokers, "Record log producer created");
        Ok(Self {
            producer,
            send_timeout,
        })
    }
}

#[async_trait]
impl RecordLog for KafkaRecordLog {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(&payload[..]);
        match self.producer.send(record, self.send_timeout).await {
            Ok((partition, offset)) => {
                debug!(target: "keyward::kafka", topic, key, partition, offset, "Record published");
                Ok(())
            },
            Err((e, _)) => Err(kafka_error(e)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_timeout_maps_to_timeout() {
        let err = kafka_error(KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageTimedOut,
        ));
        assert!(matches!(err, ClientError::Timeout));

        let err = kafka_error(KafkaError::MessageProduction(
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ));
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_producer_creation_does_not_need_a_reachable_broker() {
        let log = KafkaRecordLog::connect("127.0.0.1:1", Duration::from_millis(50)).unwrap();
        let err = log
            .publish("sky-update-auction", "k", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
