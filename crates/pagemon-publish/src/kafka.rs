//! Kafka broker client on librdkafka.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rdkafka::ClientConfig;
use rdkafka::client::ClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{error, info, warn};

use pagemon_core::BrokerConfig;

use crate::broker::{
    Broker, BrokerError, DeliveryError, DeliveryHandle, DeliveryMetadata, Record,
};

/// Client context that remembers whether librdkafka reported a fatal error.
#[derive(Clone, Default)]
pub struct FatalFlag(Arc<AtomicBool>);

impl FatalFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl ClientContext for FatalFlag {
    fn error(&self, error: KafkaError, reason: &str) {
        if error.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal) {
            self.0.store(true, Ordering::SeqCst);
            error!(error = %error, reason, "kafka client hit a fatal error");
        } else {
            warn!(error = %error, reason, "kafka client error");
        }
    }
}

/// Broker publishing to a Kafka cluster through librdkafka.
pub struct KafkaBroker {
    producer: FutureProducer<FatalFlag>,
    fatal: FatalFlag,
}

impl KafkaBroker {
    /// Build the producer and check that the cluster answers a metadata
    /// request within `timeout`.
    pub async fn connect(config: &BrokerConfig, timeout: Duration) -> Result<Self, BrokerError> {
        let fatal = FatalFlag::default();
        let producer: FutureProducer<FatalFlag> = client_config(config)
            .create_with_context(fatal.clone())
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let probe = producer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            probe
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|md| md.brokers().len())
        })
        .await
        .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let brokers = metadata.map_err(|e| BrokerError::Connect(e.to_string()))?;
        info!(
            bootstrap = %config.bootstrap_list(),
            brokers,
            tls = config.tls.is_some(),
            "connected to kafka"
        );

        Ok(Self { producer, fatal })
    }
}

fn client_config(config: &BrokerConfig) -> ClientConfig {
    let mut cc = ClientConfig::new();
    cc.set("bootstrap.servers", config.bootstrap_list())
        .set("message.send.max.retries", config.producer_retries.to_string());

    if let Some(tls) = &config.tls {
        cc.set("security.protocol", "ssl");
        if let Some(key) = &tls.key {
            cc.set("ssl.key.location", key.display().to_string());
        }
        if let Some(cert) = &tls.cert {
            cc.set("ssl.certificate.location", cert.display().to_string());
        }
        if let Some(ca) = &tls.ca {
            cc.set("ssl.ca.location", ca.display().to_string());
        }
    }
    cc
}

impl Broker for KafkaBroker {
    fn name(&self) -> &'static str {
        "kafka"
    }

    fn publish(&self, record: Record) -> Result<DeliveryHandle, BrokerError> {
        if self.fatal.is_set() {
            return Err(BrokerError::Unavailable(
                "librdkafka reported a fatal error".to_string(),
            ));
        }

        let sent = self.producer.send_result(
            FutureRecord::to(&record.topic)
                .key(&record.key)
                .payload(&record.payload),
        );
        let delivery = match sent {
            Ok(delivery) => delivery,
            Err((e, _)) => {
                return Ok(DeliveryHandle::resolved(Err(DeliveryError::Rejected(
                    e.to_string(),
                ))));
            }
        };

        let (notifier, handle) = DeliveryHandle::channel();
        let topic = record.topic;
        tokio::spawn(async move {
            let outcome = match delivery.await {
                Ok(Ok((partition, offset))) => Ok(DeliveryMetadata {
                    topic,
                    partition,
                    offset,
                }),
                Ok(Err((e, _))) => Err(DeliveryError::Rejected(e.to_string())),
                Err(_) => Err(DeliveryError::Dropped),
            };
            notifier.notify(outcome);
        });
        Ok(handle)
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Flush(e.to_string()))?
            .map_err(|e| BrokerError::Flush(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagemon_core::{BrokerBackend, TlsMaterial};
    use std::path::PathBuf;

    fn broker_config(tls: Option<TlsMaterial>) -> BrokerConfig {
        BrokerConfig {
            backend: BrokerBackend::Kafka,
            bootstrap_servers: vec!["a:9092".into(), "b:9092".into()],
            topic: "pagemonitor_metrics".into(),
            producer_retries: 5,
            tls,
        }
    }

    #[test]
    fn plain_client_config() {
        let cc = client_config(&broker_config(None));
        assert_eq!(cc.get("bootstrap.servers"), Some("a:9092,b:9092"));
        assert_eq!(cc.get("message.send.max.retries"), Some("5"));
        assert_eq!(cc.get("security.protocol"), None);
    }

    #[test]
    fn tls_client_config() {
        let cc = client_config(&broker_config(Some(TlsMaterial {
            key: Some(PathBuf::from("/etc/pagemon/service.key")),
            cert: Some(PathBuf::from("/etc/pagemon/service.cert")),
            ca: None,
        })));
        assert_eq!(cc.get("security.protocol"), Some("ssl"));
        assert_eq!(cc.get("ssl.key.location"), Some("/etc/pagemon/service.key"));
        assert_eq!(
            cc.get("ssl.certificate.location"),
            Some("/etc/pagemon/service.cert")
        );
        assert_eq!(cc.get("ssl.ca.location"), None);
    }
}
