use super::*;

#[test]
fn test_publisher_config() {
    let config = KafkaEventLogConfig::publisher("localhost:9092");
    assert_eq!(config.bootstrap_servers, "localhost:9092");
    assert!(config.group_id.is_none());
    assert!(config.topics.is_empty());
    assert_eq!(config.delivery_timeout_ms, 5000);
}

#[test]
fn test_subscriber_config() {
    let config = KafkaEventLogConfig::subscriber(
        "localhost:9092",
        "carga-sync",
        vec!["carga_topic".to_string()],
    );
    assert_eq!(config.group_id, Some("carga-sync".to_string()));
    assert_eq!(config.topics, vec!["carga_topic".to_string()]);
}

#[test]
fn test_sasl_config() {
    let config = KafkaEventLogConfig::publisher("localhost:9092").with_sasl(
        "user",
        "pass",
        "SCRAM-SHA-256",
    );
    assert_eq!(config.sasl_username, Some("user".to_string()));
    assert_eq!(config.sasl_password, Some("pass".to_string()));
    assert_eq!(config.sasl_mechanism, Some("SCRAM-SHA-256".to_string()));
    assert_eq!(config.security_protocol, Some("SASL_SSL".to_string()));
}

#[test]
fn test_with_security_from_messaging_config() {
    let kafka = KafkaConfig {
        security_protocol: Some("SSL".to_string()),
        ssl_ca_location: Some("/path/to/ca.crt".to_string()),
        ..Default::default()
    };
    let config = KafkaEventLogConfig::publisher("localhost:9092").with_security(&kafka);
    assert_eq!(config.security_protocol, Some("SSL".to_string()));
    assert_eq!(config.ssl_ca_location, Some("/path/to/ca.crt".to_string()));
    assert!(config.sasl_username.is_none());
}

#[test]
fn test_producer_config_requires_full_acks() {
    let config = KafkaEventLogConfig::publisher("localhost:9092").with_delivery_timeout_ms(750);
    let client = config.build_producer_config();
    assert_eq!(client.get("acks"), Some("all"));
    assert_eq!(client.get("enable.idempotence"), Some("true"));
    assert_eq!(client.get("message.timeout.ms"), Some("750"));
}

#[test]
fn test_consumer_config_disables_auto_commit() {
    let config = KafkaEventLogConfig::subscriber("localhost:9092", "g", vec![]);
    let client = config.build_consumer_config();
    assert_eq!(client.get("enable.auto.commit"), Some("false"));
    assert_eq!(client.get("group.id"), Some("g"));
}

#[test]
fn test_classify_publish_error() {
    let too_large = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
    assert!(matches!(
        classify_publish_error(&too_large),
        BusError::Rejected(_)
    ));

    let down = KafkaError::MessageProduction(RDKafkaErrorCode::AllBrokersDown);
    let err = classify_publish_error(&down);
    assert!(matches!(err, BusError::Unavailable(_)));
    assert!(err.is_transient());

    let timeout = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
    assert!(classify_publish_error(&timeout).is_transient());
}
