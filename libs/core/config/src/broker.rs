use crate::{ConfigError, FromEnv, env_or_default, env_parse_or, env_required};

pub const DEFAULT_QUEUE: &str = "jobs";
pub const DEFAULT_CONSUMER_NAME: &str = "broker-worker";
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Broker worker configuration
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub url: String,
    pub queue: String,
    pub consumer_name: String,
    pub concurrency: usize,
    /// Queue that handled messages are republished to, if any
    pub relay_queue: Option<String>,
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue: DEFAULT_QUEUE.to_string(),
            consumer_name: DEFAULT_CONSUMER_NAME.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            relay_queue: None,
        }
    }
}

fn invalid(key: &str, details: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        details: details.to_string(),
    }
}

impl FromEnv for BrokerConfig {
    /// Requires BROKER_URL to be set (no default)
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_required("BROKER_URL")?;
        if url.trim().is_empty() {
            return Err(invalid("BROKER_URL", "must not be blank"));
        }

        let queue = env_or_default("BROKER_QUEUE", DEFAULT_QUEUE);
        if queue.trim().is_empty() {
            return Err(invalid("BROKER_QUEUE", "must not be blank"));
        }

        let concurrency = env_parse_or("BROKER_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        if concurrency == 0 {
            return Err(invalid("BROKER_CONCURRENCY", "must be greater than zero"));
        }

        let relay_queue = std::env::var("BROKER_RELAY_QUEUE")
            .ok()
            .filter(|q| !q.trim().is_empty());

        Ok(Self {
            url,
            queue,
            consumer_name: env_or_default("BROKER_CONSUMER_NAME", DEFAULT_CONSUMER_NAME),
            concurrency,
            relay_queue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 5] = [
        "BROKER_URL",
        "BROKER_QUEUE",
        "BROKER_CONSUMER_NAME",
        "BROKER_CONCURRENCY",
        "BROKER_RELAY_QUEUE",
    ];

    fn with_env<R>(values: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let vars: Vec<(&str, Option<&str>)> = VARS
            .iter()
            .map(|key| {
                let value = values.iter().find(|(k, _)| k == key).map(|(_, v)| *v);
                (*key, value)
            })
            .collect();
        temp_env::with_vars(vars, f)
    }

    #[test]
    fn test_broker_config_defaults() {
        with_env(&[("BROKER_URL", "amqp://localhost:5672/%2f")], || {
            let config = BrokerConfig::from_env().unwrap();
            assert_eq!(config.url, "amqp://localhost:5672/%2f");
            assert_eq!(config.queue, "jobs");
            assert_eq!(config.consumer_name, "broker-worker");
            assert_eq!(config.concurrency, 4);
            assert_eq!(config.relay_queue, None);
        });
    }

    #[test]
    fn test_broker_config_overrides() {
        with_env(
            &[
                ("BROKER_URL", "amqp://rabbit:5672/%2f"),
                ("BROKER_QUEUE", "emails"),
                ("BROKER_CONSUMER_NAME", "email-worker"),
                ("BROKER_CONCURRENCY", "16"),
                ("BROKER_RELAY_QUEUE", "emails.audit"),
            ],
            || {
                let config = BrokerConfig::from_env().unwrap();
                assert_eq!(config.queue, "emails");
                assert_eq!(config.consumer_name, "email-worker");
                assert_eq!(config.concurrency, 16);
                assert_eq!(config.relay_queue.as_deref(), Some("emails.audit"));
            },
        );
    }

    #[test]
    fn test_broker_config_missing_url() {
        with_env(&[], || {
            let err = BrokerConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "BROKER_URL"));
        });
    }

    #[test]
    fn test_broker_config_blank_url() {
        with_env(&[("BROKER_URL", "  ")], || {
            let err = BrokerConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }));
        });
    }

    #[test]
    fn test_broker_config_rejects_zero_concurrency() {
        with_env(
            &[("BROKER_URL", "amqp://localhost"), ("BROKER_CONCURRENCY", "0")],
            || {
                let err = BrokerConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("BROKER_CONCURRENCY"));
            },
        );
    }

    #[test]
    fn test_broker_config_rejects_unparseable_concurrency() {
        with_env(
            &[("BROKER_URL", "amqp://localhost"), ("BROKER_CONCURRENCY", "-2")],
            || {
                let err = BrokerConfig::from_env().unwrap_err();
                assert!(matches!(err, ConfigError::ParseError { .. }));
            },
        );
    }

    #[test]
    fn test_blank_relay_queue_is_unset() {
        with_env(
            &[("BROKER_URL", "amqp://localhost"), ("BROKER_RELAY_QUEUE", " ")],
            || {
                assert_eq!(BrokerConfig::from_env().unwrap().relay_queue, None);
            },
        );
    }

    #[test]
    fn test_broker_config_new() {
        let config = BrokerConfig::new("amqp://prod:5672/%2f");
        assert_eq!(config.url, "amqp://prod:5672/%2f");
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
    }
}
