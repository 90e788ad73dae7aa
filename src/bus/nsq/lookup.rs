//! Producer discovery through nsqlookupd's HTTP API.

use std::collections::BTreeSet;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::bus::{BusError, Result, TransportOptions};

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

impl Producer {
    fn address(&self) -> String {
        if self.broadcast_address.contains(':') {
            format!("[{}]:{}", self.broadcast_address, self.tcp_port)
        } else {
            format!("{}:{}", self.broadcast_address, self.tcp_port)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<Producer>,
}

/// Older nsqlookupd versions wrap the answer in `{"status_code", "data"}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupBody {
    Wrapped { data: LookupData },
    Plain(LookupData),
}

/// nsqd TCP addresses listed in a `/lookup` response.
pub fn parse_producers(body: &[u8]) -> Result<Vec<String>> {
    let data = match serde_json::from_slice(body).map_err(BusError::Decoding)? {
        LookupBody::Wrapped { data } => data,
        LookupBody::Plain(data) => data,
    };
    Ok(data.producers.iter().map(Producer::address).collect())
}

/// Client for a set of nsqlookupd instances.
#[derive(Debug, Clone)]
pub struct Lookup {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl Lookup {
    pub fn new(addresses: &[String], options: &TransportOptions) -> Result<Self> {
        if addresses.is_empty() {
            return Err(BusError::Connection(
                "nsq consumers need at least one lookup address".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(options.dial_timeout)
            .timeout(options.read_timeout)
            .user_agent(options.user_agent.as_str())
            .build()
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let endpoints = addresses
            .iter()
            .map(|a| {
                let base = a.trim_end_matches('/');
                if base.contains("://") {
                    format!("{}/lookup", base)
                } else {
                    format!("http://{}/lookup", base)
                }
            })
            .collect();

        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Producers of `topic` known to any lookupd. Unreachable lookupds are
    /// logged and skipped.
    pub async fn producers(&self, topic: &str) -> BTreeSet<String> {
        let mut producers = BTreeSet::new();
        for endpoint in &self.endpoints {
            match self.query(endpoint, topic).await {
                Ok(found) => producers.extend(found),
                Err(e) => warn!(endpoint = %endpoint, topic = %topic, error = %e, "nsqlookupd query failed"),
            }
        }
        producers
    }

    async fn query(&self, endpoint: &str, topic: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .get(endpoint)
            .query(&[("topic", topic)])
            .send()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(endpoint = %endpoint, topic = %topic, "Topic not registered yet");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(BusError::Connection(format!("nsqlookupd returned {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        parse_producers(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_current_format() {
        let body = br#"{
            "channels": ["billing"],
            "producers": [
                {"broadcast_address": "nsqd-1", "hostname": "nsqd-1", "tcp_port": 4150, "http_port": 4151},
                {"broadcast_address": "fd00::7", "tcp_port": 4150, "http_port": 4151}
            ]
        }"#;

        assert_eq!(
            parse_producers(body).unwrap(),
            vec!["nsqd-1:4150".to_string(), "[fd00::7]:4150".to_string()]
        );
    }

    #[test]
    fn test_parse_wrapped_format() {
        let body = br#"{"status_code": 200, "status_txt": "OK",
            "data": {"producers": [{"broadcast_address": "10.0.0.4", "tcp_port": 5150}]}}"#;
        assert_eq!(parse_producers(body).unwrap(), vec!["10.0.0.4:5150".to_string()]);
    }

    #[test]
    fn test_parse_without_producers() {
        assert!(parse_producers(br#"{"channels": []}"#).unwrap().is_empty());
        assert!(matches!(parse_producers(b"not json"), Err(BusError::Decoding(_))));
    }

    #[test]
    fn test_endpoints() {
        let lookup = Lookup::new(
            &["localhost:4161".to_string(), "https://lookup.internal/".to_string()],
            &TransportOptions::default(),
        )
        .unwrap();
        assert_eq!(
            lookup.endpoints(),
            ["http://localhost:4161/lookup", "https://lookup.internal/lookup"]
        );
    }

    #[test]
    fn test_lookup_address_required() {
        let result = Lookup::new(&[], &TransportOptions::default());
        assert!(matches!(result, Err(BusError::Connection(_))));
    }
}
