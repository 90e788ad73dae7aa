//! Reply destinations and topic provisioning.
//!
//! Reply destinations are random hex identifiers tagged with the
//! `.ephemeral` suffix, which brokers garbage-collect once idle.
//! `HttpProvisioner` pre-creates topics through the broker's HTTP admin API,
//! which listens on the data port + 1.

use async_trait::async_trait;
use tracing::debug;

use super::{BusError, Provisioner, Result};

/// Suffix marking a topic as ephemeral.
pub const EPHEMERAL_SUFFIX: &str = ".ephemeral";

/// Bytes of entropy in a reply destination identifier.
const REPLY_ID_BYTES: usize = 8;

/// Generate a fresh, never-reused reply destination.
pub fn reply_destination() -> String {
    let id: [u8; REPLY_ID_BYTES] = rand::random();
    format!("{}{}", hex::encode(id), EPHEMERAL_SUFFIX)
}

pub fn is_ephemeral(topic: &str) -> bool {
    topic.ends_with(EPHEMERAL_SUFFIX)
}

/// Derive the admin API address (`host:port+1`) from a data address.
pub fn admin_address(data_address: &str) -> Result<String> {
    let (host, port) = data_address.rsplit_once(':').ok_or_else(|| {
        BusError::Connection(format!("broker address '{}' has no port", data_address))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        BusError::Connection(format!("broker address '{}' has an invalid port", data_address))
    })?;
    let admin_port = port.checked_add(1).ok_or_else(|| {
        BusError::Connection(format!("broker port {} has no admin port above it", port))
    })?;

    Ok(format!("{}:{}", host, admin_port))
}

/// Provisioner backed by the broker's HTTP admin API.
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProvisioner {
    /// Provisioner for the admin API at `admin_address` (`host:port` or URL).
    pub fn new(admin_address: &str) -> Self {
        let base_url = if admin_address.contains("://") {
            admin_address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", admin_address.trim_end_matches('/'))
        };

        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Provisioner for the broker whose data port is in `data_address`.
    pub fn from_data_address(data_address: &str) -> Result<Self> {
        Ok(Self::new(&admin_address(data_address)?))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, action: &str, topic: &str) -> Result<()> {
        let url = format!("{}/topic/{}", self.base_url, action);
        let response = self
            .client
            .post(&url)
            .query(&[("topic", topic)])
            .send()
            .await
            .map_err(|e| BusError::Connection(format!("{} topic '{}': {}", action, topic, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BusError::Connection(format!(
                "{} topic '{}': admin API returned {}",
                action, topic, status
            )));
        }

        debug!(topic = %topic, action = %action, "Topic provisioned");
        Ok(())
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn create_topic(&self, topic: &str) -> Result<()> {
        self.post("create", topic).await
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.post("delete", topic).await
    }
}

/// Provisioner for brokers whose topics need no pre-creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn create_topic(&self, _topic: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_topic(&self, _topic: &str) -> Result<()> {
        Ok(())
    }
}
