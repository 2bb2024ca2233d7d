use std::net::Ipv6Addr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use tracing::{debug, info};

use crate::proto::{PredictRequest, PredictResponse, PredictionServiceClient};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server address {addr}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port`, or a full `http://` URI.
    pub addr: String,
    pub connect_timeout: Duration,
    /// Deadline for a single predict call. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(host: &str, port: u16) -> Self {
        let addr = if host.parse::<Ipv6Addr>().is_ok() {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Self {
            addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
        }
    }

    fn uri(&self) -> String {
        if self.addr.contains("://") {
            self.addr.clone()
        } else {
            format!("http://{}", self.addr)
        }
    }
}

/// Issues one predict call at a time.
#[async_trait]
pub trait Predictor {
    async fn predict(&mut self, request: &PredictRequest) -> Result<PredictResponse, Status>;
}

/// Plaintext gRPC client for a TensorFlow Serving `PredictionService`.
#[derive(Debug, Clone)]
pub struct Client {
    inner: PredictionServiceClient<Channel>,
    request_timeout: Option<Duration>,
}

impl Client {
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let addr = config.uri();
        let endpoint = Endpoint::from_shared(addr.clone())
            .map_err(|source| ClientError::InvalidAddress {
                addr: addr.clone(),
                source,
            })?
            .connect_timeout(config.connect_timeout);

        let channel = endpoint
            .connect()
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        info!(%addr, "connected to prediction service");

        Ok(Self::from_channel(channel).with_request_timeout(config.request_timeout))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            inner: PredictionServiceClient::new(channel),
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl Predictor for Client {
    async fn predict(&mut self, request: &PredictRequest) -> Result<PredictResponse, Status> {
        let mut req = tonic::Request::new(request.clone());
        if let Some(timeout) = self.request_timeout {
            req.set_timeout(timeout);
        }
        let response = self.inner.predict(req).await?;
        debug!("predict call returned");
        Ok(response.into_inner())
    }
}
