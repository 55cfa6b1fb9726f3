//! Outbound HTTP(S) probes
//!
//! Probes observe the load balancer from the outside: the challenge wait
//! fetches the challenge URL over plain HTTP and the post-rotation check waits
//! for the HTTPS endpoint to present a certificate the client trusts.

use async_trait::async_trait;
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::poll::{Attempt, PollError, poll_until};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Other(String),
}

impl ProbeError {
    pub fn is_tls(&self) -> bool {
        matches!(self, ProbeError::Tls(_))
    }
}

/// One GET request
#[async_trait]
pub trait Prober: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ProbeResponse, ProbeError>;
}

pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cloudacme/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Other(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn fetch(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        let response = self.client.get(url).send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify)?;
        Ok(ProbeResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn classify(err: reqwest::Error) -> ProbeError {
    let message = error_chain(&err);
    if is_tls_failure(&err) {
        ProbeError::Tls(message)
    } else if err.is_connect() || err.is_timeout() {
        ProbeError::Connect(message)
    } else {
        ProbeError::Other(message)
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn is_tls_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<rustls::Error>().is_some() {
            return true;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && io
                .get_ref()
                .is_some_and(|inner| inner.downcast_ref::<rustls::Error>().is_some())
        {
            return true;
        }
        current = e.source();
    }
    false
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no trusted certificate served by {url} after {after:?}")]
    TimedOut { url: String, after: Duration },

    #[error("probing {url} failed: {source}")]
    Probe {
        url: String,
        #[source]
        source: ProbeError,
    },
}

/// Poll `https://<domain>` until the TLS handshake succeeds.
///
/// Certificate errors are expected while the new certificate propagates and
/// keep polling. Any other failure ends the wait.
pub async fn wait_for_tls(
    prober: &dyn Prober,
    domain: &str,
    every: Duration,
    deadline: Duration,
) -> Result<(), ValidationError> {
    let url = format!("https://{domain}");
    let target = url.as_str();

    let result = poll_until(every, deadline, move || async move {
        match prober.fetch(target).await {
            Ok(response) => {
                debug!(url = %target, status = response.status, "TLS handshake succeeded");
                Ok(Attempt::Ready(()))
            }
            Err(e) if e.is_tls() => {
                debug!(url = %target, error = %e, "Certificate not trusted yet");
                Ok(Attempt::Pending)
            }
            Err(e) => Err(e),
        }
    })
    .await;

    result.map_err(|e| match e {
        PollError::TimedOut { after } => ValidationError::TimedOut {
            url: url.clone(),
            after,
        },
        PollError::Aborted(source) => ValidationError::Probe {
            url: url.clone(),
            source,
        },
    })
}
