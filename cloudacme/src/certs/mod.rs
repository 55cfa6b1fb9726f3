//! Installed certificates
//!
//! Finds the certificate a listener currently serves for a domain, decides
//! whether it came from the ACME authority, and prepares issued chains for
//! import into the certificate store.

mod acm;

pub use acm::AcmClient;

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;
use x509_parser::prelude::*;

use crate::alb::{AlbError, Protocol, RuleManager};

#[derive(Debug, Error)]
pub enum CertError {
    #[error("no certificate matching {domain} found{}", describe_failures(.failures))]
    NoMatchingCertificate {
        domain: String,
        failures: Vec<String>,
    },

    #[error("failed to decode certificate {arn}: {reason}")]
    Decode { arn: String, reason: String },

    #[error("invalid certificate chain: {0}")]
    InvalidChain(String),

    #[error(transparent)]
    LoadBalancer(#[from] AlbError),

    #[error("certificate store error: {0}")]
    Api(String),
}

fn describe_failures(failures: &[String]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!(" ({})", failures.join("; "))
    }
}

/// What the rotation needs to know about an installed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub arn: String,
    pub common_name: Option<String>,
    pub issuer: String,
    pub not_after: SystemTime,
}

impl CertificateRecord {
    /// Whether the issuer name contains any of `markers`, ignoring case.
    pub fn is_issued_by(&self, markers: &[String]) -> bool {
        let issuer = self.issuer.to_lowercase();
        markers
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .any(|m| issuer.contains(&m.to_lowercase()))
    }

    pub fn days_until_expiry(&self) -> i64 {
        match self.not_after.duration_since(SystemTime::now()) {
            Ok(duration) => (duration.as_secs() / 86400) as i64,
            Err(e) => -(e.duration().as_secs() as i64 / 86400),
        }
    }
}

/// Parse the first certificate of a PEM bundle.
pub fn decode_certificate(arn: &str, pem_data: &str) -> Result<CertificateRecord, CertError> {
    let decode_error = |reason: String| CertError::Decode {
        arn: arn.to_string(),
        reason,
    };

    for pem in Pem::iter_from_buffer(pem_data.as_bytes()) {
        let pem = pem.map_err(|e| decode_error(e.to_string()))?;
        if pem.label != "CERTIFICATE" {
            continue;
        }

        let (_, cert) =
            X509Certificate::from_der(&pem.contents).map_err(|e| decode_error(e.to_string()))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let timestamp = cert.validity().not_after.timestamp().max(0);

        return Ok(CertificateRecord {
            arn: arn.to_string(),
            common_name,
            issuer: cert.issuer().to_string(),
            not_after: UNIX_EPOCH + Duration::from_secs(timestamp as u64),
        });
    }

    Err(decode_error("no certificate in PEM data".to_string()))
}

/// Split a PEM chain into the leaf and the remaining intermediates.
pub fn split_chain(chain_pem: &str) -> Result<(String, Option<String>), CertError> {
    let blocks =
        ::pem::parse_many(chain_pem).map_err(|e| CertError::InvalidChain(e.to_string()))?;
    let mut certificates = blocks.into_iter().filter(|b| b.tag() == "CERTIFICATE");

    let leaf = certificates
        .next()
        .ok_or_else(|| CertError::InvalidChain("chain contains no certificate".to_string()))?;
    let rest: Vec<_> = certificates.collect();

    let intermediates = if rest.is_empty() {
        None
    } else {
        Some(::pem::encode_many_config(&rest, unix_lines()))
    };
    Ok((::pem::encode_config(&leaf, unix_lines()), intermediates))
}

fn unix_lines() -> ::pem::EncodeConfig {
    ::pem::EncodeConfig::new().set_line_ending(::pem::LineEnding::LF)
}

/// Certificate plus key ready for import
#[derive(Clone)]
pub struct CertificateImport {
    /// Replace this certificate in place when set.
    pub certificate_arn: Option<String>,
    pub chain_pem: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for CertificateImport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateImport")
            .field("certificate_arn", &self.certificate_arn)
            .field("chain_pem", &self.chain_pem)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// PEM of the certificate (leaf first) stored under `arn`.
    async fn get_certificate(&self, arn: &str) -> Result<String, CertError>;

    /// Import and return the resulting ARN.
    async fn import_certificate(&self, import: CertificateImport) -> Result<String, CertError>;
}

/// The certificate attached to the load balancer's HTTPS listener whose
/// common name is `domain`.
///
/// Candidates that cannot be fetched or decoded are skipped; their failures
/// are only reported when no candidate matches.
pub async fn find_installed_certificate(
    rules: &RuleManager,
    store: &dyn CertificateStore,
    load_balancer_arn: &str,
    https_port: u16,
    domain: &str,
) -> Result<CertificateRecord, CertError> {
    let listener = rules
        .find_listener(load_balancer_arn, Protocol::Https, https_port)
        .await?;
    let arns = rules.api().listener_certificates(&listener.arn).await?;

    let mut failures = Vec::new();
    for arn in &arns {
        let pem = match store.get_certificate(arn).await {
            Ok(pem) => pem,
            Err(e) => {
                failures.push(format!("{arn}: {e}"));
                continue;
            }
        };
        let record = match decode_certificate(arn, &pem) {
            Ok(record) => record,
            Err(e) => {
                failures.push(e.to_string());
                continue;
            }
        };

        if record
            .common_name
            .as_deref()
            .is_some_and(|cn| cn.eq_ignore_ascii_case(domain))
        {
            debug!(domain = %domain, arn = %record.arn, issuer = %record.issuer, "Found installed certificate");
            return Ok(record);
        }
    }

    Err(CertError::NoMatchingCertificate {
        domain: domain.to_string(),
        failures,
    })
}
