use async_trait::async_trait;
use aws_sdk_acm::Client;
use aws_sdk_acm::error::DisplayErrorContext;
use aws_sdk_acm::primitives::Blob;
use tracing::info;

use super::{CertError, CertificateImport, CertificateStore, split_chain};

/// AWS Certificate Manager adapter
pub struct AcmClient {
    client: Client,
}

impl AcmClient {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }
}

#[async_trait]
impl CertificateStore for AcmClient {
    async fn get_certificate(&self, arn: &str) -> Result<String, CertError> {
        let output = self
            .client
            .get_certificate()
            .certificate_arn(arn)
            .send()
            .await
            .map_err(|e| CertError::Api(format!("GetCertificate {arn}: {}", DisplayErrorContext(e))))?;

        output
            .certificate()
            .map(str::to_string)
            .ok_or_else(|| CertError::Api(format!("GetCertificate {arn}: no certificate body")))
    }

    async fn import_certificate(&self, import: CertificateImport) -> Result<String, CertError> {
        let (leaf, intermediates) = split_chain(&import.chain_pem)?;

        let output = self
            .client
            .import_certificate()
            .set_certificate_arn(import.certificate_arn.clone())
            .certificate(Blob::new(leaf.into_bytes()))
            .private_key(Blob::new(import.private_key_pem.into_bytes()))
            .set_certificate_chain(intermediates.map(|c| Blob::new(c.into_bytes())))
            .send()
            .await
            .map_err(|e| CertError::Api(format!("ImportCertificate: {}", DisplayErrorContext(e))))?;

        let arn = output
            .certificate_arn()
            .map(str::to_string)
            .ok_or_else(|| CertError::Api("ImportCertificate returned no ARN".to_string()))?;
        info!(
            arn = %arn,
            replaced = import.certificate_arn.is_some(),
            "Imported certificate"
        );
        Ok(arn)
    }
}
