//! Settings and collaborators shared by every trigger
//!
//! Built once at startup and only read afterwards.

use std::sync::Arc;
use tracing::info;

use crate::account::{AccountKeyStore, FileKeyStore, SsmKeyStore};
use crate::acme::{AcmeConfig, AcmeIssuer, CertificateIssuer};
use crate::alb::{ElbClient, LoadBalancerApi, RuleManager};
use crate::certs::{AcmClient, CertificateStore};
use crate::config::Settings;
use crate::probe::{HttpProber, ProbeError, Prober};

#[derive(Clone)]
pub struct Context {
    pub settings: Arc<Settings>,
    pub load_balancer: Arc<dyn LoadBalancerApi>,
    pub certificates: Arc<dyn CertificateStore>,
    pub account_keys: Arc<dyn AccountKeyStore>,
    pub issuer: Arc<dyn CertificateIssuer>,
    pub prober: Arc<dyn Prober>,
}

impl Context {
    pub fn new(
        settings: Settings,
        load_balancer: Arc<dyn LoadBalancerApi>,
        certificates: Arc<dyn CertificateStore>,
        account_keys: Arc<dyn AccountKeyStore>,
        issuer: Arc<dyn CertificateIssuer>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            load_balancer,
            certificates,
            account_keys,
            issuer,
            prober,
        }
    }

    /// Wire the AWS-backed collaborators from the default credential chain.
    pub async fn from_aws(settings: Settings) -> Result<Self, ProbeError> {
        let sdk = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        let account_keys: Arc<dyn AccountKeyStore> = match &settings.account_key_ssm {
            Some(name) => Arc::new(SsmKeyStore::new(&sdk, name)),
            None => Arc::new(FileKeyStore::new(settings.account_key_file.clone())),
        };
        info!(
            directory = %settings.directory_url,
            account_key = %account_keys.location(),
            "Using ACME account"
        );

        let issuer = Arc::new(AcmeIssuer::new(
            AcmeConfig::from(&settings),
            account_keys.clone(),
        ));
        let prober = Arc::new(HttpProber::new(settings.probe_timeout())?);

        Ok(Self::new(
            settings,
            Arc::new(ElbClient::new(&sdk)),
            Arc::new(AcmClient::new(&sdk)),
            account_keys,
            issuer,
            prober,
        ))
    }

    pub fn rules(&self) -> RuleManager {
        RuleManager::new(self.load_balancer.clone())
    }
}
