//! ACME certificate issuance
//!
//! Uses instant-acme for the protocol. Challenges are answered through a
//! [`ChallengeSolver`], so the issuer itself never touches the load balancer.

use async_trait::async_trait;
use instant_acme::{
    AuthorizationStatus, ChallengeType, Identifier, NewOrder, Order, OrderStatus, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::account::{AccountError, AccountKeyStore, StoredAccount, open_account};
use crate::config::Settings;
use crate::solver::{Challenge, ChallengeError, ChallengeSolver};

#[derive(Debug, Error)]
pub enum IssueError {
    #[error(transparent)]
    Account(#[from] AccountError),

    #[error("ACME error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("Challenge failed: {0}")]
    Challenge(#[from] ChallengeError),

    #[error("HTTP-01 challenge not offered by the authority")]
    NoHttp01Challenge,

    #[error("Unexpected authorization status: {0}")]
    UnexpectedAuthorization(String),

    #[error("Order not ready: {0}")]
    OrderNotReady(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),
}

/// Issued key and certificate chain (leaf first)
#[derive(Clone)]
pub struct IssuedCertificate {
    pub private_key_pem: String,
    pub chain_pem: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("chain_pem", &self.chain_pem)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(
        &self,
        account: StoredAccount,
        domains: &[String],
        solver: &dyn ChallengeSolver,
    ) -> Result<IssuedCertificate, IssueError>;
}

#[derive(Debug, Clone)]
pub struct AcmeConfig {
    pub directory_url: String,
    pub contact_email: Option<String>,
    /// Upper bound for order readiness and certificate download polling.
    pub order_timeout: Duration,
}

impl From<&Settings> for AcmeConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            directory_url: settings.directory_url.clone(),
            contact_email: settings.contact_email.clone(),
            order_timeout: settings.order_timeout(),
        }
    }
}

pub struct AcmeIssuer {
    config: AcmeConfig,
    key_store: Arc<dyn AccountKeyStore>,
}

impl AcmeIssuer {
    pub fn new(config: AcmeConfig, key_store: Arc<dyn AccountKeyStore>) -> Self {
        Self { config, key_store }
    }

    /// Present, observe and mark ready every pending authorization.
    ///
    /// Each presented challenge is recorded before anything else can fail so
    /// the caller can clean it up.
    async fn authorize(
        order: &mut Order,
        solver: &dyn ChallengeSolver,
        presented: &mut Vec<Challenge>,
    ) -> Result<(), IssueError> {
        let mut authorizations = order.authorizations();
        while let Some(auth) = authorizations.next().await {
            let mut auth = auth?;
            match auth.status {
                AuthorizationStatus::Pending => {
                    let mut handle = auth
                        .challenge(ChallengeType::Http01)
                        .ok_or(IssueError::NoHttp01Challenge)?;
                    let challenge = Challenge::new(
                        handle.token.clone(),
                        handle.key_authorization().as_str(),
                    );

                    solver.present(&challenge).await?;
                    presented.push(challenge.clone());
                    solver.wait(&challenge).await?;

                    debug!(token = %challenge.token, "Notifying authority that challenge is ready");
                    handle.set_ready().await?;
                }
                AuthorizationStatus::Valid => {
                    debug!("Authorization already valid");
                }
                status => {
                    return Err(IssueError::UnexpectedAuthorization(format!("{status:?}")));
                }
            }
        }
        Ok(())
    }

    async fn await_ready(order: &mut Order, retry: &RetryPolicy) -> Result<(), IssueError> {
        match order.poll_ready(retry).await? {
            OrderStatus::Ready => Ok(()),
            status => Err(IssueError::OrderNotReady(format!("{status:?}"))),
        }
    }
}

fn validate_domain(domain: &str) -> Result<(), IssueError> {
    if domain.is_empty() || domain.contains('/') || domain.starts_with('.') {
        return Err(IssueError::InvalidDomain(domain.to_string()));
    }
    Ok(())
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(
        &self,
        account: StoredAccount,
        domains: &[String],
        solver: &dyn ChallengeSolver,
    ) -> Result<IssuedCertificate, IssueError> {
        if domains.is_empty() {
            return Err(IssueError::InvalidDomain("no domains requested".to_string()));
        }
        for domain in domains {
            validate_domain(domain)?;
        }

        let account = open_account(
            account,
            self.key_store.as_ref(),
            &self.config.directory_url,
            self.config.contact_email.as_deref(),
        )
        .await?;

        info!(domains = ?domains, "Requesting certificate via ACME");

        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;
        let retry = RetryPolicy::new().timeout(self.config.order_timeout);

        let mut presented = Vec::new();
        let outcome = match Self::authorize(&mut order, solver, &mut presented).await {
            Ok(()) => Self::await_ready(&mut order, &retry).await,
            Err(e) => Err(e),
        };

        for challenge in &presented {
            if let Err(e) = solver.clean_up(challenge).await {
                warn!(token = %challenge.token, error = %e, "Failed to clean up challenge");
            }
        }
        outcome?;

        info!(domains = ?domains, "Order ready, finalizing");
        let private_key_pem = order.finalize().await?;
        let chain_pem = order.poll_certificate(&retry).await?;
        info!(domains = ?domains, "Certificate issued");

        Ok(IssuedCertificate {
            private_key_pem,
            chain_pem,
        })
    }
}
