//! HTTP-01 challenge solving on a load balancer listener
//!
//! A challenge is answered by a fixed-response rule on the HTTP listener that
//! matches the domains' host headers and the challenge path. The solver only
//! creates, observes and removes that rule; driving the ACME order is the
//! issuer's job.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alb::{AlbError, Protocol, RuleCondition, RuleManager};
use crate::config::Settings;
use crate::defaults::ACME_CHALLENGE_PREFIX;
use crate::poll::{Attempt, PollError, poll_until};
use crate::probe::Prober;

/// Token and key authorization of one HTTP-01 challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub token: String,
    pub key_authorization: String,
}

impl Challenge {
    pub fn new(token: impl Into<String>, key_authorization: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            key_authorization: key_authorization.into(),
        }
    }

    /// Request path the authority fetches.
    pub fn path(&self) -> String {
        format!("{ACME_CHALLENGE_PREFIX}{}", self.token)
    }
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error(transparent)]
    Rule(#[from] AlbError),

    #[error("challenge for {domain} not served at {path} after {after:?}")]
    TimedOut {
        domain: String,
        path: String,
        after: Duration,
    },
}

/// Publishes and withdraws challenge responses.
///
/// `clean_up` is never called implicitly: whoever calls `present` owns the
/// matching `clean_up`, whatever happens in between.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    async fn present(&self, challenge: &Challenge) -> Result<(), ChallengeError>;

    /// Return once the challenge is publicly observable for every domain.
    async fn wait(&self, challenge: &Challenge) -> Result<(), ChallengeError>;

    async fn clean_up(&self, challenge: &Challenge) -> Result<(), ChallengeError>;
}

#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub http_port: u16,
    pub probe_interval: Duration,
    /// One deadline for the whole `wait` call, all domains included.
    pub wait_timeout: Duration,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            http_port: crate::defaults::HTTP_PORT,
            probe_interval: crate::defaults::PROBE_INTERVAL,
            wait_timeout: crate::defaults::CHALLENGE_TIMEOUT,
        }
    }
}

impl From<&Settings> for SolverConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            http_port: settings.http_port,
            probe_interval: settings.probe_interval(),
            wait_timeout: settings.challenge_timeout(),
        }
    }
}

pub struct AlbHttp01Solver {
    rules: RuleManager,
    prober: Arc<dyn Prober>,
    load_balancer_arn: String,
    domains: Vec<String>,
    config: SolverConfig,
    /// Challenges presented and not yet cleaned up.
    outstanding: Mutex<Vec<Challenge>>,
}

impl AlbHttp01Solver {
    pub fn new(
        rules: RuleManager,
        prober: Arc<dyn Prober>,
        load_balancer_arn: impl Into<String>,
        domains: Vec<String>,
        config: SolverConfig,
    ) -> Self {
        Self {
            rules,
            prober,
            load_balancer_arn: load_balancer_arn.into(),
            domains,
            config,
            outstanding: Mutex::new(Vec::new()),
        }
    }

    /// Challenges whose rules may still be on the listener.
    pub fn outstanding(&self) -> Vec<Challenge> {
        self.outstanding.lock().clone()
    }

    /// Clean up every challenge still outstanding, returning how many rules
    /// were withdrawn.
    ///
    /// For callers whose issuance was cut off before it reached its own
    /// clean-up.
    pub async fn withdraw_outstanding(&self) -> usize {
        let mut withdrawn = 0;
        for challenge in self.outstanding() {
            match self.clean_up(&challenge).await {
                Ok(()) => withdrawn += 1,
                Err(e) => {
                    warn!(token = %challenge.token, error = %e, "Failed to withdraw challenge rule")
                }
            }
        }
        withdrawn
    }

    fn forget(&self, challenge: &Challenge) {
        self.outstanding.lock().retain(|c| c != challenge);
    }

    fn condition(&self, challenge: &Challenge) -> RuleCondition {
        RuleCondition::new()
            .with_hosts(self.domains.iter().cloned())
            .with_paths([challenge.path()])
    }

    async fn http_listener(&self) -> Result<String, AlbError> {
        let listener = self
            .rules
            .find_listener(&self.load_balancer_arn, Protocol::Http, self.config.http_port)
            .await?;
        Ok(listener.arn)
    }

    async fn wait_for_domain(
        &self,
        domain: &str,
        path: &str,
        expected: &[u8],
        remaining: Duration,
    ) -> Result<(), PollError<Infallible>> {
        let url = format!("http://{domain}{path}");
        let url = url.as_str();
        let prober = self.prober.as_ref();

        poll_until(self.config.probe_interval, remaining, move || async move {
            match prober.fetch(url).await {
                Ok(response) if response.status == 200 && response.body == expected => {
                    Ok(Attempt::Ready(()))
                }
                Ok(response) => {
                    debug!(url = %url, status = response.status, "Challenge not served yet");
                    Ok(Attempt::Pending)
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Challenge probe failed");
                    Ok(Attempt::Pending)
                }
            }
        })
        .await
    }
}

#[async_trait]
impl ChallengeSolver for AlbHttp01Solver {
    async fn present(&self, challenge: &Challenge) -> Result<(), ChallengeError> {
        let listener = self.http_listener().await?;
        let condition = self.condition(challenge);
        // Recorded before the create call so a cancelled call is still cleaned up.
        self.outstanding.lock().push(challenge.clone());
        let created = self
            .rules
            .add_static_rule(&listener, &condition, &challenge.key_authorization)
            .await?;
        info!(
            domains = ?self.domains,
            path = %challenge.path(),
            priority = created.priority,
            "Presented HTTP-01 challenge"
        );
        Ok(())
    }

    async fn wait(&self, challenge: &Challenge) -> Result<(), ChallengeError> {
        let path = challenge.path();
        let expected = challenge.key_authorization.as_bytes();
        let deadline = Instant::now() + self.config.wait_timeout;

        for domain in &self.domains {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self
                .wait_for_domain(domain, &path, expected, remaining)
                .await
            {
                Ok(()) => info!(domain = %domain, path = %path, "Challenge is being served"),
                Err(PollError::TimedOut { .. }) => {
                    return Err(ChallengeError::TimedOut {
                        domain: domain.clone(),
                        path,
                        after: self.config.wait_timeout,
                    });
                }
                Err(PollError::Aborted(never)) => match never {},
            }
        }
        Ok(())
    }

    async fn clean_up(&self, challenge: &Challenge) -> Result<(), ChallengeError> {
        let listener = self.http_listener().await?;
        match self
            .rules
            .delete_matching_rule(&listener, &self.condition(challenge))
            .await
        {
            Ok(_) => {
                self.forget(challenge);
                info!(domains = ?self.domains, path = %challenge.path(), "Removed challenge rule");
                Ok(())
            }
            Err(AlbError::RuleNotFound) => {
                self.forget(challenge);
                info!(
                    domains = ?self.domains,
                    path = %challenge.path(),
                    "Challenge rule already gone, skipping cleanup"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
