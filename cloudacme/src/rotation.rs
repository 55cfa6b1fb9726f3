//! Certificate rotation for one domain on one load balancer
//!
//! A rotation loads the stored account, finds the certificate the HTTPS
//! listener serves for the domain and then either bootstraps (routes the
//! domain's plain HTTP traffic to this service) or issues, imports and
//! verifies a fresh certificate. The bootstrap rule is removed after every
//! issuance.

use std::fmt;
use std::future::Future;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::account::{AccountError, StoredAccount, load_account_key};
use crate::acme::{IssueError, IssuedCertificate};
use crate::alb::{AlbError, CreatedRule, Protocol, RuleCondition};
use crate::certs::{CertError, CertificateImport, find_installed_certificate};
use crate::config::Settings;
use crate::context::Context;
use crate::defaults::BOOTSTRAP_PATH_PATTERN;
use crate::probe::{ValidationError, wait_for_tls};
use crate::solver::{AlbHttp01Solver, SolverConfig};

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("failed to get account key: {0}")]
    AccountKey(#[source] AccountError),

    #[error("failed to get existing certificate: {0}")]
    FindCertificate(#[source] CertError),

    #[error("no target group configured to forward {0} to")]
    NoForwardTarget(String),

    #[error("failed to install bootstrap rule for {domain}: {source}")]
    Bootstrap {
        domain: String,
        #[source]
        source: AlbError,
    },

    #[error("failed to obtain certificate: {0}")]
    Issue(#[source] IssueError),

    #[error("failed to import certificate {arn}: {source}")]
    Import {
        arn: String,
        #[source]
        source: CertError,
    },

    #[error("failed to remove http rule: {0}")]
    RemoveRule(#[source] AlbError),

    #[error("failed to validate new certificate: {0}")]
    Validate(#[source] ValidationError),

    #[error("invocation deadline passed while {0}")]
    DeadlineExceeded(&'static str),
}

/// What triggered the rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationMode {
    /// Scheduled renewal. Certificates from another issuer are bootstrapped
    /// instead of replaced.
    Renewal,
    /// A live request forwarded by the bootstrap rule. Always issues.
    Request,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The bootstrap forwarding rule is in place; nothing was issued.
    Bootstrapped { rule_arn: String, priority: Option<u32> },
    /// A new certificate now backs the listener.
    Rotated { certificate_arn: String },
}

impl fmt::Display for RotationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationOutcome::Bootstrapped { rule_arn, .. } => {
                write!(f, "bootstrapped (rule {rule_arn})")
            }
            RotationOutcome::Rotated { certificate_arn } => {
                write!(f, "rotated (certificate {certificate_arn})")
            }
        }
    }
}

async fn before<T>(
    deadline: Instant,
    step: &'static str,
    work: impl Future<Output = Result<T, RotationError>>,
) -> Result<T, RotationError> {
    timeout_at(deadline, work)
        .await
        .map_err(|_| RotationError::DeadlineExceeded(step))?
}

/// Condition of the rule that forwards a domain's HTTP traffic here.
pub fn bootstrap_condition(domain: &str) -> RuleCondition {
    RuleCondition::new()
        .with_hosts([domain])
        .with_paths([BOOTSTRAP_PATH_PATTERN])
}

pub struct CertificateRotator {
    ctx: Context,
}

impl CertificateRotator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Rotate within the configured invocation timeout.
    pub async fn rotate(
        &self,
        load_balancer_arn: &str,
        domain: &str,
        mode: RotationMode,
    ) -> Result<RotationOutcome, RotationError> {
        let deadline = Instant::now() + self.ctx.settings.invocation_timeout();
        self.rotate_until(load_balancer_arn, domain, mode, deadline)
            .await
    }

    /// Rotate, giving up at `deadline`.
    ///
    /// Every step is bounded by the deadline. Challenge rules presented during
    /// an issuance that runs out of time are withdrawn before returning.
    pub async fn rotate_until(
        &self,
        load_balancer_arn: &str,
        domain: &str,
        mode: RotationMode,
        deadline: Instant,
    ) -> Result<RotationOutcome, RotationError> {
        let settings: &Settings = &self.ctx.settings;
        info!(domain = %domain, load_balancer = %load_balancer_arn, ?mode, "Starting certificate rotation");

        let account = before(deadline, "loading the account key", async {
            load_account_key(self.ctx.account_keys.as_ref())
                .await
                .map_err(RotationError::AccountKey)
        })
        .await?;

        let installed = before(deadline, "looking up the installed certificate", async {
            find_installed_certificate(
                &self.ctx.rules(),
                self.ctx.certificates.as_ref(),
                load_balancer_arn,
                settings.https_port,
                domain,
            )
            .await
            .map_err(RotationError::FindCertificate)
        })
        .await?;

        let from_authority = installed.is_issued_by(&settings.issuer_markers);
        info!(
            domain = %domain,
            certificate = %installed.arn,
            issuer = %installed.issuer,
            days_left = installed.days_until_expiry(),
            from_authority,
            "Found installed certificate"
        );

        if mode == RotationMode::Renewal && !from_authority {
            return before(
                deadline,
                "installing the bootstrap rule",
                self.bootstrap(load_balancer_arn, domain),
            )
            .await;
        }

        let solver = AlbHttp01Solver::new(
            self.ctx.rules(),
            self.ctx.prober.clone(),
            load_balancer_arn,
            vec![domain.to_string()],
            SolverConfig::from(settings),
        );
        let issued = self.issue(&solver, account, domain, deadline).await?;

        let certificate_arn = before(deadline, "importing the certificate", async {
            self.ctx
                .certificates
                .import_certificate(CertificateImport {
                    certificate_arn: Some(installed.arn.clone()),
                    chain_pem: issued.chain_pem,
                    private_key_pem: issued.private_key_pem,
                })
                .await
                .map_err(|source| RotationError::Import {
                    arn: installed.arn.clone(),
                    source,
                })
        })
        .await?;

        before(deadline, "removing the bootstrap rule", async {
            self.remove_bootstrap_rule(load_balancer_arn, domain)
                .await
                .map_err(RotationError::RemoveRule)
        })
        .await?;

        before(deadline, "validating the new certificate", async {
            wait_for_tls(
                self.ctx.prober.as_ref(),
                domain,
                settings.validation_interval(),
                settings.validation_timeout(),
            )
            .await
            .map_err(RotationError::Validate)
        })
        .await?;

        info!(domain = %domain, certificate = %certificate_arn, "Certificate rotated");
        Ok(RotationOutcome::Rotated { certificate_arn })
    }

    async fn issue(
        &self,
        solver: &AlbHttp01Solver,
        account: StoredAccount,
        domain: &str,
        deadline: Instant,
    ) -> Result<IssuedCertificate, RotationError> {
        let domains = [domain.to_string()];
        match timeout_at(deadline, self.ctx.issuer.issue(account, &domains, solver)).await {
            Ok(issued) => issued.map_err(RotationError::Issue),
            Err(_) => {
                // The issuer was dropped before its own clean-up; this runs
                // past the deadline.
                let withdrawn = solver.withdraw_outstanding().await;
                warn!(
                    domain = %domain,
                    withdrawn,
                    "Deadline passed while obtaining the certificate, withdrew challenge rules"
                );
                Err(RotationError::DeadlineExceeded("obtaining the certificate"))
            }
        }
    }

    async fn bootstrap(
        &self,
        load_balancer_arn: &str,
        domain: &str,
    ) -> Result<RotationOutcome, RotationError> {
        let bootstrap_error = |source| RotationError::Bootstrap {
            domain: domain.to_string(),
            source,
        };
        let rules = self.ctx.rules();
        let listener = rules
            .find_listener(load_balancer_arn, Protocol::Http, self.ctx.settings.http_port)
            .await
            .map_err(bootstrap_error)?;
        let condition = bootstrap_condition(domain);

        if let Some(existing) = rules
            .find_matching_rule(&listener.arn, &condition)
            .await
            .map_err(bootstrap_error)?
        {
            info!(domain = %domain, rule = %existing.arn, "Bootstrap rule already installed");
            return Ok(RotationOutcome::Bootstrapped {
                rule_arn: existing.arn,
                priority: existing.priority.parse().ok(),
            });
        }

        let target_group = self.forward_target(domain).await?;
        let CreatedRule { arn, priority } = rules
            .add_forwarding_rule(&listener.arn, &condition, &target_group)
            .await
            .map_err(bootstrap_error)?;

        info!(
            domain = %domain,
            rule = %arn,
            priority,
            target_group = %target_group,
            "Installed bootstrap rule; issuance starts with the first HTTP request"
        );
        Ok(RotationOutcome::Bootstrapped {
            rule_arn: arn,
            priority: Some(priority),
        })
    }

    async fn forward_target(&self, domain: &str) -> Result<String, RotationError> {
        if let Some(target_group) = &self.ctx.settings.target_group_arn {
            return Ok(target_group.clone());
        }
        let Some(function_arn) = &self.ctx.settings.function_arn else {
            return Err(RotationError::NoForwardTarget(domain.to_string()));
        };
        self.ctx
            .load_balancer
            .lambda_target_group(function_arn)
            .await
            .map_err(|source| RotationError::Bootstrap {
                domain: domain.to_string(),
                source,
            })
    }

    async fn remove_bootstrap_rule(
        &self,
        load_balancer_arn: &str,
        domain: &str,
    ) -> Result<(), AlbError> {
        let rules = self.ctx.rules();
        let listener = rules
            .find_listener(load_balancer_arn, Protocol::Http, self.ctx.settings.http_port)
            .await?;
        match rules
            .delete_matching_rule(&listener.arn, &bootstrap_condition(domain))
            .await
        {
            Ok(arn) => {
                info!(domain = %domain, rule = %arn, "Removed bootstrap rule");
                Ok(())
            }
            Err(AlbError::RuleNotFound) => {
                debug!(domain = %domain, "No bootstrap rule to remove");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alb::RuleAction;
    use crate::testing::{
        FUNCTION, FakeCertificateStore, FakeIssuer, FakeLoadBalancer, HTTP_LISTENER,
        HTTPS_LISTENER, LOAD_BALANCER, ListenerProber, MemoryKeyStore, TARGET_GROUP,
        authority_cert, placeholder_cert,
    };
    use std::sync::Arc;

    const CERT_ARN: &str = "arn:aws:acm:us-east-1:123456789012:certificate/installed";

    struct Harness {
        lb: Arc<FakeLoadBalancer>,
        certs: Arc<FakeCertificateStore>,
        issuer: Arc<FakeIssuer>,
        rotator: CertificateRotator,
    }

    fn harness(settings: Settings, installed_pem: &str) -> Harness {
        let lb = Arc::new(FakeLoadBalancer::standard());
        let certs = Arc::new(FakeCertificateStore::new());
        certs.insert(CERT_ARN, installed_pem);
        lb.attach_certificate(HTTPS_LISTENER, CERT_ARN);
        let issuer = Arc::new(FakeIssuer::new());
        let prober = Arc::new(ListenerProber::new(lb.clone(), HTTP_LISTENER));

        let ctx = Context::new(
            settings,
            lb.clone(),
            certs.clone(),
            Arc::new(MemoryKeyStore::empty()),
            issuer.clone(),
            prober,
        );
        Harness {
            lb,
            certs,
            issuer,
            rotator: CertificateRotator::new(ctx),
        }
    }

    fn settings() -> Settings {
        Settings {
            target_group_arn: Some(TARGET_GROUP.to_string()),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_missing_certificate_aborts_before_touching_rules() {
        let h = harness(settings(), &placeholder_cert("other.test").cert_pem);

        let err = h
            .rotator
            .rotate(LOAD_BALANCER, "example.test", RotationMode::Renewal)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RotationError::FindCertificate(CertError::NoMatchingCertificate { ref domain, .. })
                if domain == "example.test"
        ));
        assert!(err.to_string().contains("no certificate matching example.test"));
        assert_eq!(h.lb.rules(HTTP_LISTENER).len(), 1);
        assert_eq!(h.issuer.calls(), 0);
    }

    #[tokio::test]
    async fn test_renewal_of_placeholder_installs_bootstrap_rule() {
        let h = harness(settings(), &placeholder_cert("example.test").cert_pem);

        let outcome = h
            .rotator
            .rotate(LOAD_BALANCER, "example.test", RotationMode::Renewal)
            .await
            .unwrap();

        assert!(matches!(outcome, RotationOutcome::Bootstrapped { priority: Some(1), .. }));
        assert_eq!(
            h.lb.serve(HTTP_LISTENER, "example.test", "/"),
            Some(RuleAction::Forward {
                target_group_arn: TARGET_GROUP.to_string()
            })
        );
        assert_eq!(h.issuer.calls(), 0);
        assert!(h.certs.imports().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let h = harness(settings(), &placeholder_cert("example.test").cert_pem);

        let first = h
            .rotator
            .rotate(LOAD_BALANCER, "example.test", RotationMode::Renewal)
            .await
            .unwrap();
        let second = h
            .rotator
            .rotate(LOAD_BALANCER, "example.test", RotationMode::Renewal)
            .await
            .unwrap();

        assert_eq!(first, second);
        // Default rule plus a single bootstrap rule.
        assert_eq!(h.lb.rules(HTTP_LISTENER).len(), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_resolves_target_group_from_function() {
        let h = harness(
            Settings {
                function_arn: Some(format!("{FUNCTION}:live")),
                ..Settings::default()
            },
            &placeholder_cert("example.test").cert_pem,
        );
        h.lb.register_lambda(TARGET_GROUP, FUNCTION);

        h.rotator
            .rotate(LOAD_BALANCER, "example.test", RotationMode::Renewal)
            .await
            .unwrap();
        assert_eq!(
            h.lb.serve(HTTP_LISTENER, "example.test", "/"),
            Some(RuleAction::Forward {
                target_group_arn: TARGET_GROUP.to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_bootstrap_without_target_fails() {
        let h = harness(Settings::default(), &placeholder_cert("example.test").cert_pem);
        let err = h
            .rotator
            .rotate(LOAD_BALANCER, "example.test", RotationMode::Renewal)
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::NoForwardTarget(_)));
    }

    #[tokio::test]
    async fn test_renewal_of_authority_certificate_rotates_in_place() {
        let h = harness(settings(), &authority_cert("example.test").cert_pem);

        let outcome = h
            .rotator
            .rotate(LOAD_BALANCER, "example.test", RotationMode::Renewal)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RotationOutcome::Rotated {
                certificate_arn: CERT_ARN.to_string()
            }
        );
        assert_eq!(h.issuer.calls(), 1);
        let imports = h.certs.imports();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].certificate_arn.as_deref(), Some(CERT_ARN));
        // Challenge rule cleaned up, nothing else added.
        assert_eq!(h.lb.rules(HTTP_LISTENER).len(), 1);
    }

    #[tokio::test]
    async fn test_request_mode_issues_and_removes_bootstrap_rule() {
        let h = harness(settings(), &placeholder_cert("example.test").cert_pem);
        h.rotator
            .rotate(LOAD_BALANCER, "example.test", RotationMode::Renewal)
            .await
            .unwrap();
        assert_eq!(h.lb.rules(HTTP_LISTENER).len(), 2);

        let outcome = h
            .rotator
            .rotate(LOAD_BALANCER, "example.test", RotationMode::Request)
            .await
            .unwrap();

        assert!(matches!(outcome, RotationOutcome::Rotated { .. }));
        assert_eq!(h.issuer.calls(), 1);
        assert_eq!(h.lb.rules(HTTP_LISTENER).len(), 1);
        assert_eq!(h.lb.serve(HTTP_LISTENER, "example.test", "/"), None);
    }

    #[tokio::test]
    async fn test_undecodable_account_key_aborts() {
        let lb = Arc::new(FakeLoadBalancer::standard());
        let ctx = Context::new(
            settings(),
            lb.clone(),
            Arc::new(FakeCertificateStore::new()),
            Arc::new(MemoryKeyStore::with_key(b"garbage".to_vec())),
            Arc::new(FakeIssuer::new()),
            Arc::new(ListenerProber::new(lb, HTTP_LISTENER)),
        );

        let err = CertificateRotator::new(ctx)
            .rotate(LOAD_BALANCER, "example.test", RotationMode::Renewal)
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::AccountKey(AccountError::Decode { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_stops_before_touching_rules() {
        let h = harness(settings(), &placeholder_cert("example.test").cert_pem);

        let err = h
            .rotator
            .rotate_until(
                LOAD_BALANCER,
                "example.test",
                RotationMode::Renewal,
                Instant::now(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RotationError::DeadlineExceeded(_)));
        assert_eq!(h.lb.rules(HTTP_LISTENER).len(), 1);
        assert_eq!(h.issuer.calls(), 0);
    }

    #[test]
    fn test_bootstrap_condition() {
        let condition = bootstrap_condition("example.test");
        assert_eq!(
            condition.host_headers,
            Some(vec!["example.test".to_string()])
        );
        assert_eq!(condition.path_patterns, Some(vec!["/".to_string()]));
    }
}
