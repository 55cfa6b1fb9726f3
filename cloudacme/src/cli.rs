use clap::{Args, Parser, Subcommand};
use cloudacme_core::{EventResponse, RenewalResponse, TriggerEvent, serve_json_lines};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::BufReader;
use tracing::info;

use crate::account::load_account_key;
use crate::acme::IssueError;
use crate::alb::{AlbError, Protocol, RuleCondition, matches};
use crate::certs::{CertError, CertificateImport};
use crate::config::{ConfigError, Settings};
use crate::context::Context;
use crate::probe::ProbeError;
use crate::router::{EventRouter, RouterError};
use crate::rotation::RotationError;
use crate::solver::{AlbHttp01Solver, SolverConfig};

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to set up HTTP client: {0}")]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Rotation(#[from] RotationError),

    #[error(transparent)]
    Issue(#[from] IssueError),

    #[error(transparent)]
    LoadBalancer(#[from] AlbError),

    #[error(transparent)]
    Certificate(#[from] CertError),

    #[error("event stream failed: {0}")]
    Io(#[from] std::io::Error),
}

/// cloudacme - HTTP-01 certificates for Application Load Balancers
#[derive(Debug, Parser)]
#[command(name = "cloudacme")]
#[command(version)]
#[command(about = "Issue and rotate ACME certificates for Application Load Balancer listeners")]
pub struct Cli {
    /// Show debug output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// TOML settings file
    #[arg(long, global = true, env = "CLOUDACME_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: SettingsArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Command-line overrides for the settings file
#[derive(Debug, Default, Args)]
pub struct SettingsArgs {
    /// ACME directory URL
    #[arg(long = "directory", global = true, env = "ACME_DIRECTORY")]
    pub directory_url: Option<String>,

    /// Contact email for a newly registered ACME account
    #[arg(long, global = true, env = "ACME_CONTACT_EMAIL")]
    pub contact_email: Option<String>,

    /// Account key file, created if missing
    #[arg(long, global = true)]
    pub account_key_file: Option<PathBuf>,

    /// SSM parameter holding the account credentials JSON (takes precedence over the file).
    /// A bare PEM key, as written by older tooling, is rejected; use a fresh parameter.
    #[arg(long, global = true, env = "ACCOUNT_KEY_SSM")]
    pub account_key_ssm: Option<String>,

    /// Target group the bootstrap rule forwards to
    #[arg(long, global = true, env = "TARGET_GROUP_ARN")]
    pub target_group_arn: Option<String>,

    /// Function whose target group the bootstrap rule forwards to
    #[arg(long, global = true, env = "FUNCTION_ARN")]
    pub function_arn: Option<String>,

    /// Substring marking certificates issued by the ACME authority (repeatable)
    #[arg(long = "issuer-marker", global = true)]
    pub issuer_markers: Vec<String>,

    /// Seconds to wait for the challenge to be served
    #[arg(long, global = true)]
    pub challenge_timeout_secs: Option<u64>,

    /// Seconds to wait for the authority to finish an order
    #[arg(long, global = true)]
    pub order_timeout_secs: Option<u64>,

    /// Seconds to wait for the new certificate to be trusted
    #[arg(long, global = true)]
    pub validation_timeout_secs: Option<u64>,

    /// Upper bound for a whole trigger, in seconds
    #[arg(long, global = true)]
    pub invocation_timeout_secs: Option<u64>,
}

impl SettingsArgs {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(url) = &self.directory_url {
            settings.directory_url = url.clone();
        }
        if let Some(email) = &self.contact_email {
            settings.contact_email = Some(email.clone());
        }
        if let Some(path) = &self.account_key_file {
            settings.account_key_file = path.clone();
        }
        if let Some(name) = &self.account_key_ssm {
            settings.account_key_ssm = Some(name.clone());
        }
        if let Some(arn) = &self.target_group_arn {
            settings.target_group_arn = Some(arn.clone());
        }
        if let Some(arn) = &self.function_arn {
            settings.function_arn = Some(arn.clone());
        }
        if !self.issuer_markers.is_empty() {
            settings.issuer_markers = self.issuer_markers.clone();
        }
        if let Some(secs) = self.challenge_timeout_secs {
            settings.challenge_timeout_secs = secs;
        }
        if let Some(secs) = self.order_timeout_secs {
            settings.order_timeout_secs = secs;
        }
        if let Some(secs) = self.validation_timeout_secs {
            settings.validation_timeout_secs = secs;
        }
        if let Some(secs) = self.invocation_timeout_secs {
            settings.invocation_timeout_secs = secs;
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Answer trigger events read as JSON lines from stdin
    Event,

    /// Run a scheduled renewal for one domain
    Renew {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        alb_arn: String,
    },

    /// Issue a certificate and import it, without looking at the listener
    Issue {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        alb_arn: String,
        /// Certificate to replace in place
        #[arg(long)]
        cert_arn: Option<String>,
    },

    /// List a listener's rules and flag the ones matching a condition
    Rules {
        #[arg(long)]
        alb_arn: String,
        #[arg(long, default_value_t = crate::defaults::HTTP_PORT)]
        port: u16,
        #[arg(long)]
        host: Vec<String>,
        #[arg(long)]
        path: Vec<String>,
    },
}

impl Cli {
    /// Settings file plus command-line overrides, validated.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let mut settings = Settings::load(self.config.as_deref())?;
        self.overrides.apply(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    pub async fn run(self) -> Result<(), CliError> {
        let settings = self.settings()?;
        let ctx = Context::from_aws(settings).await?;

        match self.command {
            Commands::Event => run_event_loop(ctx).await,
            Commands::Renew { domain, alb_arn } => {
                let router = EventRouter::new(ctx);
                let outcome = router
                    .handle_renewal(&cloudacme_core::CertificateRenewalEvent { domain, alb_arn })
                    .await?;
                println!("{outcome}");
                Ok(())
            }
            Commands::Issue {
                domain,
                alb_arn,
                cert_arn,
            } => issue(ctx, domain, alb_arn, cert_arn).await,
            Commands::Rules {
                alb_arn,
                port,
                host,
                path,
            } => list_rules(ctx, &alb_arn, port, host, path).await,
        }
    }
}

async fn run_event_loop(ctx: Context) -> Result<(), CliError> {
    let router = Arc::new(EventRouter::new(ctx));
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    info!("Waiting for trigger events on stdin");
    serve_json_lines(
        &mut stdin,
        &mut stdout,
        |event: TriggerEvent| {
            let router = router.clone();
            async move { router.dispatch(event).await }
        },
        |e| {
            EventResponse::Renewal(RenewalResponse::Error {
                message: format!("invalid event: {e}"),
            })
        },
    )
    .await?;
    Ok(())
}

async fn issue(
    ctx: Context,
    domain: String,
    alb_arn: String,
    cert_arn: Option<String>,
) -> Result<(), CliError> {
    let account = load_account_key(ctx.account_keys.as_ref())
        .await
        .map_err(RotationError::AccountKey)?;
    let settings: &Settings = &ctx.settings;
    let solver = AlbHttp01Solver::new(
        ctx.rules(),
        ctx.prober.clone(),
        alb_arn,
        vec![domain.clone()],
        SolverConfig::from(settings),
    );

    let issued = ctx.issuer.issue(account, &[domain], &solver).await?;
    let arn = ctx
        .certificates
        .import_certificate(CertificateImport {
            certificate_arn: cert_arn,
            chain_pem: issued.chain_pem,
            private_key_pem: issued.private_key_pem,
        })
        .await?;
    println!("{arn}");
    Ok(())
}

async fn list_rules(
    ctx: Context,
    alb_arn: &str,
    port: u16,
    hosts: Vec<String>,
    paths: Vec<String>,
) -> Result<(), CliError> {
    let rules = ctx.rules();
    let protocol = if port == ctx.settings.https_port {
        Protocol::Https
    } else {
        Protocol::Http
    };
    let listener = rules.find_listener(alb_arn, protocol, port).await?;

    let mut target = RuleCondition::new();
    if !hosts.is_empty() {
        target = target.with_hosts(hosts);
    }
    if !paths.is_empty() {
        target = target.with_paths(paths);
    }
    let filtering = !target.is_empty();

    println!("Listener {}", listener.arn);
    for rule in rules.list_rules(&listener.arn).await? {
        let marker = if filtering && !rule.is_default && matches(&rule.condition, &target) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {:>7}  {}  {}  {}",
            rule.priority, rule.condition, rule.action, rule.arn
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renew_requires_domain_and_alb() {
        let cli = Cli::try_parse_from([
            "cloudacme",
            "renew",
            "--domain",
            "example.test",
            "--alb-arn",
            "arn:lb",
        ])
        .unwrap();
        let Commands::Renew { domain, alb_arn } = cli.command else {
            panic!("expected renew");
        };
        assert_eq!(domain, "example.test");
        assert_eq!(alb_arn, "arn:lb");

        assert!(Cli::try_parse_from(["cloudacme", "renew", "--domain", "example.test"]).is_err());
    }

    #[test]
    fn test_issue_cert_arn_is_optional() {
        let cli = Cli::try_parse_from([
            "cloudacme",
            "issue",
            "--domain",
            "example.test",
            "--alb-arn",
            "arn:lb",
        ])
        .unwrap();
        let Commands::Issue { cert_arn, .. } = cli.command else {
            panic!("expected issue");
        };
        assert!(cert_arn.is_none());
    }

    #[test]
    fn test_rules_defaults_to_http_port() {
        let cli = Cli::try_parse_from([
            "cloudacme",
            "rules",
            "--alb-arn",
            "arn:lb",
            "--host",
            "a.test",
            "--host",
            "b.test",
        ])
        .unwrap();
        let Commands::Rules { port, host, path, .. } = cli.command else {
            panic!("expected rules");
        };
        assert_eq!(port, 80);
        assert_eq!(host, vec!["a.test".to_string(), "b.test".to_string()]);
        assert!(path.is_empty());
    }

    #[test]
    fn test_global_overrides_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cloudacme",
            "event",
            "--directory",
            "https://acme.example.test/directory",
            "--issuer-marker",
            "Example CA",
            "--challenge-timeout-secs",
            "60",
        ])
        .unwrap();

        let mut settings = Settings::default();
        cli.overrides.apply(&mut settings);
        assert_eq!(settings.directory_url, "https://acme.example.test/directory");
        assert_eq!(settings.issuer_markers, vec!["Example CA".to_string()]);
        assert_eq!(settings.challenge_timeout_secs, 60);
        assert_eq!(settings.https_port, 443);
    }

    #[test]
    fn test_settings_rejects_inconsistent_timeouts() {
        let cli = Cli::try_parse_from([
            "cloudacme",
            "event",
            "--challenge-timeout-secs",
            "900",
            "--invocation-timeout-secs",
            "600",
        ])
        .unwrap();
        assert!(matches!(cli.settings(), Err(ConfigError::Validation(_))));
    }
}
