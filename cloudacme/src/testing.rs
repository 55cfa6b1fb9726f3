//! In-memory collaborators for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::account::{AccountKeyStore, KeyStoreError, StoredAccount};
use crate::acme::{CertificateIssuer, IssueError, IssuedCertificate};
use crate::alb::{
    AlbError, Listener, ListenerRule, LoadBalancerApi, NewRule, Protocol, RuleAction,
    RuleCondition, RulePage,
};
use crate::certs::{CertError, CertificateImport, CertificateStore};
use crate::probe::{ProbeError, ProbeResponse, Prober};
use crate::solver::{Challenge, ChallengeSolver};

pub const LOAD_BALANCER: &str =
    "arn:aws:elasticloadbalancing:us-east-1:123456789012:loadbalancer/app/web/50dc6c495c0c9188";
pub const HTTP_LISTENER: &str =
    "arn:aws:elasticloadbalancing:us-east-1:123456789012:listener/app/web/50dc6c495c0c9188/http";
pub const HTTPS_LISTENER: &str =
    "arn:aws:elasticloadbalancing:us-east-1:123456789012:listener/app/web/50dc6c495c0c9188/https";
pub const TARGET_GROUP: &str =
    "arn:aws:elasticloadbalancing:us-east-1:123456789012:targetgroup/acme/73e2d6bc24d8a067";
pub const FUNCTION: &str = "arn:aws:lambda:us-east-1:123456789012:function:cloudacme";

#[derive(Default)]
struct LbState {
    listeners: HashMap<String, Vec<Listener>>,
    rules: HashMap<String, Vec<ListenerRule>>,
    certificates: HashMap<String, Vec<String>>,
    target_groups: HashMap<String, String>,
    lambda_targets: Vec<(String, String)>,
    next_rule: usize,
}

/// Load balancer control plane with one shared rule table per listener.
///
/// Every call yields to the scheduler first, so concurrent callers on a
/// current-thread runtime interleave between list and create.
pub struct FakeLoadBalancer {
    state: Mutex<LbState>,
    page_size: usize,
    forced_conflicts: AtomicUsize,
    create_attempts: AtomicUsize,
    page_requests: AtomicUsize,
}

impl FakeLoadBalancer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LbState::default()),
            page_size: 400,
            forced_conflicts: AtomicUsize::new(0),
            create_attempts: AtomicUsize::new(0),
            page_requests: AtomicUsize::new(0),
        }
    }

    /// One load balancer with HTTP :80 and HTTPS :443 listeners and the
    /// challenge target group attached to it.
    pub fn standard() -> Self {
        let fake = Self::new();
        fake.add_listener(LOAD_BALANCER, HTTP_LISTENER, Protocol::Http, 80);
        fake.add_listener(LOAD_BALANCER, HTTPS_LISTENER, Protocol::Https, 443);
        fake.map_target_group(TARGET_GROUP, LOAD_BALANCER);
        fake
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn add_listener(&self, load_balancer: &str, arn: &str, protocol: Protocol, port: u16) {
        let mut state = self.state.lock();
        state
            .listeners
            .entry(load_balancer.to_string())
            .or_default()
            .push(Listener {
                arn: arn.to_string(),
                protocol: Some(protocol),
                port: Some(port),
            });
        state.rules.entry(arn.to_string()).or_default().push(ListenerRule {
            arn: format!("{arn}/rule/default"),
            priority: "default".to_string(),
            condition: RuleCondition::new(),
            action: RuleAction::Other("fixed-response 404".to_string()),
            is_default: true,
        });
    }

    pub fn insert_rule(
        &self,
        listener: &str,
        priority: u32,
        condition: RuleCondition,
        action: RuleAction,
    ) -> String {
        let mut state = self.state.lock();
        state.next_rule += 1;
        let arn = format!("{listener}/rule/{}", state.next_rule);
        state
            .rules
            .entry(listener.to_string())
            .or_default()
            .push(ListenerRule {
                arn: arn.clone(),
                priority: priority.to_string(),
                condition,
                action,
                is_default: false,
            });
        arn
    }

    pub fn attach_certificate(&self, listener: &str, certificate_arn: &str) {
        self.state
            .lock()
            .certificates
            .entry(listener.to_string())
            .or_default()
            .push(certificate_arn.to_string());
    }

    pub fn map_target_group(&self, target_group: &str, load_balancer: &str) {
        self.state
            .lock()
            .target_groups
            .insert(target_group.to_string(), load_balancer.to_string());
    }

    pub fn register_lambda(&self, target_group: &str, function: &str) {
        self.state
            .lock()
            .lambda_targets
            .push((target_group.to_string(), function.to_string()));
    }

    /// Reject the next `n` creates with `PriorityInUse`.
    pub fn force_conflicts(&self, n: usize) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::SeqCst)
    }

    pub fn page_requests(&self) -> usize {
        self.page_requests.load(Ordering::SeqCst)
    }

    pub fn rules(&self, listener: &str) -> Vec<ListenerRule> {
        self.state
            .lock()
            .rules
            .get(listener)
            .cloned()
            .unwrap_or_default()
    }

    pub fn priorities(&self, listener: &str) -> Vec<u32> {
        self.rules(listener)
            .iter()
            .filter_map(|r| r.priority.parse().ok())
            .collect()
    }

    /// Action the listener applies to a request for `host` and `path`, in
    /// priority order, ignoring the default rule.
    pub fn serve(&self, listener: &str, host: &str, path: &str) -> Option<RuleAction> {
        let mut rules: Vec<(u32, ListenerRule)> = self
            .rules(listener)
            .into_iter()
            .filter_map(|r| r.priority.parse().ok().map(|p| (p, r)))
            .collect();
        rules.sort_by_key(|(p, _)| *p);

        rules
            .into_iter()
            .map(|(_, r)| r)
            .find(|r| {
                let c = &r.condition;
                c.is_supported()
                    && c.host_headers
                        .as_ref()
                        .is_none_or(|hosts| hosts.iter().any(|h| h.eq_ignore_ascii_case(host)))
                    && c.path_patterns
                        .as_ref()
                        .is_none_or(|paths| paths.iter().any(|p| glob_matches(p, path)))
            })
            .map(|r| r.action)
    }
}

fn glob_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

#[async_trait]
impl LoadBalancerApi for FakeLoadBalancer {
    async fn listeners(&self, load_balancer_arn: &str) -> Result<Vec<Listener>, AlbError> {
        tokio::task::yield_now().await;
        Ok(self
            .state
            .lock()
            .listeners
            .get(load_balancer_arn)
            .cloned()
            .unwrap_or_default())
    }

    async fn rules_page(
        &self,
        listener_arn: &str,
        marker: Option<String>,
    ) -> Result<RulePage, AlbError> {
        tokio::task::yield_now().await;
        self.page_requests.fetch_add(1, Ordering::SeqCst);

        let rules = self.rules(listener_arn);
        let start = match marker {
            Some(m) => m
                .parse::<usize>()
                .map_err(|_| AlbError::Api(format!("bad marker {m}")))?,
            None => 0,
        };
        let end = (start + self.page_size).min(rules.len());
        let next_marker = (end < rules.len()).then(|| end.to_string());

        Ok(RulePage {
            rules: rules.get(start..end).map(<[_]>::to_vec).unwrap_or_default(),
            next_marker,
        })
    }

    async fn create_rule(&self, listener_arn: &str, rule: NewRule) -> Result<String, AlbError> {
        tokio::task::yield_now().await;
        self.create_attempts.fetch_add(1, Ordering::SeqCst);

        if self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AlbError::PriorityInUse(rule.priority));
        }

        let taken = self.priorities(listener_arn).contains(&rule.priority);
        if taken {
            return Err(AlbError::PriorityInUse(rule.priority));
        }
        Ok(self.insert_rule(listener_arn, rule.priority, rule.condition, rule.action))
    }

    async fn delete_rule(&self, rule_arn: &str) -> Result<(), AlbError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        for rules in state.rules.values_mut() {
            if let Some(pos) = rules.iter().position(|r| r.arn == rule_arn) {
                rules.remove(pos);
                return Ok(());
            }
        }
        Err(AlbError::RuleNotFound)
    }

    async fn listener_certificates(&self, listener_arn: &str) -> Result<Vec<String>, AlbError> {
        Ok(self
            .state
            .lock()
            .certificates
            .get(listener_arn)
            .cloned()
            .unwrap_or_default())
    }

    async fn target_group_load_balancer(
        &self,
        target_group_arn: &str,
    ) -> Result<String, AlbError> {
        self.state
            .lock()
            .target_groups
            .get(target_group_arn)
            .cloned()
            .ok_or_else(|| AlbError::TargetGroupNotFound(target_group_arn.to_string()))
    }

    async fn lambda_target_group(&self, function_arn: &str) -> Result<String, AlbError> {
        self.state
            .lock()
            .lambda_targets
            .iter()
            .find(|(_, id)| function_arn.starts_with(id.as_str()))
            .map(|(tg, _)| tg.clone())
            .ok_or_else(|| AlbError::NoFunctionTargetGroup(function_arn.to_string()))
    }
}

/// Prober that answers from a fixed script, then from `fallback`.
pub struct ScriptedProber {
    script: Mutex<VecDeque<Result<ProbeResponse, ProbeError>>>,
    fallback: Result<ProbeResponse, ProbeError>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedProber {
    pub fn new(script: impl IntoIterator<Item = Result<ProbeResponse, ProbeError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: Err(ProbeError::Other("script exhausted".to_string())),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(response: Result<ProbeResponse, ProbeError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: response,
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.urls.lock().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn fetch(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        self.urls.lock().push(url.to_string());
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Prober that looks plain HTTP requests up in a fake listener's rule table
/// and treats every HTTPS endpoint as trusted.
pub struct ListenerProber {
    load_balancer: Arc<FakeLoadBalancer>,
    listener: String,
    urls: Mutex<Vec<String>>,
}

impl ListenerProber {
    pub fn new(load_balancer: Arc<FakeLoadBalancer>, listener: &str) -> Self {
        Self {
            load_balancer,
            listener: listener.to_string(),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Prober for ListenerProber {
    async fn fetch(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        self.urls.lock().push(url.to_string());

        if url.starts_with("https://") {
            return Ok(ProbeResponse {
                status: 200,
                body: Vec::new(),
            });
        }

        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| ProbeError::Other(format!("unsupported url {url}")))?;
        let (host, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };

        match self.load_balancer.serve(&self.listener, host, path) {
            Some(RuleAction::FixedResponse { body }) => Ok(ProbeResponse {
                status: 200,
                body: body.into_bytes(),
            }),
            _ => Ok(ProbeResponse {
                status: 404,
                body: Vec::new(),
            }),
        }
    }
}

pub struct MemoryKeyStore {
    key: Mutex<Option<Vec<u8>>>,
    failing: bool,
}

impl MemoryKeyStore {
    pub fn empty() -> Self {
        Self {
            key: Mutex::new(None),
            failing: false,
        }
    }

    pub fn with_key(key: Vec<u8>) -> Self {
        Self {
            key: Mutex::new(Some(key)),
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            key: Mutex::new(None),
            failing: true,
        }
    }
}

#[async_trait]
impl AccountKeyStore for MemoryKeyStore {
    async fn load(&self) -> Result<Vec<u8>, KeyStoreError> {
        if self.failing {
            return Err(KeyStoreError::Api("access denied".to_string()));
        }
        self.key.lock().clone().ok_or(KeyStoreError::NotFound)
    }

    async fn save(&self, key: &[u8]) -> Result<(), KeyStoreError> {
        *self.key.lock() = Some(key.to_vec());
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Default)]
pub struct FakeCertificateStore {
    certificates: Mutex<HashMap<String, String>>,
    imports: Mutex<Vec<CertificateImport>>,
}

impl FakeCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, arn: &str, pem: &str) {
        self.certificates
            .lock()
            .insert(arn.to_string(), pem.to_string());
    }

    pub fn imports(&self) -> Vec<CertificateImport> {
        self.imports.lock().clone()
    }
}

#[async_trait]
impl CertificateStore for FakeCertificateStore {
    async fn get_certificate(&self, arn: &str) -> Result<String, CertError> {
        self.certificates
            .lock()
            .get(arn)
            .cloned()
            .ok_or_else(|| CertError::Api(format!("certificate {arn} not found")))
    }

    async fn import_certificate(&self, import: CertificateImport) -> Result<String, CertError> {
        let arn = import
            .certificate_arn
            .clone()
            .unwrap_or_else(|| format!("arn:aws:acm:us-east-1:123456789012:certificate/{}", self.imports.lock().len() + 1));
        self.certificates
            .lock()
            .insert(arn.clone(), import.chain_pem.clone());
        self.imports.lock().push(import);
        Ok(arn)
    }
}

/// Issuer that runs the solver like a real order would and hands back an
/// authority-style certificate.
pub struct FakeIssuer {
    calls: AtomicUsize,
    order_delay: Mutex<Duration>,
}

impl FakeIssuer {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            order_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Time the order takes to become ready once the challenge is served.
    pub fn set_order_delay(&self, delay: Duration) {
        *self.order_delay.lock() = delay;
    }
}

#[async_trait]
impl CertificateIssuer for FakeIssuer {
    async fn issue(
        &self,
        _account: StoredAccount,
        domains: &[String],
        solver: &dyn ChallengeSolver,
    ) -> Result<IssuedCertificate, IssueError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let challenge = Challenge::new(format!("token-{n}"), format!("token-{n}.thumbprint"));

        solver.present(&challenge).await?;
        let waited = solver.wait(&challenge).await;
        let delay = *self.order_delay.lock();
        if waited.is_ok() && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        solver.clean_up(&challenge).await?;
        waited?;

        let domain = domains.first().map(String::as_str).unwrap_or("example.test");
        let cert = authority_cert(domain);
        Ok(IssuedCertificate {
            private_key_pem: cert.key_pem,
            chain_pem: cert.cert_pem,
        })
    }
}

pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
}

fn self_signed(common_name: &str, organization: &str) -> TestCert {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    let mut params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, organization);
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    TestCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    }
}

/// Certificate whose issuer names the ACME authority.
pub fn authority_cert(common_name: &str) -> TestCert {
    self_signed(common_name, "Let's Encrypt")
}

/// Certificate a deployment installs before the first issuance.
pub fn placeholder_cert(common_name: &str) -> TestCert {
    self_signed(common_name, "Placeholder CA")
}
