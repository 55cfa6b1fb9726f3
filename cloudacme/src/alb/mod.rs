//! Load balancer listener rules
//!
//! Everything that reads or mutates a listener's rule table lives here: the
//! condition matcher, the priority allocator and the rule manager built on
//! both. They reach the control plane only through [`LoadBalancerApi`].

mod aws;
mod condition;
mod priority;
mod rules;

pub use aws::ElbClient;
pub use condition::{RuleCondition, matches};
pub use priority::{next_priority, parse_priorities};
pub use rules::{CreatedRule, RuleManager};

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlbError {
    #[error("no {protocol} listener on port {port} for load balancer {load_balancer}")]
    ListenerNotFound {
        load_balancer: String,
        protocol: Protocol,
        port: u16,
    },

    #[error("rule not found")]
    RuleNotFound,

    #[error("priority {0} is already in use")]
    PriorityInUse(u32),

    #[error("target group not found: {0}")]
    TargetGroupNotFound(String),

    #[error("target group {0} is not attached to a load balancer")]
    NoLoadBalancer(String),

    #[error("no lambda target group serves function {0}")]
    NoFunctionTargetGroup(String),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("load balancer API error: {0}")]
    Api(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("HTTP"),
            Protocol::Https => f.write_str("HTTPS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub arn: String,
    /// `None` for protocols this crate never manages (TCP, TLS, ...).
    pub protocol: Option<Protocol>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    /// `200 text/plain` with a fixed body
    FixedResponse { body: String },
    Forward { target_group_arn: String },
    /// Anything else, kept only for display.
    Other(String),
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::FixedResponse { body } => write!(f, "fixed-response ({} bytes)", body.len()),
            RuleAction::Forward { target_group_arn } => write!(f, "forward {target_group_arn}"),
            RuleAction::Other(kind) => f.write_str(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRule {
    pub arn: String,
    /// Raw priority as the control plane reports it, `"default"` included.
    pub priority: String,
    pub condition: RuleCondition,
    pub action: RuleAction,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRule {
    pub priority: u32,
    pub condition: RuleCondition,
    pub action: RuleAction,
}

/// One page of a listener's rules
#[derive(Debug, Clone, Default)]
pub struct RulePage {
    pub rules: Vec<ListenerRule>,
    pub next_marker: Option<String>,
}

/// Load balancer control plane
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    async fn listeners(&self, load_balancer_arn: &str) -> Result<Vec<Listener>, AlbError>;

    async fn rules_page(
        &self,
        listener_arn: &str,
        marker: Option<String>,
    ) -> Result<RulePage, AlbError>;

    /// Create a rule and return its ARN. A taken priority surfaces as
    /// [`AlbError::PriorityInUse`].
    async fn create_rule(&self, listener_arn: &str, rule: NewRule) -> Result<String, AlbError>;

    async fn delete_rule(&self, rule_arn: &str) -> Result<(), AlbError>;

    /// ARNs of every certificate attached to the listener.
    async fn listener_certificates(&self, listener_arn: &str) -> Result<Vec<String>, AlbError>;

    /// The load balancer a target group is attached to.
    async fn target_group_load_balancer(&self, target_group_arn: &str)
    -> Result<String, AlbError>;

    /// The lambda-typed target group whose registered target is `function_arn`.
    async fn lambda_target_group(&self, function_arn: &str) -> Result<String, AlbError>;
}
