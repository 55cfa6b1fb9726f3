use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    AlbError, Listener, ListenerRule, LoadBalancerApi, NewRule, Protocol, RuleAction,
    RuleCondition, matches, next_priority, parse_priorities,
};

/// Re-allocations attempted after the control plane rejects a priority that
/// a concurrent writer took between our list and create calls.
const PRIORITY_CONFLICT_RETRIES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRule {
    pub arn: String,
    pub priority: u32,
}

/// Listener rule operations on top of [`LoadBalancerApi`]
#[derive(Clone)]
pub struct RuleManager {
    api: Arc<dyn LoadBalancerApi>,
}

impl RuleManager {
    pub fn new(api: Arc<dyn LoadBalancerApi>) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &Arc<dyn LoadBalancerApi> {
        &self.api
    }

    pub async fn find_listener(
        &self,
        load_balancer_arn: &str,
        protocol: Protocol,
        port: u16,
    ) -> Result<Listener, AlbError> {
        self.api
            .listeners(load_balancer_arn)
            .await?
            .into_iter()
            .find(|l| l.protocol == Some(protocol) && l.port == Some(port))
            .ok_or_else(|| AlbError::ListenerNotFound {
                load_balancer: load_balancer_arn.to_string(),
                protocol,
                port,
            })
    }

    /// Every rule on the listener, across all pages.
    pub async fn list_rules(&self, listener_arn: &str) -> Result<Vec<ListenerRule>, AlbError> {
        let mut rules = Vec::new();
        let mut marker = None;
        loop {
            let page = self.api.rules_page(listener_arn, marker.take()).await?;
            rules.extend(page.rules);
            match page.next_marker {
                Some(next) if !next.is_empty() => marker = Some(next),
                _ => return Ok(rules),
            }
        }
    }

    pub async fn next_priority(&self, listener_arn: &str) -> Result<u32, AlbError> {
        let rules = self.list_rules(listener_arn).await?;
        let taken = parse_priorities(rules.iter().map(|r| r.priority.as_str()));
        Ok(next_priority(&taken))
    }

    /// Create a rule at an explicit priority.
    pub async fn add_rule_at(
        &self,
        listener_arn: &str,
        condition: &RuleCondition,
        priority: u32,
        action: &RuleAction,
    ) -> Result<String, AlbError> {
        if condition.is_empty() {
            return Err(AlbError::InvalidRule(
                "a rule needs at least one condition".to_string(),
            ));
        }
        if !condition.is_supported() {
            return Err(AlbError::InvalidRule(format!(
                "unsupported condition: {condition}"
            )));
        }
        if priority == 0 {
            return Err(AlbError::InvalidRule("priority must be positive".to_string()));
        }

        self.api
            .create_rule(
                listener_arn,
                NewRule {
                    priority,
                    condition: condition.clone(),
                    action: action.clone(),
                },
            )
            .await
    }

    /// Fixed `200 text/plain` response carrying `body`.
    pub async fn add_static_rule(
        &self,
        listener_arn: &str,
        condition: &RuleCondition,
        body: &str,
    ) -> Result<CreatedRule, AlbError> {
        let action = RuleAction::FixedResponse {
            body: body.to_string(),
        };
        self.add_rule(listener_arn, condition, &action).await
    }

    pub async fn add_forwarding_rule(
        &self,
        listener_arn: &str,
        condition: &RuleCondition,
        target_group_arn: &str,
    ) -> Result<CreatedRule, AlbError> {
        let action = RuleAction::Forward {
            target_group_arn: target_group_arn.to_string(),
        };
        self.add_rule(listener_arn, condition, &action).await
    }

    async fn add_rule(
        &self,
        listener_arn: &str,
        condition: &RuleCondition,
        action: &RuleAction,
    ) -> Result<CreatedRule, AlbError> {
        let mut retries = 0;
        loop {
            let priority = self.next_priority(listener_arn).await?;
            match self
                .add_rule_at(listener_arn, condition, priority, action)
                .await
            {
                Ok(arn) => {
                    info!(
                        listener = %listener_arn,
                        priority,
                        condition = %condition,
                        action = %action,
                        "Created listener rule"
                    );
                    return Ok(CreatedRule { arn, priority });
                }
                Err(AlbError::PriorityInUse(taken)) if retries < PRIORITY_CONFLICT_RETRIES => {
                    retries += 1;
                    warn!(
                        listener = %listener_arn,
                        priority = taken,
                        retry = retries,
                        "Priority taken concurrently, allocating again"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// First rule whose condition matches `condition`.
    pub async fn find_matching_rule(
        &self,
        listener_arn: &str,
        condition: &RuleCondition,
    ) -> Result<Option<ListenerRule>, AlbError> {
        let rules = self.list_rules(listener_arn).await?;
        Ok(rules
            .into_iter()
            .filter(|r| !r.is_default)
            .find(|r| matches(&r.condition, condition)))
    }

    /// Delete the first rule matching `condition` and return its ARN.
    ///
    /// [`AlbError::RuleNotFound`] when nothing matches.
    pub async fn delete_matching_rule(
        &self,
        listener_arn: &str,
        condition: &RuleCondition,
    ) -> Result<String, AlbError> {
        let rule = self
            .find_matching_rule(listener_arn, condition)
            .await?
            .ok_or(AlbError::RuleNotFound)?;

        debug!(rule = %rule.arn, priority = %rule.priority, "Deleting listener rule");
        self.api.delete_rule(&rule.arn).await?;
        info!(
            listener = %listener_arn,
            rule = %rule.arn,
            condition = %condition,
            "Deleted listener rule"
        );
        Ok(rule.arn)
    }
}
