//! Elastic Load Balancing v2 adapter

use async_trait::async_trait;
use aws_sdk_elasticloadbalancingv2::Client;
use aws_sdk_elasticloadbalancingv2::error::DisplayErrorContext;
use aws_sdk_elasticloadbalancingv2::types::{
    Action, ActionTypeEnum, FixedResponseActionConfig, HostHeaderConditionConfig,
    PathPatternConditionConfig, ProtocolEnum, Rule, RuleCondition as ElbRuleCondition,
    TargetTypeEnum,
};
use tracing::debug;

use super::{
    AlbError, Listener, ListenerRule, LoadBalancerApi, NewRule, Protocol, RuleAction,
    RuleCondition, RulePage,
};
use crate::defaults::RULES_PAGE_SIZE;

const FIELD_PATH_PATTERN: &str = "path-pattern";
const FIELD_HOST_HEADER: &str = "host-header";

pub struct ElbClient {
    client: Client,
}

impl ElbClient {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }
}

fn api_error<E: std::error::Error>(operation: &str, err: E) -> AlbError {
    AlbError::Api(format!("{operation}: {}", DisplayErrorContext(err)))
}

fn protocol_from_elb(protocol: &ProtocolEnum) -> Option<Protocol> {
    match protocol {
        ProtocolEnum::Http => Some(Protocol::Http),
        ProtocolEnum::Https => Some(Protocol::Https),
        _ => None,
    }
}

fn condition_from_elb(rule: &Rule) -> RuleCondition {
    let mut condition = RuleCondition::new();
    for c in rule.conditions() {
        if c.http_header_config().is_some() {
            condition.mark_unsupported("http-header");
        }
        if c.http_request_method_config().is_some() {
            condition.mark_unsupported("http-request-method");
        }
        if c.query_string_config().is_some() {
            condition.mark_unsupported("query-string");
        }
        if c.source_ip_config().is_some() {
            condition.mark_unsupported("source-ip");
        }

        match c.field().unwrap_or_default() {
            FIELD_PATH_PATTERN => {
                let values = c
                    .path_pattern_config()
                    .map(|cfg| cfg.values().to_vec())
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| c.values().to_vec());
                condition.extend_paths(values);
            }
            FIELD_HOST_HEADER => {
                let values = c
                    .host_header_config()
                    .map(|cfg| cfg.values().to_vec())
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| c.values().to_vec());
                condition.extend_hosts(values);
            }
            field @ ("http-header" | "http-request-method" | "query-string" | "source-ip") => {
                if !condition.unsupported.iter().any(|f| f == field) {
                    condition.mark_unsupported(field);
                }
            }
            "" => {}
            other => condition.mark_unsupported(other),
        }
    }
    condition
}

fn action_from_elb(action: Option<&Action>) -> RuleAction {
    let Some(action) = action else {
        return RuleAction::Other("none".to_string());
    };
    match action.r#type() {
        Some(ActionTypeEnum::FixedResponse) => RuleAction::FixedResponse {
            body: action
                .fixed_response_config()
                .and_then(|c| c.message_body())
                .unwrap_or_default()
                .to_string(),
        },
        Some(ActionTypeEnum::Forward) => {
            let target_group_arn = action.target_group_arn().or_else(|| {
                action
                    .forward_config()
                    .and_then(|f| f.target_groups().first())
                    .and_then(|t| t.target_group_arn())
            });
            RuleAction::Forward {
                target_group_arn: target_group_arn.unwrap_or_default().to_string(),
            }
        }
        other => RuleAction::Other(
            other
                .map(|t| t.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        ),
    }
}

fn rule_from_elb(rule: &Rule) -> Result<ListenerRule, AlbError> {
    let arn = rule
        .rule_arn()
        .ok_or_else(|| AlbError::Api("DescribeRules returned a rule without an ARN".to_string()))?;
    Ok(ListenerRule {
        arn: arn.to_string(),
        priority: rule.priority().unwrap_or_default().to_string(),
        condition: condition_from_elb(rule),
        action: action_from_elb(rule.actions().first()),
        is_default: rule.is_default().unwrap_or(false),
    })
}

fn conditions_to_elb(condition: &RuleCondition) -> Vec<ElbRuleCondition> {
    let mut out = Vec::new();
    if let Some(hosts) = &condition.host_headers {
        out.push(
            ElbRuleCondition::builder()
                .field(FIELD_HOST_HEADER)
                .host_header_config(
                    HostHeaderConditionConfig::builder()
                        .set_values(Some(hosts.clone()))
                        .build(),
                )
                .build(),
        );
    }
    if let Some(paths) = &condition.path_patterns {
        out.push(
            ElbRuleCondition::builder()
                .field(FIELD_PATH_PATTERN)
                .path_pattern_config(
                    PathPatternConditionConfig::builder()
                        .set_values(Some(paths.clone()))
                        .build(),
                )
                .build(),
        );
    }
    out
}

fn action_to_elb(action: &RuleAction) -> Result<Action, AlbError> {
    match action {
        RuleAction::FixedResponse { body } => {
            let config = FixedResponseActionConfig::builder()
                .status_code("200")
                .content_type("text/plain")
                .message_body(body)
                .build();
            Ok(Action::builder()
                .r#type(ActionTypeEnum::FixedResponse)
                .fixed_response_config(config)
                .build())
        }
        RuleAction::Forward { target_group_arn } => Ok(Action::builder()
            .r#type(ActionTypeEnum::Forward)
            .target_group_arn(target_group_arn)
            .build()),
        RuleAction::Other(kind) => Err(AlbError::InvalidRule(format!(
            "cannot create a rule with a {kind} action"
        ))),
    }
}

#[async_trait]
impl LoadBalancerApi for ElbClient {
    async fn listeners(&self, load_balancer_arn: &str) -> Result<Vec<Listener>, AlbError> {
        let mut listeners = Vec::new();
        let mut marker = None;
        loop {
            let output = self
                .client
                .describe_listeners()
                .load_balancer_arn(load_balancer_arn)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| api_error("DescribeListeners", e))?;

            listeners.extend(output.listeners().iter().filter_map(|l| {
                Some(Listener {
                    arn: l.listener_arn()?.to_string(),
                    protocol: l.protocol().and_then(protocol_from_elb),
                    port: l.port().and_then(|p| u16::try_from(p).ok()),
                })
            }));

            match output.next_marker() {
                Some(next) if !next.is_empty() => marker = Some(next.to_string()),
                _ => return Ok(listeners),
            }
        }
    }

    async fn rules_page(
        &self,
        listener_arn: &str,
        marker: Option<String>,
    ) -> Result<RulePage, AlbError> {
        let output = self
            .client
            .describe_rules()
            .listener_arn(listener_arn)
            .page_size(RULES_PAGE_SIZE)
            .set_marker(marker)
            .send()
            .await
            .map_err(|e| api_error("DescribeRules", e))?;

        let rules = output
            .rules()
            .iter()
            .map(rule_from_elb)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(listener = %listener_arn, count = rules.len(), "Fetched rule page");

        Ok(RulePage {
            rules,
            next_marker: output.next_marker().map(str::to_string),
        })
    }

    async fn create_rule(&self, listener_arn: &str, rule: NewRule) -> Result<String, AlbError> {
        let priority = i32::try_from(rule.priority)
            .map_err(|_| AlbError::InvalidRule(format!("priority {} out of range", rule.priority)))?;

        let result = self
            .client
            .create_rule()
            .listener_arn(listener_arn)
            .priority(priority)
            .set_conditions(Some(conditions_to_elb(&rule.condition)))
            .actions(action_to_elb(&rule.action)?)
            .send()
            .await;

        match result {
            Ok(output) => output
                .rules()
                .first()
                .and_then(|r| r.rule_arn())
                .map(str::to_string)
                .ok_or_else(|| AlbError::Api("CreateRule returned no rule".to_string())),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_priority_in_use_exception()) =>
            {
                Err(AlbError::PriorityInUse(rule.priority))
            }
            Err(err) => Err(api_error("CreateRule", err)),
        }
    }

    async fn delete_rule(&self, rule_arn: &str) -> Result<(), AlbError> {
        match self.client.delete_rule().rule_arn(rule_arn).send().await {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_rule_not_found_exception()) =>
            {
                Err(AlbError::RuleNotFound)
            }
            Err(err) => Err(api_error("DeleteRule", err)),
        }
    }

    async fn listener_certificates(&self, listener_arn: &str) -> Result<Vec<String>, AlbError> {
        let mut arns = Vec::new();
        let mut marker = None;
        loop {
            let output = self
                .client
                .describe_listener_certificates()
                .listener_arn(listener_arn)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| api_error("DescribeListenerCertificates", e))?;

            arns.extend(
                output
                    .certificates()
                    .iter()
                    .filter_map(|c| c.certificate_arn())
                    .map(str::to_string),
            );

            match output.next_marker() {
                Some(next) if !next.is_empty() => marker = Some(next.to_string()),
                _ => return Ok(arns),
            }
        }
    }

    async fn target_group_load_balancer(
        &self,
        target_group_arn: &str,
    ) -> Result<String, AlbError> {
        let output = match self
            .client
            .describe_target_groups()
            .target_group_arns(target_group_arn)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_target_group_not_found_exception()) =>
            {
                return Err(AlbError::TargetGroupNotFound(target_group_arn.to_string()));
            }
            Err(err) => return Err(api_error("DescribeTargetGroups", err)),
        };

        let group = output
            .target_groups()
            .first()
            .ok_or_else(|| AlbError::TargetGroupNotFound(target_group_arn.to_string()))?;
        group
            .load_balancer_arns()
            .first()
            .cloned()
            .ok_or_else(|| AlbError::NoLoadBalancer(target_group_arn.to_string()))
    }

    async fn lambda_target_group(&self, function_arn: &str) -> Result<String, AlbError> {
        let mut marker = None;
        loop {
            let output = self
                .client
                .describe_target_groups()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| api_error("DescribeTargetGroups", e))?;

            for group in output.target_groups() {
                if group.target_type() != Some(&TargetTypeEnum::Lambda) {
                    continue;
                }
                let Some(group_arn) = group.target_group_arn() else {
                    continue;
                };

                let health = self
                    .client
                    .describe_target_health()
                    .target_group_arn(group_arn)
                    .send()
                    .await
                    .map_err(|e| api_error("DescribeTargetHealth", e))?;

                // Registered ids may omit the version qualifier the
                // function ARN carries.
                let serves_function = health
                    .target_health_descriptions()
                    .iter()
                    .filter_map(|d| d.target().and_then(|t| t.id()))
                    .any(|id| function_arn.starts_with(id));
                if serves_function {
                    return Ok(group_arn.to_string());
                }
            }

            match output.next_marker() {
                Some(next) if !next.is_empty() => marker = Some(next.to_string()),
                _ => return Err(AlbError::NoFunctionTargetGroup(function_arn.to_string())),
            }
        }
    }
}
