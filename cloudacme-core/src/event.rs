//! Trigger event shapes
//!
//! Two inbound shapes reach the event loop: the request an Application Load
//! Balancer hands to a Lambda-typed target group, and a scheduled certificate
//! renewal event. They are told apart purely by shape: a non-empty
//! `httpMethod` marks a load balancer request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Inbound trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, try_from = "serde_json::Value")]
pub enum TriggerEvent {
    /// A live HTTP request forwarded by the load balancer
    Request(AlbTargetGroupRequest),
    /// A scheduled renewal for one domain on one load balancer
    Renewal(CertificateRenewalEvent),
}

impl TryFrom<serde_json::Value> for TriggerEvent {
    type Error = serde_json::Error;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        let is_request = value
            .get("httpMethod")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|method| !method.is_empty());

        if is_request {
            serde_json::from_value(value).map(TriggerEvent::Request)
        } else {
            serde_json::from_value(value).map(TriggerEvent::Renewal)
        }
    }
}

/// Scheduled renewal event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRenewalEvent {
    pub domain: String,
    #[serde(rename = "albArn")]
    pub alb_arn: String,
}

/// Request forwarded by the load balancer to a Lambda target group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbTargetGroupRequest {
    pub http_method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query_string_parameters: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub multi_value_query_string_parameters: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub multi_value_headers: Option<BTreeMap<String, Vec<String>>>,
    pub request_context: AlbRequestContext,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub is_base64_encoded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbRequestContext {
    pub elb: ElbContext,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElbContext {
    pub target_group_arn: String,
}

impl AlbTargetGroupRequest {
    /// Case-insensitive header lookup across both header encodings.
    ///
    /// The load balancer fills exactly one of `headers` and
    /// `multiValueHeaders` depending on the target group setting.
    pub fn header(&self, name: &str) -> Option<&str> {
        if let Some(headers) = &self.headers
            && let Some((_, value)) = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            return Some(value.as_str());
        }

        self.multi_value_headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, values)| values.first())
                .map(String::as_str)
        })
    }

    /// Requested host without any port suffix, lowercased.
    pub fn host(&self) -> Option<String> {
        let raw = self.header("host")?.trim();
        let host = match raw.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => raw,
        };
        if host.is_empty() {
            return None;
        }
        Some(host.to_ascii_lowercase())
    }

    pub fn target_group_arn(&self) -> &str {
        &self.request_context.elb.target_group_arn
    }

    /// Query string pairs in the form the load balancer delivered them.
    ///
    /// Values are passed through untouched: the load balancer does not decode
    /// URL-encoded parameters before invoking the target.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        if let Some(params) = &self.query_string_parameters
            && !params.is_empty()
        {
            return params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }

        self.multi_value_query_string_parameters
            .iter()
            .flatten()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.clone(), v.clone())))
            .collect()
    }
}

/// Response returned to the load balancer for a forwarded request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbTargetGroupResponse {
    pub status_code: u16,
    pub status_description: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub is_base64_encoded: bool,
}

impl AlbTargetGroupResponse {
    pub fn redirect(location: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Location".to_string(), location.into());
        Self {
            status_code: 301,
            status_description: "301 Moved Permanently".to_string(),
            headers,
            body: String::new(),
            is_base64_encoded: false,
        }
    }

    pub fn error(status_code: u16, reason: &str, message: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        Self {
            status_code,
            status_description: format!("{status_code} {reason}"),
            headers,
            body: message.into(),
            is_base64_encoded: false,
        }
    }

    pub fn location(&self) -> Option<&str> {
        self.headers.get("Location").map(String::as_str)
    }
}

/// Result of a renewal invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RenewalResponse {
    Ok { domain: String, outcome: String },
    Error { message: String },
}

impl RenewalResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// One response line written by the event loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventResponse {
    Http(AlbTargetGroupResponse),
    Renewal(RenewalResponse),
}
