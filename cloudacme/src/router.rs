//! Trigger dispatch
//!
//! A load balancer request means the bootstrap rule forwarded a visitor here:
//! issue a certificate for the requested host, then send the visitor to the
//! HTTPS version of the page. A renewal event runs a scheduled rotation.
//! Either way the whole invocation is bounded by one deadline.

use cloudacme_core::{
    AlbTargetGroupRequest, AlbTargetGroupResponse, CertificateRenewalEvent, EventResponse,
    RenewalResponse, TriggerEvent,
};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::alb::AlbError;
use crate::context::Context;
use crate::rotation::{CertificateRotator, RotationError, RotationMode, RotationOutcome};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("request has no host header")]
    MissingHost,

    #[error("failed to resolve load balancer from target group {target_group}: {source}")]
    ResolveLoadBalancer {
        target_group: String,
        #[source]
        source: AlbError,
    },

    #[error(transparent)]
    Rotation(#[from] RotationError),

    #[error("invocation did not finish within {0:?}")]
    DeadlineExceeded(Duration),
}

pub struct EventRouter {
    ctx: Context,
    rotator: CertificateRotator,
}

impl EventRouter {
    pub fn new(ctx: Context) -> Self {
        Self {
            rotator: CertificateRotator::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn dispatch(&self, event: TriggerEvent) -> EventResponse {
        match event {
            TriggerEvent::Request(request) => EventResponse::Http(self.handle_request(&request).await),
            TriggerEvent::Renewal(renewal) => {
                let response = match self.handle_renewal(&renewal).await {
                    Ok(outcome) => RenewalResponse::Ok {
                        domain: renewal.domain.clone(),
                        outcome: outcome.to_string(),
                    },
                    Err(e) => {
                        error!(domain = %renewal.domain, error = %e, "Renewal failed");
                        RenewalResponse::Error {
                            message: e.to_string(),
                        }
                    }
                };
                EventResponse::Renewal(response)
            }
        }
    }

    /// Issue for the requested host, then redirect to HTTPS.
    ///
    /// Failures turn into a 500 response so the visitor is not left hanging.
    pub async fn handle_request(&self, request: &AlbTargetGroupRequest) -> AlbTargetGroupResponse {
        match self.rotate_for_request(request).await {
            Ok(location) => {
                info!(location = %location, "Redirecting to HTTPS");
                AlbTargetGroupResponse::redirect(location)
            }
            Err(e) => {
                error!(
                    host = %request.host().unwrap_or_default(),
                    path = %request.path,
                    error = %e,
                    "Certificate setup for request failed"
                );
                AlbTargetGroupResponse::error(
                    500,
                    "Internal Server Error",
                    "Certificate setup failed, please retry shortly",
                )
            }
        }
    }

    async fn rotate_for_request(&self, request: &AlbTargetGroupRequest) -> Result<String, RouterError> {
        let host = request.host().ok_or(RouterError::MissingHost)?;
        let target_group = request.target_group_arn();
        let load_balancer = self
            .ctx
            .load_balancer
            .target_group_load_balancer(target_group)
            .await
            .map_err(|source| RouterError::ResolveLoadBalancer {
                target_group: target_group.to_string(),
                source,
            })?;

        info!(host = %host, load_balancer = %load_balancer, "Received first request for domain");
        self.rotate(&load_balancer, &host, RotationMode::Request)
            .await?;
        Ok(https_redirect_url(request, &host))
    }

    pub async fn handle_renewal(
        &self,
        event: &CertificateRenewalEvent,
    ) -> Result<RotationOutcome, RouterError> {
        let domain = event.domain.trim().to_ascii_lowercase();
        self.rotate(&event.alb_arn, &domain, RotationMode::Renewal)
            .await
    }

    /// One rotation bounded by the invocation timeout.
    async fn rotate(
        &self,
        load_balancer_arn: &str,
        domain: &str,
        mode: RotationMode,
    ) -> Result<RotationOutcome, RouterError> {
        let budget = self.ctx.settings.invocation_timeout();
        let deadline = Instant::now() + budget;
        match self
            .rotator
            .rotate_until(load_balancer_arn, domain, mode, deadline)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(RotationError::DeadlineExceeded(step)) => {
                warn!(domain = %domain, step, "Invocation deadline exceeded");
                Err(RouterError::DeadlineExceeded(budget))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// `https://<host><path>?<query>` for the request, path and query preserved.
pub fn https_redirect_url(request: &AlbTargetGroupRequest, host: &str) -> String {
    let path = if request.path.is_empty() {
        "/"
    } else {
        request.path.as_str()
    };
    let mut url = format!("https://{host}{path}");

    let query = request
        .query_pairs()
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query);
    }
    url
}
