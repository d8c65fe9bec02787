//! Edge request handling.
//!
//! Maps CDN-style request events onto the admission coordinator: pulls the
//! session id and marker out of cookies and headers, builds the client key,
//! and turns rejections into `429` responses that set the marker cookie.
//!
//! Two-hop deployments run the `viewer` stage at the edge (fast path only,
//! no store access) and the `origin` stage on cache misses. Single-hop
//! deployments run `full`.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::admission::{Admission, AdmissionCoordinator, AdmissionRequest, RejectResponse};
use crate::config::{SessionConfig, TollgateConfig};
use crate::error::Result;
use crate::quota::{ClientKey, Clock};
use crate::store::StateStore;

mod cookies;

pub use cookies::{cookie_value, header_value, set_cookie, set_header};

/// Header a client or upstream hop may use to weight a request.
pub const COST_HEADER: &str = "x-rate-limit-cost";

/// One header value as carried by edge events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    /// Header name in its original case
    pub key: String,
    pub value: String,
}

/// Headers keyed by lower-cased name.
pub type Headers = BTreeMap<String, Vec<HeaderEntry>>;

/// An inbound request event.
///
/// Fields the handler does not read (`querystring`, `clientIp`, `body`, ...)
/// are kept in `extra` so a forwarded event leaves as it came in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRequest {
    pub uri: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A response generated at the edge in place of the origin's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeResponse {
    pub status: String,
    pub status_description: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
}

/// Result of handling an edge event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeOutcome {
    /// Continue with this (possibly annotated) request.
    Forward(EdgeRequest),
    /// Answer the client directly.
    Respond(EdgeResponse),
}

/// Which admission tiers a deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Fast path only; hands the session id to the next hop.
    Viewer,
    /// Quota engine only.
    Origin,
    /// Fast path followed by the quota engine.
    #[default]
    Full,
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "viewer" => Ok(Stage::Viewer),
            "origin" => Ok(Stage::Origin),
            "full" => Ok(Stage::Full),
            other => Err(format!(
                "unknown stage {:?}, expected viewer, origin or full",
                other
            )),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Viewer => "viewer",
            Stage::Origin => "origin",
            Stage::Full => "full",
        };
        f.write_str(name)
    }
}

/// Handles edge events for one stage.
pub struct EdgeHandler<S: StateStore> {
    coordinator: AdmissionCoordinator<S>,
    session: SessionConfig,
    marker_cookie: String,
    stage: Stage,
}

impl<S: StateStore> EdgeHandler<S> {
    /// Create a handler around an existing coordinator.
    pub fn new(
        coordinator: AdmissionCoordinator<S>,
        session: SessionConfig,
        marker_cookie: impl Into<String>,
        stage: Stage,
    ) -> Self {
        Self {
            coordinator,
            session,
            marker_cookie: marker_cookie.into(),
            stage,
        }
    }

    /// Wire a handler from configuration.
    pub fn from_config(
        config: &TollgateConfig,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        stage: Stage,
    ) -> Result<Self> {
        let coordinator = AdmissionCoordinator::from_config(config, store, clock)?;
        Ok(Self::new(
            coordinator,
            config.session.clone(),
            config.marker.cookie_name.clone(),
            stage,
        ))
    }

    /// The stage this handler runs.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The coordinator behind this handler.
    pub fn coordinator(&self) -> &AdmissionCoordinator<S> {
        &self.coordinator
    }

    /// Decide on one request event.
    pub async fn handle(&self, mut request: EdgeRequest) -> EdgeOutcome {
        let admission = self.admission_request(&request);
        trace!(
            uri = %request.uri,
            stage = %self.stage,
            has_key = admission.client_key.is_some(),
            has_marker = admission.marker.is_some(),
            "Handling edge request"
        );

        let outcome = match self.stage {
            Stage::Viewer => self.coordinator.check_marker(admission.marker.as_deref()),
            Stage::Origin => match &admission.client_key {
                Some(key) => {
                    let cost = admission.cost.unwrap_or(1).max(1);
                    self.coordinator.check_quota(key, cost).await
                }
                None => Admission::Forward,
            },
            Stage::Full => self.coordinator.admit(&admission).await,
        };

        match outcome {
            Admission::Forward => {
                if self.stage == Stage::Viewer {
                    self.forward_session(&mut request);
                }
                EdgeOutcome::Forward(request)
            }
            Admission::Reject(reject) => {
                debug!(
                    uri = %request.uri,
                    retry_after_secs = reject.retry_after_secs,
                    "Rejecting edge request"
                );
                EdgeOutcome::Respond(self.reject_response(&reject))
            }
        }
    }

    /// Session id from the session cookie or, on later hops, the header.
    pub fn session_id<'a>(&self, request: &'a EdgeRequest) -> Option<&'a str> {
        cookie_value(&request.headers, &self.session.cookie_name)
            .or_else(|| header_value(&request.headers, &self.session.header_name))
            .filter(|id| !id.is_empty())
    }

    /// Extract what the coordinator needs from a request event.
    pub fn admission_request(&self, request: &EdgeRequest) -> AdmissionRequest {
        let client_key = self
            .session_id(request)
            .map(|session| ClientKey::for_session(session, &request.uri));

        let marker = cookie_value(&request.headers, &self.marker_cookie)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        let cost = header_value(&request.headers, COST_HEADER)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|cost| *cost > 0);

        AdmissionRequest {
            client_key,
            marker,
            cost,
        }
    }

    /// Copy the session id into the session header for the origin hop.
    fn forward_session(&self, request: &mut EdgeRequest) {
        if let Some(session) = cookie_value(&request.headers, &self.session.cookie_name)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
        {
            set_header(&mut request.headers, &self.session.header_name, session);
        }
    }

    fn reject_response(&self, reject: &RejectResponse) -> EdgeResponse {
        let mut headers = Headers::new();
        set_header(&mut headers, "Retry-After", reject.retry_after_secs.to_string());
        if let Some(marker) = &reject.marker {
            set_header(
                &mut headers,
                "Set-Cookie",
                set_cookie(&self.marker_cookie, &marker.token, marker.max_age_secs),
            );
        }

        EdgeResponse {
            status: reject.status.to_string(),
            status_description: reject.status_text.clone(),
            headers,
            body: String::new(),
        }
    }
}
