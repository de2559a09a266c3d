//! Upgrade request inspection
//!
//! Every upgrade request passes through [`UpgradeGate`] before the WebSocket
//! handshake completes. Requests are rejected with a plain HTTP status, so a
//! refused client never sees an open connection.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::bridge::ShellRequest;
use crate::command::{self, CommandPolicy};
use crate::config::{ServiceConfig, StepCatalog};

/// Why an upgrade request was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Origin not allowed: {0}")]
    OriginNotAllowed(String),

    #[error("Command blocked by security policy")]
    CommandBlocked { pattern: String },
}

impl Rejection {
    /// HTTP status sent for this rejection
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::NotFound(_) => StatusCode::NOT_FOUND,
            Rejection::OriginNotAllowed(_) | Rejection::CommandBlocked { .. } => {
                StatusCode::FORBIDDEN
            }
        }
    }

    /// Convert into the handshake error response
    pub fn into_response(self) -> ErrorResponse {
        let status = self.status();
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = status;
        response
    }
}

/// Which browser origins may open a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    allow_any: bool,
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: Vec<String> = allowed.into_iter().map(Into::into).collect();
        Self {
            allow_any: allowed.iter().any(|o| o == "*"),
            allowed,
        }
    }

    /// Requests without an `Origin` header come from non-browser clients and
    /// are always allowed
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => {
                self.allow_any
                    || self
                        .allowed
                        .iter()
                        .any(|allowed| allowed.eq_ignore_ascii_case(origin))
            }
        }
    }
}

/// Query parameters understood on the shell endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellQuery {
    pub command: Option<String>,
    pub step_id: Option<String>,
    pub session: Option<String>,
}

impl ShellQuery {
    /// Parse a raw query string; empty values count as absent and the first
    /// occurrence of a key wins
    pub fn parse(query: &str) -> Self {
        let mut parsed = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                "command" => &mut parsed.command,
                "step_id" => &mut parsed.step_id,
                "session" => &mut parsed.session,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        parsed
    }
}

/// Decides whether an upgrade request may open a shell, and with what
#[derive(Debug)]
pub struct UpgradeGate {
    path: String,
    origins: OriginPolicy,
    policy: CommandPolicy,
    steps: Arc<StepCatalog>,
}

impl UpgradeGate {
    pub fn new(
        path: impl Into<String>,
        origins: OriginPolicy,
        policy: CommandPolicy,
        steps: Arc<StepCatalog>,
    ) -> Self {
        Self {
            path: path.into(),
            origins,
            policy,
            steps,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        let steps = StepCatalog::new(config.steps.iter().cloned());
        debug!("{} steps resolvable by step_id", steps.step_count());
        Self::new(
            config.server.path.clone(),
            OriginPolicy::new(config.websocket.allowed_origins.iter().cloned()),
            config.policy.command_policy(),
            Arc::new(steps),
        )
    }

    /// Turn an upgrade request into a shell request, or refuse it
    pub fn inspect(&self, request: &Request) -> Result<ShellRequest, Rejection> {
        let path = request.uri().path();
        if path != self.path {
            return Err(Rejection::NotFound(path.to_string()));
        }

        let origin = match request.headers().get(header::ORIGIN) {
            None => None,
            Some(value) => Some(value.to_str().map_err(|_| {
                Rejection::OriginNotAllowed(String::from_utf8_lossy(value.as_bytes()).into_owned())
            })?),
        };
        if !self.origins.allows(origin) {
            return Err(Rejection::OriginNotAllowed(
                origin.unwrap_or_default().to_string(),
            ));
        }

        let query = ShellQuery::parse(request.uri().query().unwrap_or_default());

        let (variables, mut session_name) = match query.step_id.as_deref() {
            Some(step_id) => match self.steps.resolve(step_id) {
                Some(context) => {
                    debug!(
                        "Step {} resolved with {} variables",
                        step_id,
                        context.variables.len()
                    );
                    (context.variables, context.session_name)
                }
                None => {
                    warn!("Unknown step {}; continuing without variables", step_id);
                    (HashMap::new(), None)
                }
            },
            None => (HashMap::new(), None),
        };
        if query.session.is_some() {
            session_name = query.session;
        }

        // The bridge repeats this check; rejecting here keeps blocked
        // commands from ever completing the upgrade
        if let Some(raw) = query.command.as_deref() {
            for candidate in [raw.to_string(), command::substitute(raw, &variables)] {
                if let Err(violation) = self.policy.check(&candidate) {
                    return Err(Rejection::CommandBlocked {
                        pattern: violation.pattern,
                    });
                }
            }
        }

        Ok(ShellRequest {
            command: query.command,
            variables,
            session_name,
        })
    }
}
