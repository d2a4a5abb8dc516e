use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Liveness reporting for the long-running loops of the process.
///
/// The process can only be trusted with work if the consumer loop and the
/// producer's background machinery are actually running. Each of them
/// registers a component and must report healthy more frequently than its
/// deadline; a component that stalls or reports unhealthy takes the whole
/// liveness probe down so the orchestrator restarts the process.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ComponentStatus {
    /// Set when a component is newly registered.
    Starting,
    /// Recently reported healthy, must report again before the instant.
    HealthyUntil(Instant),
    Unhealthy,
}

/// Handle passed to a component so it can report on its own schedule.
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Current status of each registered component, for display.
    pub components: HashMap<String, String>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

impl HealthHandle {
    /// Report as healthy. Must be called more frequently than the deadline
    /// configured at registration.
    pub fn report_healthy(&self) {
        self.report(ComponentStatus::HealthyUntil(Instant::now() + self.deadline));
    }

    pub fn report_unhealthy(&self) {
        self.report(ComponentStatus::Unhealthy);
    }

    fn report(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            // Poisoned lock: the probe will fail and the process restart.
            Err(_) => warn!(component = %self.component, "poisoned health registry lock"),
        }
    }
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new component. The returned handle is moved into the
    /// component so it can report its status.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        if let Ok(mut components) = self.components.write() {
            components.insert(component.to_owned(), ComponentStatus::Starting);
        }
        HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        }
    }

    /// Compute the overall process status from all registered components.
    /// Usable directly as an axum handler result.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned health registry lock");

        let now = Instant::now();
        let mut status = HealthStatus {
            // Unhealthy until at least one component has registered.
            healthy: !components.is_empty(),
            components: HashMap::new(),
        };

        for (name, component) in components.iter() {
            let display = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => "healthy",
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    "stalled"
                }
                ComponentStatus::Starting => {
                    status.healthy = false;
                    "starting"
                }
                ComponentStatus::Unhealthy => {
                    status.healthy = false;
                    "unhealthy"
                }
            };
            status.components.insert(name.clone(), display.to_owned());
        }

        if !status.healthy {
            warn!(
                "{} health check failed: {:?}",
                self.name, status.components
            );
        }
        status
    }
}
