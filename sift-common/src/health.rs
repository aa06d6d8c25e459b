//! Health reporting for the worker loops.
//!
//! Each worker process runs a dequeue loop plus an HTTP server; the process
//! can only be trusted with a queue if the loop is actually turning. Every
//! loop registers a component here and reports in more often than its
//! deadline; a component that goes quiet flips the liveness probe to failing
//! so the scheduler restarts the process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered.
    Starting,
    /// Recently reported healthy, will need to report again before the date.
    HealthyUntil(DateTime<Utc>),
    /// Reported unhealthy.
    Unhealthy,
    /// Automatically derived when the HealthyUntil deadline is reached.
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy.
    pub healthy: bool,
    /// Current status of each registered component, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

/// Handle held by one component to report its own status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Utc::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            // Poisoned lock: the probes will fail and the process restart.
            Err(_) => warn!("poisoned health registry lock"),
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

    /// Register a component; the returned handle is for it to report with.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall process status; usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned health registry lock");

        let mut status = HealthStatus {
            // Unhealthy until at least one component has registered.
            healthy: !components.is_empty(),
            components: HashMap::new(),
        };
        let now = Utc::now();

        for (name, component) in components.iter() {
            match component {
                ComponentStatus::HealthyUntil(until) if *until > now => {
                    status.components.insert(name.clone(), component.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    status
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                other => {
                    status.healthy = false;
                    status.components.insert(name.clone(), other.clone());
                }
            }
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_single_component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker", Duration::seconds(30));

        // Registered but not yet reporting.
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components.get("worker"), Some(&ComponentStatus::Starting));

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_stalled_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker", Duration::seconds(30));

        handle.report_status(ComponentStatus::HealthyUntil(Utc::now() - Duration::seconds(1)));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components.get("worker"), Some(&ComponentStatus::Stalled));
    }

    #[test]
    fn test_all_components_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let one = registry.register("dispatcher", Duration::seconds(30));
        let two = registry.register("fetcher", Duration::seconds(30));

        one.report_healthy();
        assert!(!registry.get_status().healthy);

        two.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn test_into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: HashMap::new(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
