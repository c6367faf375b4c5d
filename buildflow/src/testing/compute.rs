//! An in-memory compute backend and a switchable liveness probe.

use crate::environment::{
    BackendError, ComputeBackend, LivenessProbe, Pod, ResourceRequest, Route, Service,
    ServicePort, RUNNING_PHASE, SSH_PORT_NAME,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct BackendState {
    pods: HashMap<String, VecDeque<String>>,
    services: HashMap<String, Service>,
    routes: HashMap<String, Route>,
    scripted_phases: Option<VecDeque<String>>,
    every_pod_phases: Option<VecDeque<String>>,
    failing_pod_creations: u32,
    pods_created: usize,
    routes_created: usize,
    next_ip: u32,
    events: Vec<String>,
    requests: Vec<ResourceRequest>,
}

impl BackendState {
    fn assign_ip(&mut self) -> String {
        self.next_ip += 1;
        format!("10.0.0.{}", self.next_ip)
    }
}

/// A compute backend that keeps resources in maps.
///
/// Pods report `Running` unless phases were scripted for them with
/// [`script_pod_phases`](Self::script_pod_phases). Services receive an
/// address immediately.
#[derive(Debug, Default)]
pub struct InMemoryComputeBackend {
    state: Mutex<BackendState>,
}

impl InMemoryComputeBackend {
    /// Node port assigned to every SSH service.
    pub const SSH_NODE_PORT: u16 = 30022;

    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next created pod reports these phases, one per status read.
    /// The last phase sticks.
    pub fn script_pod_phases(&self, phases: &[&str]) {
        self.state.lock().scripted_phases =
            Some(phases.iter().map(|phase| (*phase).to_string()).collect());
    }

    /// Every pod created from now on reports these phases, unless a one-off
    /// script from [`script_pod_phases`](Self::script_pod_phases) is pending.
    pub fn script_every_pod_phases(&self, phases: &[&str]) {
        self.state.lock().every_pod_phases =
            Some(phases.iter().map(|phase| (*phase).to_string()).collect());
    }

    /// Makes the next `count` pod creations fail.
    pub fn fail_next_pod_creations(&self, count: u32) {
        self.state.lock().failing_pod_creations = count;
    }

    /// Pods created successfully so far.
    #[must_use]
    pub fn pods_created(&self) -> usize {
        self.state.lock().pods_created
    }

    /// Routes created so far.
    #[must_use]
    pub fn routes_created(&self) -> usize {
        self.state.lock().routes_created
    }

    /// Pods, services and routes that currently exist.
    #[must_use]
    pub fn live_resources(&self) -> usize {
        let state = self.state.lock();
        state.pods.len() + state.services.len() + state.routes.len()
    }

    /// Every create and delete, in order, e.g. `create pod NAME`.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    /// Every pod creation request, failed ones included.
    #[must_use]
    pub fn requests(&self) -> Vec<ResourceRequest> {
        self.state.lock().requests.clone()
    }
}

#[async_trait]
impl ComputeBackend for InMemoryComputeBackend {
    async fn create_pod(&self, request: &ResourceRequest) -> Result<Pod, BackendError> {
        let mut state = self.state.lock();
        let name = request.names.pod.clone();
        state.requests.push(request.clone());
        if state.failing_pod_creations > 0 {
            state.failing_pod_creations -= 1;
            state.events.push(format!("fail pod {name}"));
            return Err(BackendError::Other(format!("quota exceeded creating {name}")));
        }
        let phases = state
            .scripted_phases
            .take()
            .or_else(|| state.every_pod_phases.clone())
            .unwrap_or_default();
        let phase = phases
            .front()
            .cloned()
            .unwrap_or_else(|| RUNNING_PHASE.to_string());
        state.pods.insert(name.clone(), phases);
        state.pods_created += 1;
        state.events.push(format!("create pod {name}"));
        Ok(Pod { name, phase })
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, BackendError> {
        let mut state = self.state.lock();
        let phases = state
            .pods
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        let phase = if phases.len() > 1 {
            phases.pop_front()
        } else {
            phases.front().cloned()
        }
        .unwrap_or_else(|| RUNNING_PHASE.to_string());
        Ok(Pod {
            name: name.to_string(),
            phase,
        })
    }

    async fn delete_pod(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state
            .pods
            .remove(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        state.events.push(format!("delete pod {name}"));
        Ok(())
    }

    async fn create_service(&self, request: &ResourceRequest) -> Result<Service, BackendError> {
        let mut state = self.state.lock();
        let service = Service {
            name: request.names.service.clone(),
            cluster_ip: Some(state.assign_ip()),
            ports: vec![ServicePort {
                name: "http".to_string(),
                node_port: None,
            }],
        };
        state.services.insert(service.name.clone(), service.clone());
        state.events.push(format!("create service {}", service.name));
        Ok(service)
    }

    async fn create_ssh_service(&self, request: &ResourceRequest) -> Result<Service, BackendError> {
        let mut state = self.state.lock();
        let service = Service {
            name: request.names.ssh_service.clone(),
            cluster_ip: Some(state.assign_ip()),
            ports: vec![ServicePort {
                name: SSH_PORT_NAME.to_string(),
                node_port: Some(Self::SSH_NODE_PORT),
            }],
        };
        state.services.insert(service.name.clone(), service.clone());
        state.events.push(format!("create service {}", service.name));
        Ok(service)
    }

    async fn get_service(&self, name: &str) -> Result<Service, BackendError> {
        self.state
            .lock()
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    async fn delete_service(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state
            .services
            .remove(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        state.events.push(format!("delete service {name}"));
        Ok(())
    }

    async fn create_route(&self, request: &ResourceRequest) -> Result<Route, BackendError> {
        let mut state = self.state.lock();
        let route = Route {
            name: request.names.route.clone(),
            host: format!("{}.apps.example.com", request.names.route),
            path: format!("/{}", request.names.context_path),
        };
        state.routes.insert(route.name.clone(), route.clone());
        state.routes_created += 1;
        state.events.push(format!("create route {}", route.name));
        Ok(route)
    }

    async fn get_route(&self, name: &str) -> Result<Route, BackendError> {
        self.state
            .lock()
            .routes
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    async fn delete_route(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state
            .routes
            .remove(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        state.events.push(format!("delete route {name}"));
        Ok(())
    }
}

/// A liveness probe whose answer is set by the test.
#[derive(Debug, Default)]
pub struct StaticLivenessProbe {
    alive: AtomicBool,
}

impl StaticLivenessProbe {
    /// Creates a probe answering `alive`.
    #[must_use]
    pub fn new(alive: bool) -> Self {
        Self {
            alive: AtomicBool::new(alive),
        }
    }

    /// Changes the answer.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

#[async_trait]
impl LivenessProbe for StaticLivenessProbe {
    async fn is_alive(&self, _url: &str) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
