// Outbound calls to the users and rooms services, and the existence checks built on them

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    booking::{RoomId, UserId},
    circuit_breaker::CallError,
    config::DependencyEndpoints,
    error::BookingError,
    registry::ResilienceRegistry,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DependencyCallError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Upstream returned {0}")]
    Status(u16),

    #[error("No endpoint configured for service {0}")]
    UnknownService(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencyResponse {
    pub status: u16,
    pub body: Bytes,
}

impl DependencyResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait DependencyCaller: Send + Sync + 'static {
    async fn invoke(
        &self,
        service: &str,
        method: Method,
        target: &str,
        timeout: Duration,
    ) -> Result<DependencyResponse, DependencyCallError>;
}

pub struct HttpDependencyCaller {
    client: reqwest::Client,
    base_urls: HashMap<String, String>,
}

impl HttpDependencyCaller {
    pub fn new(endpoints: &DependencyEndpoints) -> Result<Self, DependencyCallError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| DependencyCallError::Network(e.to_string()))?;

        let base_urls = HashMap::from([
            (Dependency::Users.service_name().to_string(), endpoints.users_url.clone()),
            (Dependency::Rooms.service_name().to_string(), endpoints.rooms_url.clone()),
        ]);

        Ok(Self { client, base_urls })
    }
}

#[async_trait]
impl DependencyCaller for HttpDependencyCaller {
    async fn invoke(
        &self,
        service: &str,
        method: Method,
        target: &str,
        timeout: Duration,
    ) -> Result<DependencyResponse, DependencyCallError> {
        let base = self
            .base_urls
            .get(service)
            .ok_or_else(|| DependencyCallError::UnknownService(service.to_string()))?;
        let url = format!("{}{}", base.trim_end_matches('/'), target);

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                DependencyCallError::Timeout(timeout)
            } else {
                DependencyCallError::Network(e.to_string())
            }
        };

        let response = self
            .client
            .request(method, url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_err)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_err)?;

        Ok(DependencyResponse { status, body })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    Users,
    Rooms,
}

impl Dependency {
    pub fn service_name(self) -> &'static str {
        match self {
            Dependency::Users => "users",
            Dependency::Rooms => "rooms",
        }
    }

    fn resource(self) -> &'static str {
        match self {
            Dependency::Users => "User",
            Dependency::Rooms => "Room",
        }
    }

    fn target(self, endpoints: &DependencyEndpoints, id: i64) -> String {
        let template = match self {
            Dependency::Users => &endpoints.user_path,
            Dependency::Rooms => &endpoints.room_path,
        };
        template.replace("{id}", &id.to_string())
    }

    // A room must also be open for booking; anything that isn't JSON is taken at face value
    fn accepts(self, body: &[u8]) -> bool {
        if self != Dependency::Rooms {
            return true;
        }
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(room)) => match room.get("room_status") {
                Some(Value::String(status)) => status == "Available",
                _ => true,
            },
            _ => true,
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}

// Identifiers confirmed once are still accepted while their circuit is open
pub struct ReferenceValidator {
    caller: Arc<dyn DependencyCaller>,
    registry: Arc<ResilienceRegistry>,
    known: DashSet<(Dependency, i64)>,
}

impl ReferenceValidator {
    pub fn new(caller: Arc<dyn DependencyCaller>, registry: Arc<ResilienceRegistry>) -> Self {
        Self {
            caller,
            registry,
            known: DashSet::new(),
        }
    }

    pub async fn ensure_user(&self, user_id: UserId) -> Result<(), BookingError> {
        self.ensure(Dependency::Users, user_id).await
    }

    pub async fn ensure_room(&self, room_id: RoomId) -> Result<(), BookingError> {
        self.ensure(Dependency::Rooms, room_id).await
    }

    pub fn is_known(&self, dependency: Dependency, id: i64) -> bool {
        self.known.contains(&(dependency, id))
    }

    async fn ensure(&self, dependency: Dependency, id: i64) -> Result<(), BookingError> {
        if self.exists(dependency, id).await? {
            Ok(())
        } else {
            Err(BookingError::UnknownReference {
                resource: dependency.resource(),
                id,
            })
        }
    }

    pub async fn exists(&self, dependency: Dependency, id: i64) -> Result<bool, BookingError> {
        let service = dependency.service_name();
        let circuit = self.registry.circuit(service);
        let timeout = self.registry.config().dependency_timeout();
        let target = dependency.target(&self.registry.config().dependencies, id);

        let outcome = circuit
            .call(timeout, || async {
                let response = self
                    .caller
                    .invoke(service, Method::GET, &target, timeout)
                    .await?;
                // only server-side trouble counts against the circuit
                if response.status >= 500 {
                    return Err(DependencyCallError::Status(response.status));
                }
                Ok(response)
            })
            .await;

        match outcome {
            Ok(response) if response.is_success() => {
                let accepted = dependency.accepts(&response.body);
                if accepted {
                    self.known.insert((dependency, id));
                } else {
                    self.known.remove(&(dependency, id));
                }
                Ok(accepted)
            }
            Ok(response) => {
                if response.status != 404 {
                    warn!(service, id, status = response.status, "unexpected status on existence check");
                }
                self.known.remove(&(dependency, id));
                Ok(false)
            }
            Err(CallError::Open(open)) => {
                if self.is_known(dependency, id) {
                    debug!(service, id, "circuit open, accepting cached identifier");
                    return Ok(true);
                }
                warn!(service, id, state = %open.state, "circuit open and identifier not cached");
                Err(BookingError::DependencyUnavailable {
                    service: service.to_string(),
                    state: open.state,
                    retry_after: open.retry_after,
                })
            }
            Err(e) => {
                warn!(service, id, error = %e, "existence check failed");
                Err(BookingError::DependencyUnavailable {
                    service: service.to_string(),
                    state: circuit.state(),
                    retry_after: None,
                })
            }
        }
    }
}
