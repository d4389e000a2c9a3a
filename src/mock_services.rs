// In-process stand-in for the users and rooms services, for tests and benchmarks

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::json;

use crate::dependency::{DependencyCallError, DependencyCaller, DependencyResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    Normal,
    // answers 503 to everything
    Outage,
    // connection refused
    Unreachable,
}

#[derive(Default)]
pub struct MockDirectory {
    users: Mutex<HashSet<i64>>,
    rooms: Mutex<HashMap<i64, String>>,
    modes: DashMap<String, ServiceMode>,
    calls: DashMap<String, usize>,
    delays: DashMap<String, Duration>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user_id: i64) {
        self.users.lock().insert(user_id);
    }

    pub fn add_room(&self, room_id: i64, status: &str) {
        self.rooms.lock().insert(room_id, status.to_string());
    }

    pub fn set_mode(&self, service: &str, mode: ServiceMode) {
        self.modes.insert(service.to_string(), mode);
    }

    // how long `service` takes before answering
    pub fn set_delay(&self, service: &str, delay: Duration) {
        self.delays.insert(service.to_string(), delay);
    }

    // requests that actually reached `service`
    pub fn calls(&self, service: &str) -> usize {
        self.calls.get(service).map(|c| *c).unwrap_or(0)
    }

    fn lookup(&self, service: &str, id: i64) -> Option<serde_json::Value> {
        match service {
            "users" => self
                .users
                .lock()
                .contains(&id)
                .then(|| json!({ "user_id": id })),
            "rooms" => self
                .rooms
                .lock()
                .get(&id)
                .map(|status| json!({ "room_id": id, "room_status": status })),
            _ => None,
        }
    }
}

#[async_trait]
impl DependencyCaller for MockDirectory {
    async fn invoke(
        &self,
        service: &str,
        _method: Method,
        target: &str,
        _timeout: Duration,
    ) -> Result<DependencyResponse, DependencyCallError> {
        *self.calls.entry(service.to_string()).or_insert(0) += 1;

        let delay = self.delays.get(service).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mode = self
            .modes
            .get(service)
            .map(|m| *m)
            .unwrap_or(ServiceMode::Normal);
        match mode {
            ServiceMode::Unreachable => {
                return Err(DependencyCallError::Network(format!(
                    "connection refused: {service}"
                )))
            }
            ServiceMode::Outage => {
                return Ok(DependencyResponse {
                    status: 503,
                    body: Bytes::from_static(b"service unavailable"),
                })
            }
            ServiceMode::Normal => {}
        }

        let found = target
            .rsplit('/')
            .next()
            .and_then(|segment| segment.parse::<i64>().ok())
            .and_then(|id| self.lookup(service, id));

        Ok(match found {
            Some(body) => DependencyResponse {
                status: 200,
                body: Bytes::from(body.to_string()),
            },
            None => DependencyResponse {
                status: 404,
                body: Bytes::from_static(b"{\"error\": \"not found\"}"),
            },
        })
    }
}
