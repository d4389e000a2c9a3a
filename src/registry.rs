// Process-local registry of circuits and rate windows, built once at startup and shared by handlers

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitTransition},
    clock::{Clock, SystemClock},
    config::ServiceConfig,
    rate_limiter::{RateDecision, RateKey, RateLimitExceeded, RateLimiter},
};

const TRANSITION_BUFFER: usize = 64;

pub struct ResilienceRegistry {
    config: ServiceConfig,
    clock: Arc<dyn Clock>,
    circuits: DashMap<String, Arc<CircuitBreaker>>,
    rate_limiter: RateLimiter,
    transitions: broadcast::Sender<CircuitTransition>,
}

impl ResilienceRegistry {
    pub fn new(config: ServiceConfig, clock: Arc<dyn Clock>) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            rate_limiter: RateLimiter::new(config.rate_limits.clone(), clock.clone()),
            circuits: DashMap::new(),
            config,
            clock,
            transitions,
        }
    }

    pub fn with_system_clock(config: ServiceConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // created closed on first use
    pub fn circuit(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.circuits.get(name) {
            return existing.clone();
        }
        self.circuits
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(name, self.config.circuit, self.clock.clone())
                        .with_transitions(self.transitions.clone()),
                )
            })
            .clone()
    }

    pub fn circuit_status(&self, name: &str) -> Option<CircuitSnapshot> {
        self.circuits.get(name).map(|c| c.snapshot())
    }

    pub fn circuit_statuses(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<_> = self.circuits.iter().map(|c| c.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn reset_circuit(&self, name: &str) -> bool {
        match self.circuits.get(name) {
            Some(circuit) => {
                circuit.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_circuits(&self) -> usize {
        let mut reset = 0;
        for circuit in self.circuits.iter() {
            circuit.reset();
            reset += 1;
        }
        reset
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<CircuitTransition> {
        self.transitions.subscribe()
    }

    pub fn check_rate(&self, key: &RateKey) -> Result<RateDecision, RateLimitExceeded> {
        self.rate_limiter.check(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{circuit_breaker::CircuitState, clock::ManualClock};
    use std::time::Duration;

    fn registry() -> ResilienceRegistry {
        ResilienceRegistry::new(ServiceConfig::default(), Arc::new(ManualClock::new()))
    }

    #[tokio::test]
    async fn test_one_circuit_per_name_and_failures_stay_isolated() {
        let registry = registry();
        let rooms = registry.circuit("rooms");
        assert!(Arc::ptr_eq(&rooms, &registry.circuit("rooms")));

        for _ in 0..5 {
            let _ = rooms
                .call(Duration::from_secs(1), || async { Err::<(), _>("down") })
                .await;
        }

        assert_eq!(registry.circuit("rooms").state(), CircuitState::Open);
        assert_eq!(registry.circuit("users").state(), CircuitState::Closed);

        let statuses = registry.circuit_statuses();
        let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["rooms", "users"]);
        assert_eq!(statuses[0].consecutive_failures, 5);
    }

    #[tokio::test]
    async fn test_reset_and_transition_feed() {
        let registry = registry();
        let mut feed = registry.subscribe_transitions();
        let users = registry.circuit("users");

        for _ in 0..5 {
            let _ = users
                .call(Duration::from_secs(1), || async { Err::<(), _>("down") })
                .await;
        }
        let opened = feed.recv().await.unwrap();
        assert_eq!(opened.name, "users");
        assert_eq!(opened.to, CircuitState::Open);

        assert!(registry.reset_circuit("users"));
        assert!(!registry.reset_circuit("billing"));
        assert_eq!(feed.recv().await.unwrap().to, CircuitState::Closed);
        assert_eq!(registry.reset_circuits(), 1);
        assert_eq!(
            registry.circuit_status("users").map(|s| s.state),
            Some(CircuitState::Closed)
        );
    }
}
