// Startup configuration, resolved once through a pluggable provider and injected into components

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::rate_limiter::RouteClass;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Config parse error: {0}")]
    Parse(String),
}

// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl CircuitConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_secs: u64,
}

impl RateLimitRule {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window_secs: window.as_secs(),
        }
    }

    pub fn per_hour(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(3600))
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl fmt::Display for RateLimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.limit, self.window_secs)
    }
}

// Accepts "50/hour", "10 per minute", "200/day", "5/second"
impl FromStr for RateLimitRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (count, unit) = s
            .split_once('/')
            .or_else(|| s.split_once(" per "))
            .ok_or_else(|| "expected <count>/<unit> or <count> per <unit>".to_string())?;

        let limit = count
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("bad count: {e}"))?;

        let window_secs = match unit.trim().to_ascii_lowercase().as_str() {
            "second" | "sec" | "s" => 1,
            "minute" | "min" | "m" => 60,
            "hour" | "h" => 3600,
            "day" | "d" => 86_400,
            other => return Err(format!("unknown unit {other:?}")),
        };

        Ok(Self { limit, window_secs })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub default: RateLimitRule,
    pub routes: HashMap<String, RateLimitRule>,
}

impl RateLimitConfig {
    pub fn rule_for(&self, route: &RouteClass) -> RateLimitRule {
        self.routes
            .get(route.as_str())
            .copied()
            .unwrap_or(self.default)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let routes = [
            (RouteClass::CREATE_BOOKING, 50),
            (RouteClass::UPDATE_BOOKING, 50),
            (RouteClass::CANCEL_BOOKING, 50),
            (RouteClass::LIST_BOOKINGS, 100),
            (RouteClass::CHECK_AVAILABILITY, 100),
        ]
        .into_iter()
        .map(|(route, limit)| (route.as_str().to_string(), RateLimitRule::per_hour(limit)))
        .collect();

        Self {
            default: RateLimitRule::per_hour(50),
            routes,
        }
    }
}

// `{id}` in a path template is replaced by the identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEndpoints {
    pub users_url: String,
    pub rooms_url: String,
    pub user_path: String,
    pub room_path: String,
}

impl Default for DependencyEndpoints {
    fn default() -> Self {
        Self {
            users_url: "http://users:5000".to_string(),
            rooms_url: "http://rooms:5001".to_string(),
            user_path: "/api/users/{id}".to_string(),
            room_path: "/api/rooms/{id}".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub circuit: CircuitConfig,
    pub dependency_timeout_ms: u64,
    pub dependencies: DependencyEndpoints,
    pub rate_limits: RateLimitConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            circuit: CircuitConfig::default(),
            dependency_timeout_ms: 5000,
            dependencies: DependencyEndpoints::default(),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_timeout_ms)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    // Rejects values that would switch a protection off. Keys are reported by their env names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit.failure_threshold == 0 {
            return Err(invalid("CIRCUIT_FAILURE_THRESHOLD", "0", "must be at least 1"));
        }
        if self.dependency_timeout_ms == 0 {
            return Err(invalid("DEPENDENCY_TIMEOUT_MS", "0", "must be at least 1"));
        }

        check_rule("RATE_LIMIT_DEFAULT", &self.rate_limits.default)?;
        let mut routes: Vec<_> = self.rate_limits.routes.iter().collect();
        routes.sort_by(|a, b| a.0.cmp(b.0));
        for (route, rule) in routes {
            check_rule(&route_key(route), rule)?;
        }
        Ok(())
    }

    // defaults overridden by whatever `provider` knows
    pub fn resolve(provider: &dyn ConfigProvider) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parsed::<u32>(provider, "CIRCUIT_FAILURE_THRESHOLD")? {
            config.circuit.failure_threshold = v;
        }
        if let Some(v) = parsed::<u64>(provider, "CIRCUIT_RECOVERY_TIMEOUT_SECS")? {
            config.circuit.recovery_timeout_secs = v;
        }
        if let Some(v) = parsed::<u64>(provider, "DEPENDENCY_TIMEOUT_MS")? {
            config.dependency_timeout_ms = v;
        }
        if let Some(v) = provider.get("USERS_SERVICE_URL") {
            config.dependencies.users_url = v;
        }
        if let Some(v) = provider.get("ROOMS_SERVICE_URL") {
            config.dependencies.rooms_url = v;
        }

        if let Some(rule) = parsed_rule(provider, "RATE_LIMIT_DEFAULT")? {
            config.rate_limits.default = rule;
        }
        let routes: Vec<String> = config.rate_limits.routes.keys().cloned().collect();
        for route in routes {
            if let Some(rule) = parsed_rule(provider, &route_key(&route))? {
                config.rate_limits.routes.insert(route, rule);
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn route_key(route: &str) -> String {
    format!("RATE_LIMIT_{}", route.replace('-', "_").to_ascii_uppercase())
}

fn check_rule(key: &str, rule: &RateLimitRule) -> Result<(), ConfigError> {
    if rule.limit == 0 {
        return Err(invalid(key, &rule.to_string(), "limit must be at least 1"));
    }
    if rule.window_secs == 0 {
        return Err(invalid(key, &rule.to_string(), "window must be at least one second"));
    }
    Ok(())
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parsed<T>(provider: &dyn ConfigProvider, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    provider
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| invalid(key, &raw, e.to_string()))
        })
        .transpose()
}

fn parsed_rule(provider: &dyn ConfigProvider, key: &str) -> Result<Option<RateLimitRule>, ConfigError> {
    provider
        .get(key)
        .map(|raw| {
            raw.parse::<RateLimitRule>()
                .map_err(|reason| invalid(key, &raw, reason))
        })
        .transpose()
}

// Config providers

pub trait ConfigProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EnvProvider;

impl ConfigProvider for EnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

type SecretFetch = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

// Read-through cache; JSON secrets are unwrapped to the field named like the key, else the first field
pub struct SecretStoreProvider {
    fetch: SecretFetch,
    cache: DashMap<String, String>,
}

impl SecretStoreProvider {
    pub fn new(fetch: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            fetch: Box::new(fetch),
            cache: DashMap::new(),
        }
    }

    pub fn from_map(secrets: HashMap<String, String>) -> Self {
        Self::new(move |key| secrets.get(key).cloned())
    }

    fn unwrap_secret(key: &str, raw: String) -> String {
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => {
                let field = map.get(key).or_else(|| map.values().next());
                match field {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => raw,
                }
            }
            _ => raw,
        }
    }
}

impl ConfigProvider for SecretStoreProvider {
    fn get(&self, key: &str) -> Option<String> {
        if let Some(hit) = self.cache.get(key) {
            return Some(hit.value().clone());
        }

        let value = Self::unwrap_secret(key, (self.fetch)(key)?);
        self.cache.insert(key.to_string(), value.clone());
        Some(value)
    }
}

// First provider that knows the key wins
#[derive(Default)]
pub struct LayeredProvider {
    layers: Vec<Box<dyn ConfigProvider>>,
}

impl LayeredProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl ConfigProvider + 'static) -> Self {
        self.layers.push(Box::new(provider));
        self
    }
}

impl ConfigProvider for LayeredProvider {
    fn get(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }
}

impl ConfigProvider for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_match_service_quotas() {
        let config = ServiceConfig::resolve(&HashMap::<String, String>::new()).unwrap();

        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.circuit.recovery_timeout(), Duration::from_secs(60));
        assert_eq!(config.dependency_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.rate_limits.rule_for(&RouteClass::CREATE_BOOKING),
            RateLimitRule::per_hour(50)
        );
        assert_eq!(
            config.rate_limits.rule_for(&RouteClass::LIST_BOOKINGS),
            RateLimitRule::per_hour(100)
        );
        assert_eq!(
            config.rate_limits.rule_for(&RouteClass::new("unlisted")),
            RateLimitRule::per_hour(50)
        );
    }

    #[test]
    fn test_rate_expressions() {
        assert_eq!("50/hour".parse::<RateLimitRule>().unwrap(), RateLimitRule::per_hour(50));
        assert_eq!(
            "10 per minute".parse::<RateLimitRule>().unwrap(),
            RateLimitRule::new(10, Duration::from_secs(60))
        );
        assert_eq!("200/day".parse::<RateLimitRule>().unwrap().window_secs, 86_400);
        assert!("ten/hour".parse::<RateLimitRule>().is_err());
        assert!("10/fortnight".parse::<RateLimitRule>().is_err());
    }

    #[test]
    fn test_resolve_overrides_and_rejects_garbage() {
        let provider = map(&[
            ("CIRCUIT_FAILURE_THRESHOLD", "3"),
            ("RATE_LIMIT_CREATE_BOOKING", "5/minute"),
            ("ROOMS_SERVICE_URL", "http://localhost:9000"),
        ]);
        let config = ServiceConfig::resolve(&provider).unwrap();
        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(
            config.rate_limits.rule_for(&RouteClass::CREATE_BOOKING),
            RateLimitRule::new(5, Duration::from_secs(60))
        );
        assert_eq!(config.dependencies.rooms_url, "http://localhost:9000");

        let bad = map(&[("DEPENDENCY_TIMEOUT_MS", "soon")]);
        let err = ServiceConfig::resolve(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "DEPENDENCY_TIMEOUT_MS"));

        let zero = map(&[("RATE_LIMIT_DEFAULT", "0/hour")]);
        assert!(ServiceConfig::resolve(&zero).is_err());
    }

    #[test]
    fn test_layered_provider_first_hit_wins_and_secrets_are_cached() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();
        let secrets = SecretStoreProvider::new(move |key| {
            counter.fetch_add(1, Ordering::SeqCst);
            match key {
                "ROOMS_SERVICE_URL" => Some(r#"{"ROOMS_SERVICE_URL": "http://vault-rooms"}"#.to_string()),
                "USERS_SERVICE_URL" => Some("http://vault-users".to_string()),
                _ => None,
            }
        });

        let provider = LayeredProvider::new()
            .with(map(&[("USERS_SERVICE_URL", "http://env-users")]))
            .with(secrets);

        assert_eq!(provider.get("USERS_SERVICE_URL").as_deref(), Some("http://env-users"));
        assert_eq!(provider.get("ROOMS_SERVICE_URL").as_deref(), Some("http://vault-rooms"));
        assert_eq!(provider.get("ROOMS_SERVICE_URL").as_deref(), Some("http://vault-rooms"));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_json_round_trip_of_full_config() {
        let json = serde_json::to_string(&ServiceConfig::default()).unwrap();
        assert_eq!(ServiceConfig::from_json_str(&json).unwrap(), ServiceConfig::default());
        assert!(ServiceConfig::from_json_str("{").is_err());
    }

    #[test]
    fn test_json_config_is_validated_like_resolved_config() {
        fn invalid_key(mutate: impl FnOnce(&mut ServiceConfig)) -> String {
            let mut config = ServiceConfig::default();
            mutate(&mut config);
            let json = serde_json::to_string(&config).unwrap();
            match ServiceConfig::from_json_str(&json).unwrap_err() {
                ConfigError::Invalid { key, .. } => key,
                other => panic!("unexpected {other:?}"),
            }
        }

        assert_eq!(
            invalid_key(|c| c.circuit.failure_threshold = 0),
            "CIRCUIT_FAILURE_THRESHOLD"
        );
        assert_eq!(invalid_key(|c| c.rate_limits.default.limit = 0), "RATE_LIMIT_DEFAULT");
        assert_eq!(
            invalid_key(|c| {
                c.rate_limits
                    .routes
                    .insert("list-bookings".to_string(), RateLimitRule { limit: 100, window_secs: 0 });
            }),
            "RATE_LIMIT_LIST_BOOKINGS"
        );

        let threshold = map(&[("CIRCUIT_FAILURE_THRESHOLD", "0")]);
        assert!(matches!(
            ServiceConfig::resolve(&threshold),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
