pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod namespace;
pub mod rate_limit;
pub mod routes;
pub mod subscriptions;

use std::sync::Arc;

use auth::Authenticator;
use config::Config;
use gateway::hub::Gateway;
use metrics::{GatewayCounters, MetricsCollector, SystemProbe};
use namespace::NamespaceRegistry;
use rate_limit::store::RateLimitStore;
use rate_limit::RateLimiter;
use subscriptions::SubscriptionRegistry;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub namespaces: Arc<NamespaceRegistry>,
    pub authenticator: Arc<Authenticator>,
    pub limiter: Arc<RateLimiter>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub gateway: Arc<Gateway>,
    pub metrics: Arc<MetricsCollector>,
}

impl AppState {
    /// Wire the built-in namespaces, registries and collector together.
    pub fn new(config: Config, store: Arc<dyn RateLimitStore>) -> Self {
        Self::assemble(config, store, NamespaceRegistry::builtin(), |gateway| gateway)
    }

    /// Like [`AppState::new`] with a custom namespace set; `customize` may
    /// register extra handlers before the gateway is shared.
    pub fn assemble(
        config: Config,
        store: Arc<dyn RateLimitStore>,
        namespaces: NamespaceRegistry,
        customize: impl FnOnce(Gateway) -> Gateway,
    ) -> Self {
        let namespaces = Arc::new(namespaces);
        let counters = Arc::new(GatewayCounters::for_registry(&namespaces));
        let authenticator = Arc::new(Authenticator::new(
            &config.jwt_secret,
            Arc::clone(&namespaces),
        ));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            store,
            Arc::clone(&namespaces),
        ));
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let gateway = Arc::new(customize(Gateway::new(
            config.gateway.clone(),
            Arc::clone(&namespaces),
            Arc::clone(&authenticator),
            Arc::clone(&limiter),
            Arc::clone(&subscriptions),
            Arc::clone(&counters),
        )));
        let metrics = Arc::new(MetricsCollector::new(
            config.metrics.clone(),
            counters,
            Arc::clone(&limiter),
            Arc::clone(&subscriptions),
            Box::new(SystemProbe::new()),
        ));

        Self {
            config: Arc::new(config),
            namespaces,
            authenticator,
            limiter,
            subscriptions,
            gateway,
            metrics,
        }
    }
}
