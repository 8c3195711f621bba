mod model;

pub use model::{
    policy_key, CircuitBreaker, HealthCheck, LbAlgorithm, LoadBalancingPolicy, RetryPolicy,
    TrafficPolicy, MAX_RETRY_ATTEMPTS,
};
