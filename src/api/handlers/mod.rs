pub mod health;
pub mod metrics;
pub mod policies;
pub mod services;
pub mod sidecars;
