pub mod audit;
pub mod authn;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod scope;
pub mod session;
