//! Named admission policies.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::clock::Clock;
use super::limiter::{Limiter, RateLimiter};
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};

/// Limiters indexed by policy name.
///
/// Callers pick a policy per request (for example by customer tier) and ask
/// the registry for a decision. Each policy owns its own per-key state.
#[derive(Default)]
pub struct LimiterRegistry {
    limiters: RwLock<BTreeMap<String, Arc<Limiter>>>,
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one limiter per configured policy.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Same as [`from_config`](Self::from_config), with every limiter reading `clock`.
    pub fn from_config_with_clock(config: &TurnstileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::build(config, Some(clock))
    }

    fn build(config: &TurnstileConfig, clock: Option<Arc<dyn Clock>>) -> Result<Self> {
        config.validate()?;

        let mut limiters = BTreeMap::new();
        for (name, policy) in &config.policies {
            let mut limiter = Limiter::from_policy(policy, config.shards)?;
            if let Some(clock) = &clock {
                limiter = limiter.with_clock(Arc::clone(clock));
            }
            info!(policy = %name, algorithm = limiter.algorithm(), "Policy registered");
            limiters.insert(name.clone(), Arc::new(limiter));
        }

        Ok(Self {
            limiters: RwLock::new(limiters),
        })
    }

    /// Register `limiter` under `name`, returning any limiter it replaces.
    ///
    /// The replaced limiter's per-key state is not carried over.
    pub fn insert(&self, name: impl Into<String>, limiter: Limiter) -> Option<Arc<Limiter>> {
        let name = name.into();
        info!(policy = %name, algorithm = limiter.algorithm(), "Policy registered");
        self.limiters.write().insert(name, Arc::new(limiter))
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<Arc<Limiter>> {
        self.limiters.read().get(name).cloned()
    }

    /// Registered policy names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.limiters.read().keys().cloned().collect()
    }

    /// Snapshot of every registered limiter.
    pub fn limiters(&self) -> Vec<(String, Arc<Limiter>)> {
        self.limiters
            .read()
            .iter()
            .map(|(name, limiter)| (name.clone(), Arc::clone(limiter)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.limiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.read().is_empty()
    }

    /// Decide whether a request from `key` may proceed under `policy`.
    ///
    /// Only an unknown policy name is an error; the decision itself never fails.
    pub fn admit(&self, policy: &str, key: &str) -> Result<bool> {
        let limiter = self.get(policy).ok_or_else(|| {
            debug!(policy = %policy, "Unknown policy requested");
            TurnstileError::UnknownPolicy(policy.to_string())
        })?;
        Ok(limiter.admit(key))
    }
}
