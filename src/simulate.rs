//! Traffic simulation against a registered policy.
//!
//! Each simulated user runs as its own task, issuing requests with a random
//! pause between them, so several users hit the same limiter concurrently.

use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Limiter, LimiterRegistry, RateLimiter};

/// Behaviour of one simulated user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Key the user is limited under
    pub name: String,
    /// Requests to issue
    pub requests: u32,
    /// Shortest pause between requests, in milliseconds
    pub min_delay_ms: u64,
    /// Longest pause between requests, in milliseconds
    pub max_delay_ms: u64,
}

impl UserProfile {
    pub fn new(name: impl Into<String>, requests: u32, min_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            name: name.into(),
            requests,
            min_delay_ms,
            max_delay_ms: max_delay_ms.max(min_delay_ms),
        }
    }
}

/// A set of users to run against one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationPlan {
    pub policy: String,
    pub users: Vec<UserProfile>,
}

impl SimulationPlan {
    /// A moderate user, a fast but well-behaved user and a burst-heavy user.
    pub fn mixed_traffic(policy: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            users: vec![
                UserProfile::new("regular_user", 10, 200, 300),
                UserProfile::new("power_user", 10, 150, 250),
                UserProfile::new("suspicious_user", 15, 0, 100),
            ],
        }
    }
}

/// Outcome for one simulated user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReport {
    pub name: String,
    pub allowed: u32,
    pub blocked: u32,
}

impl UserReport {
    /// Share of requests admitted, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.allowed + self.blocked;
        if total == 0 {
            return 0.0;
        }
        f64::from(self.allowed) * 100.0 / f64::from(total)
    }
}

/// Outcome of a whole simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub policy: String,
    pub algorithm: String,
    pub elapsed_ms: u64,
    pub users: Vec<UserReport>,
}

impl SimulationReport {
    pub fn total_allowed(&self) -> u32 {
        self.users.iter().map(|u| u.allowed).sum()
    }

    pub fn total_blocked(&self) -> u32 {
        self.users.iter().map(|u| u.blocked).sum()
    }
}

/// Run every user in `plan` concurrently and collect their outcomes.
pub async fn run(registry: &LimiterRegistry, plan: &SimulationPlan) -> Result<SimulationReport> {
    let limiter = registry
        .get(&plan.policy)
        .ok_or_else(|| TurnstileError::UnknownPolicy(plan.policy.clone()))?;

    info!(
        policy = %plan.policy,
        algorithm = limiter.algorithm(),
        users = plan.users.len(),
        "Starting simulation"
    );

    let started = Instant::now();
    let tasks = plan
        .users
        .iter()
        .cloned()
        .map(|profile| tokio::spawn(simulate_user(Arc::clone(&limiter), profile)));

    let mut users = Vec::with_capacity(plan.users.len());
    for joined in join_all(tasks).await {
        users.push(joined?);
    }

    let report = SimulationReport {
        policy: plan.policy.clone(),
        algorithm: limiter.algorithm().to_string(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        users,
    };

    info!(
        allowed = report.total_allowed(),
        blocked = report.total_blocked(),
        elapsed_ms = report.elapsed_ms,
        "Simulation finished"
    );
    Ok(report)
}

async fn simulate_user(limiter: Arc<Limiter>, profile: UserProfile) -> UserReport {
    let mut report = UserReport {
        name: profile.name.clone(),
        allowed: 0,
        blocked: 0,
    };

    for i in 0..profile.requests {
        if limiter.admit(&profile.name) {
            report.allowed += 1;
            debug!(user = %profile.name, request = i + 1, "Request processed");
        } else {
            report.blocked += 1;
            debug!(user = %profile.name, request = i + 1, "Request blocked");
        }

        if i + 1 < profile.requests {
            let pause = rand::thread_rng().gen_range(profile.min_delay_ms..=profile.max_delay_ms);
            if pause > 0 {
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
        }
    }

    report
}
