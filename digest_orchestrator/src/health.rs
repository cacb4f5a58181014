//! Per-agent circuit breakers and call metrics.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::settings::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Coarse label derived from the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Error,
    Offline,
}

impl HealthLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            HealthLevel::Healthy
        } else if score >= 70.0 {
            HealthLevel::Warning
        } else if score >= 50.0 {
            HealthLevel::Error
        } else {
            HealthLevel::Offline
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Returned when the breaker short-circuits a call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit open for agent '{agent_id}'")]
pub struct CircuitOpen {
    pub agent_id: String,
}

/// Point-in-time view of one agent's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub agent_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_transition_time: DateTime<Utc>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub average_latency_ms: f64,
    pub last_error: Option<String>,
    pub health_score: f64,
    pub status: HealthLevel,
    pub transitions: Vec<Transition>,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_transition_time: DateTime<Utc>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    average_latency_ms: f64,
    last_error: Option<String>,
    last_failure_at: Option<DateTime<Utc>>,
    transitions: VecDeque<Transition>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            last_transition_time: Utc::now(),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            average_latency_ms: 0.0,
            last_error: None,
            last_failure_at: None,
            transitions: VecDeque::new(),
        }
    }

    fn transition(&mut self, agent_id: &str, to: CircuitState, history_len: usize) {
        if self.state == to {
            return;
        }
        let now = Utc::now();
        info!("Agent {} circuit {:?} -> {:?}", agent_id, self.state, to);
        self.transitions.push_back(Transition {
            from: self.state,
            to,
            at: now,
        });
        while self.transitions.len() > history_len {
            self.transitions.pop_front();
        }
        self.state = to;
        self.last_transition_time = now;
        self.opened_at = match to {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };
        if to != CircuitState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    fn observe_latency(&mut self, latency: Duration) {
        self.total_calls += 1;
        let sample = latency.as_secs_f64() * 1000.0;
        // Running mean over all calls.
        self.average_latency_ms += (sample - self.average_latency_ms) / self.total_calls as f64;
    }

    fn score(&self, slow_call_ms: u64) -> f64 {
        let mut score = if self.total_calls == 0 {
            100.0
        } else {
            self.successful_calls as f64 / self.total_calls as f64 * 100.0
        };
        if let Some(at) = self.last_failure_at {
            if Utc::now() - at < chrono::Duration::hours(1) {
                score -= 20.0;
            }
        }
        if self.average_latency_ms > slow_call_ms as f64 {
            score -= 10.0;
        }
        score.clamp(0.0, 100.0)
    }

    fn snapshot(&self, agent_id: &str, slow_call_ms: u64) -> HealthSnapshot {
        let health_score = self.score(slow_call_ms);
        HealthSnapshot {
            agent_id: agent_id.to_string(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_transition_time: self.last_transition_time,
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.failed_calls,
            average_latency_ms: self.average_latency_ms,
            last_error: self.last_error.clone(),
            health_score,
            status: HealthLevel::from_score(health_score),
            transitions: self.transitions.iter().cloned().collect(),
        }
    }
}

/// Process-wide breaker registry. Every update to one agent's breaker happens
/// under that agent's mutex; different agents never contend.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    agents: DashMap<String, Arc<Mutex<Breaker>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            agents: DashMap::new(),
        }
    }

    fn breaker(&self, agent_id: &str) -> Arc<Mutex<Breaker>> {
        self.agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Breaker::new())))
            .clone()
    }

    /// Ask to call `agent_id`. Closed always admits; Open admits nothing until
    /// the cool-down has elapsed, then exactly one HalfOpen trial at a time.
    pub fn acquire(&self, agent_id: &str) -> Result<CallPermit, CircuitOpen> {
        let breaker = self.breaker(agent_id);
        let trial = {
            let mut guard = breaker.lock();
            match guard.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let cooled = guard
                        .opened_at
                        .map(|at| at.elapsed() >= self.config.cool_down())
                        .unwrap_or(true);
                    if !cooled {
                        return Err(CircuitOpen {
                            agent_id: agent_id.to_string(),
                        });
                    }
                    guard.transition(agent_id, CircuitState::HalfOpen, self.config.history_len);
                    guard.trial_in_flight = true;
                    true
                }
                CircuitState::HalfOpen => {
                    if guard.trial_in_flight {
                        return Err(CircuitOpen {
                            agent_id: agent_id.to_string(),
                        });
                    }
                    guard.trial_in_flight = true;
                    true
                }
            }
        };

        Ok(CallPermit {
            breaker,
            agent_id: agent_id.to_string(),
            trial,
            settled: false,
            failure_threshold: self.config.failure_threshold,
            history_len: self.config.history_len,
        })
    }

    /// Snapshot for one agent. Unknown agents report a fresh Closed breaker.
    pub fn get_health(&self, agent_id: &str) -> HealthSnapshot {
        match self.agents.get(agent_id) {
            Some(breaker) => breaker.lock().snapshot(agent_id, self.config.slow_call_ms),
            None => Breaker::new().snapshot(agent_id, self.config.slow_call_ms),
        }
    }

    /// Force an agent back to Closed and clear its failure streak.
    pub fn reset(&self, agent_id: &str) {
        let breaker = self.breaker(agent_id);
        let mut guard = breaker.lock();
        guard.transition(agent_id, CircuitState::Closed, self.config.history_len);
        guard.consecutive_failures = 0;
        guard.trial_in_flight = false;
    }
}

/// Admission to call an agent. Settle it with the call outcome; a trial
/// permit dropped unsettled frees the trial slot for the next caller.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<Mutex<Breaker>>,
    agent_id: String,
    trial: bool,
    settled: bool,
    failure_threshold: u32,
    history_len: usize,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self, latency: Duration) {
        self.settled = true;
        let mut guard = self.breaker.lock();
        guard.observe_latency(latency);
        guard.successful_calls += 1;
        guard.consecutive_failures = 0;
        if self.trial {
            guard.transition(&self.agent_id, CircuitState::Closed, self.history_len);
        }
    }

    pub fn record_failure(mut self, latency: Duration, detail: &str) {
        self.settled = true;
        let mut guard = self.breaker.lock();
        guard.observe_latency(latency);
        guard.failed_calls += 1;
        guard.consecutive_failures += 1;
        guard.last_error = Some(detail.to_string());
        guard.last_failure_at = Some(Utc::now());

        let should_open = match guard.state {
            CircuitState::HalfOpen => self.trial,
            CircuitState::Closed => guard.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            warn!(
                "Opening circuit for agent {} after {} consecutive failures: {}",
                self.agent_id, guard.consecutive_failures, detail
            );
            guard.transition(&self.agent_id, CircuitState::Open, self.history_len);
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut guard = self.breaker.lock();
            if guard.state == CircuitState::HalfOpen {
                guard.trial_in_flight = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig {
            failure_threshold: 3,
            cool_down_ms: 1_000,
            slow_call_ms: 500,
            history_len: 4,
        })
    }

    fn fail(monitor: &HealthMonitor, agent: &str) {
        monitor
            .acquire(agent)
            .unwrap()
            .record_failure(Duration::from_millis(5), "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_admits_one_trial() {
        let monitor = monitor();
        fail(&monitor, "drafting");
        fail(&monitor, "drafting");
        assert_eq!(monitor.get_health("drafting").state, CircuitState::Closed);
        fail(&monitor, "drafting");

        let health = monitor.get_health("drafting");
        assert_eq!(health.state, CircuitState::Open);
        assert_eq!(health.consecutive_failures, 3);
        assert!(monitor.acquire("drafting").is_err());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let trial = monitor.acquire("drafting").unwrap();
        assert!(trial.is_trial());
        assert_eq!(monitor.get_health("drafting").state, CircuitState::HalfOpen);
        // Only one trial at a time.
        assert!(monitor.acquire("drafting").is_err());

        trial.record_success(Duration::from_millis(5));
        let health = monitor.get_health("drafting");
        assert_eq!(health.state, CircuitState::Closed);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let monitor = monitor();
        for _ in 0..3 {
            fail(&monitor, "visualization");
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        monitor
            .acquire("visualization")
            .unwrap()
            .record_failure(Duration::from_millis(5), "still down");
        assert_eq!(monitor.get_health("visualization").state, CircuitState::Open);
        assert!(monitor.acquire("visualization").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_the_slot() {
        let monitor = monitor();
        for _ in 0..3 {
            fail(&monitor, "discovery");
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        let trial = monitor.acquire("discovery").unwrap();
        drop(trial);
        assert!(monitor.acquire("discovery").unwrap().is_trial());
    }

    #[test]
    fn test_success_resets_streak_and_agents_are_independent() {
        let monitor = monitor();
        fail(&monitor, "a");
        fail(&monitor, "a");
        monitor.acquire("a").unwrap().record_success(Duration::from_millis(1));
        fail(&monitor, "a");
        fail(&monitor, "b");
        assert_eq!(monitor.get_health("a").consecutive_failures, 1);
        assert_eq!(monitor.get_health("a").state, CircuitState::Closed);
        assert_eq!(monitor.get_health("b").consecutive_failures, 1);
    }

    #[test]
    fn test_health_score_and_reset() {
        let monitor = monitor();
        monitor.acquire("a").unwrap().record_success(Duration::from_millis(1));
        let health = monitor.get_health("a");
        assert_eq!(health.health_score, 100.0);
        assert_eq!(health.status, HealthLevel::Healthy);

        fail(&monitor, "a");
        // 50% success, recent failure.
        let health = monitor.get_health("a");
        assert!((health.health_score - 30.0).abs() < 1e-9);
        assert_eq!(health.status, HealthLevel::Offline);
        assert_eq!(health.last_error.as_deref(), Some("boom"));

        fail(&monitor, "a");
        fail(&monitor, "a");
        assert_eq!(monitor.get_health("a").state, CircuitState::Open);
        monitor.reset("a");
        let health = monitor.get_health("a");
        assert_eq!(health.state, CircuitState::Closed);
        assert!(health.transitions.len() <= 4);
        assert!(monitor.acquire("a").is_ok());
    }
}
