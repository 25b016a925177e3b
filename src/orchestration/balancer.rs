//! Agent selection for ready tasks.
//!
//! The [`LoadBalancer`] filters candidate agents by a task's hard
//! requirements, scores the survivors under the configured [`Strategy`],
//! optionally blends in a [`LoadPredictor`] forecast, and returns a
//! [`LoadBalancingDecision`] with the winner and ranked runner-ups.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

use crate::core::agent::{AgentId, AgentProfile};
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::orchestration::predictor::{LoadPredictor, Prediction};
use crate::orchestration::stealing::AgentWorkload;

/// Share of the final score taken by the base strategy when predicting.
const BASE_SHARE: f64 = 0.7;
/// Share of the final score taken by the forecast when predicting.
const PREDICTIVE_SHARE: f64 = 0.3;
/// Score used when nothing is known about an agent.
const NEUTRAL_SCORE: f64 = 0.5;
/// Smoothing factor for affinity learning.
const AFFINITY_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    LoadBased,
    PerformanceBased,
    CapabilityBased,
    AffinityBased,
    CostBased,
    Hybrid,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::LoadBased => "load-based",
            Strategy::PerformanceBased => "performance-based",
            Strategy::CapabilityBased => "capability-based",
            Strategy::AffinityBased => "affinity-based",
            Strategy::CostBased => "cost-based",
            Strategy::Hybrid => "hybrid",
        };
        write!(f, "{}", name)
    }
}

/// Weights of the hybrid strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridWeights {
    pub load: f64,
    pub performance: f64,
    pub capability: f64,
    pub affinity: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            load: 0.25,
            performance: 0.30,
            capability: 0.30,
            affinity: 0.15,
        }
    }
}

impl HybridWeights {
    pub fn total(&self) -> f64 {
        self.load + self.performance + self.capability + self.affinity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: Strategy,
    pub weights: HybridWeights,
    /// Blend a load forecast into every score.
    pub predictive: bool,
    /// Task count at which an agent counts as fully utilized.
    pub max_tasks_per_agent: usize,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Hybrid,
            weights: HybridWeights::default(),
            predictive: true,
            max_tasks_per_agent: 10,
        }
    }
}

/// Reference performance an agent is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub throughput: f64,
    pub efficiency: f64,
    pub response_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAgent {
    pub agent_id: AgentId,
    pub score: f64,
}

/// Outcome of one selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingDecision {
    pub selected_agent: AgentId,
    pub score: f64,
    pub confidence: f64,
    /// Runner-ups, best first.
    pub alternatives: Vec<ScoredAgent>,
    pub strategy: Strategy,
    /// Forecast used for the selected agent, if predictive scoring is on.
    pub prediction: Option<Prediction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerStats {
    pub decisions: u64,
    pub rejected: u64,
    pub average_confidence: f64,
    pub tracked_agents: usize,
}

/// Combine task count and resource telemetry into a [0, 1] utilization.
pub fn utilization(workload: &AgentWorkload, max_tasks: usize) -> f64 {
    let task_ratio = workload.task_count as f64 / max_tasks.max(1) as f64;
    let cpu = workload.cpu_usage / 100.0;
    let memory = workload.memory_usage / 100.0;
    (0.6 * task_ratio + 0.25 * cpu + 0.15 * memory).clamp(0.0, 1.0)
}

pub struct LoadBalancer {
    config: LoadBalancerConfig,
    utilization: HashMap<AgentId, f64>,
    predictors: HashMap<AgentId, LoadPredictor>,
    baselines: HashMap<AgentId, PerformanceBaseline>,
    affinity: HashMap<(AgentId, String), f64>,
    stats: LoadBalancerStats,
    confidence_sum: f64,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            utilization: HashMap::new(),
            predictors: HashMap::new(),
            baselines: HashMap::new(),
            affinity: HashMap::new(),
            stats: LoadBalancerStats::default(),
            confidence_sum: 0.0,
        }
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.config.strategy = strategy;
    }

    pub fn set_weights(&mut self, weights: HybridWeights) -> Result<()> {
        if weights.total() <= 0.0 {
            return Err(Error::InvalidConfig(
                "hybrid weights must sum to a positive value".to_string(),
            ));
        }
        self.config.weights = weights;
        Ok(())
    }

    pub fn set_predictive(&mut self, enabled: bool) {
        self.config.predictive = enabled;
    }

    /// Record an agent's current workload; also feeds its load history.
    pub fn update_load(&mut self, workload: &AgentWorkload) {
        let load = utilization(workload, self.config.max_tasks_per_agent);
        self.record_load(&workload.agent_id, load);
    }

    /// Record a raw utilization sample in [0, 1].
    pub fn record_load(&mut self, agent_id: &AgentId, load: f64) {
        let load = load.clamp(0.0, 1.0);
        self.utilization.insert(agent_id.clone(), load);
        self.predictors
            .entry(agent_id.clone())
            .or_default()
            .record(load);
    }

    pub fn current_load(&self, agent_id: &AgentId) -> f64 {
        self.utilization.get(agent_id).copied().unwrap_or(0.0)
    }

    pub fn update_performance_baseline(&mut self, agent_id: &AgentId, baseline: PerformanceBaseline) {
        self.baselines.insert(agent_id.clone(), baseline);
    }

    /// Learn from a finished task: nudges the agent's affinity for the
    /// task type toward 1 on success and toward 0 on failure.
    pub fn record_task_outcome(
        &mut self,
        agent_id: &AgentId,
        task_type: &str,
        success: bool,
        duration: Duration,
    ) {
        let entry = self
            .affinity
            .entry((agent_id.clone(), task_type.to_string()))
            .or_insert(NEUTRAL_SCORE);
        let target = if success { 1.0 } else { 0.0 };
        *entry = (1.0 - AFFINITY_ALPHA) * *entry + AFFINITY_ALPHA * target;
        trace!(
            "Affinity {}/{} now {:.3} after {:?} ({})",
            agent_id,
            task_type,
            *entry,
            duration,
            if success { "success" } else { "failure" }
        );
    }

    pub fn affinity(&self, agent_id: &AgentId, task_type: &str) -> f64 {
        self.affinity
            .get(&(agent_id.clone(), task_type.to_string()))
            .copied()
            .unwrap_or(NEUTRAL_SCORE)
    }

    pub fn forget_agent(&mut self, agent_id: &AgentId) {
        self.utilization.remove(agent_id);
        self.predictors.remove(agent_id);
        self.baselines.remove(agent_id);
        self.affinity.retain(|(id, _), _| id != agent_id);
    }

    /// Choose the best agent for `task` among `candidates`.
    ///
    /// # Errors
    /// `NoEligibleAgent` when no candidate meets the task's hard requirements.
    pub fn select_agent(
        &mut self,
        task: &Task,
        candidates: &[AgentProfile],
    ) -> Result<LoadBalancingDecision> {
        let eligible: Vec<&AgentProfile> = candidates
            .iter()
            .filter(|agent| agent.meets_hard_requirements(task))
            .collect();
        if eligible.is_empty() {
            self.stats.rejected += 1;
            return Err(Error::NoEligibleAgent {
                task: task.id.clone(),
                considered: candidates.len(),
            });
        }

        let mut scored: Vec<(ScoredAgent, Option<Prediction>)> = eligible
            .iter()
            .map(|agent| {
                let (score, prediction) = self.score_agent(task, agent);
                trace!("Agent {} scored {:.4} for task {}", agent.id, score, task.id);
                (
                    ScoredAgent {
                        agent_id: agent.id.clone(),
                        score,
                    },
                    prediction,
                )
            })
            .collect();
        // Stable: equal scores keep candidate order.
        scored.sort_by(|a, b| b.0.score.total_cmp(&a.0.score));

        let mut ranked = scored.into_iter();
        let (best, prediction) = ranked
            .next()
            .ok_or_else(|| Error::NoEligibleAgent {
                task: task.id.clone(),
                considered: candidates.len(),
            })?;
        let alternatives: Vec<ScoredAgent> = ranked.map(|(s, _)| s).collect();

        let confidence = match alternatives.first() {
            Some(second) => ((best.score - second.score) + 0.5).min(1.0),
            None => 0.5,
        };

        self.stats.decisions += 1;
        self.confidence_sum += confidence;
        self.stats.average_confidence = self.confidence_sum / self.stats.decisions as f64;

        debug!(
            "Selected {} for task {} (score {:.3}, confidence {:.2}, strategy {})",
            best.agent_id, task.id, best.score, confidence, self.config.strategy
        );

        Ok(LoadBalancingDecision {
            selected_agent: best.agent_id,
            score: best.score,
            confidence,
            alternatives,
            strategy: self.config.strategy,
            prediction,
        })
    }

    /// Score one agent, returning the forecast used if any.
    pub fn score_agent(&self, task: &Task, agent: &AgentProfile) -> (f64, Option<Prediction>) {
        let base = self.strategy_score(self.config.strategy, task, agent);
        if !self.config.predictive {
            return (base, None);
        }

        let current = self.current_load(&agent.id);
        let prediction = self
            .predictors
            .get(&agent.id)
            .map(|p| p.predict(current))
            .unwrap_or_else(|| LoadPredictor::new().predict(current));
        let predictive = 1.0 - prediction.predicted_load;
        (
            BASE_SHARE * base + PREDICTIVE_SHARE * predictive,
            Some(prediction),
        )
    }

    /// Base score of an agent under a given strategy.
    pub fn strategy_score(&self, strategy: Strategy, task: &Task, agent: &AgentProfile) -> f64 {
        match strategy {
            Strategy::LoadBased => self.load_score(agent),
            Strategy::PerformanceBased => self.performance_score(agent),
            Strategy::CapabilityBased => capability_score(task, agent),
            Strategy::AffinityBased => self.affinity(&agent.id, &task.task_type),
            Strategy::CostBased => cost_score(agent),
            Strategy::Hybrid => {
                let w = &self.config.weights;
                w.load * self.load_score(agent)
                    + w.performance * self.performance_score(agent)
                    + w.capability * capability_score(task, agent)
                    + w.affinity * self.affinity(&agent.id, &task.task_type)
            }
        }
    }

    fn load_score(&self, agent: &AgentProfile) -> f64 {
        1.0 - self.current_load(&agent.id)
    }

    fn performance_score(&self, agent: &AgentProfile) -> f64 {
        let Some(baseline) = self.baselines.get(&agent.id) else {
            return NEUTRAL_SCORE;
        };
        let m = &agent.metrics;

        let throughput = ratio_or_neutral(m.throughput, baseline.throughput);
        let efficiency = ratio_or_neutral(m.efficiency, baseline.efficiency);
        let responsiveness = if m.response_time_ms > 0.0 {
            (baseline.response_time_ms / m.response_time_ms).min(1.0)
        } else {
            1.0
        };
        (throughput + efficiency + responsiveness) / 3.0
    }

    pub fn stats(&self) -> LoadBalancerStats {
        LoadBalancerStats {
            tracked_agents: self.utilization.len(),
            ..self.stats.clone()
        }
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancerConfig::default())
    }
}

fn ratio_or_neutral(value: f64, baseline: f64) -> f64 {
    if baseline > 0.0 {
        (value / baseline).clamp(0.0, 1.0)
    } else {
        NEUTRAL_SCORE
    }
}

fn overlaps(wanted: &[String], offered: &[String]) -> bool {
    wanted.iter().any(|w| offered.contains(w))
}

/// Fraction of requested capability checks the agent satisfies.
pub fn capability_score(task: &Task, agent: &AgentProfile) -> f64 {
    let reqs = &task.requirements;
    let caps = &agent.capabilities;

    let mut requested = 0u32;
    let mut satisfied = 0u32;
    let mut check = |wanted: bool, ok: bool| {
        if wanted {
            requested += 1;
            if ok {
                satisfied += 1;
            }
        }
    };
    check(
        !reqs.languages.is_empty(),
        overlaps(&reqs.languages, &caps.languages),
    );
    check(
        !reqs.frameworks.is_empty(),
        overlaps(&reqs.frameworks, &caps.frameworks),
    );
    check(!reqs.domains.is_empty(), overlaps(&reqs.domains, &caps.domains));
    check(
        !reqs.tools.is_empty(),
        reqs.tools.iter().all(|t| caps.tools.contains(t)),
    );

    if requested == 0 {
        0.0
    } else {
        f64::from(satisfied) / f64::from(requested)
    }
}

/// `max(0, 1 - 1/(speed * reliability)/2)`.
pub fn cost_score(agent: &AgentProfile) -> f64 {
    let efficiency = agent.capabilities.speed * agent.capabilities.reliability;
    if efficiency <= 0.0 {
        return 0.0;
    }
    (1.0 - (1.0 / efficiency) / 2.0).max(0.0)
}
