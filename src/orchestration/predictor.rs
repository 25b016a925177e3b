//! Short-horizon load forecasting.
//!
//! A [`LoadPredictor`] fits a least-squares line through an agent's recent
//! load samples and extrapolates one step ahead. The fit's R² doubles as
//! the confidence of the forecast.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Samples needed before the regression is trusted.
pub const MIN_HISTORY_POINTS: usize = 10;

/// Samples kept per agent.
pub const HISTORY_LIMIT: usize = 100;

/// Why a regression forecast could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum PredictionUnavailable {
    InsufficientHistory { have: usize, need: usize },
    DegenerateSeries,
}

/// Where a prediction came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Regression,
    Fallback(PredictionUnavailable),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Expected utilization at the next sample, in [0, 1].
    pub predicted_load: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub source: PredictionSource,
}

/// A fitted `load = slope * t + intercept` line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearModel {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LinearModel {
    pub fn at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

#[derive(Debug, Clone)]
pub struct LoadPredictor {
    history: VecDeque<f64>,
    limit: usize,
}

impl LoadPredictor {
    pub fn new() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(limit.min(HISTORY_LIMIT)),
            limit: limit.max(MIN_HISTORY_POINTS),
        }
    }

    /// Add a load sample, evicting the oldest beyond the limit.
    pub fn record(&mut self, load: f64) {
        self.history.push_back(load);
        while self.history.len() > self.limit {
            self.history.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn latest(&self) -> Option<f64> {
        self.history.back().copied()
    }

    /// Fit a least-squares line through the history.
    pub fn fit(&self) -> Result<LinearModel, PredictionUnavailable> {
        let n = self.history.len();
        if n < MIN_HISTORY_POINTS {
            return Err(PredictionUnavailable::InsufficientHistory {
                have: n,
                need: MIN_HISTORY_POINTS,
            });
        }

        let nf = n as f64;
        let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
        for (i, &y) in self.history.iter().enumerate() {
            let x = i as f64;
            sum_x += x;
            sum_y += y;
            sum_xy += x * y;
            sum_xx += x * x;
        }

        let denominator = nf * sum_xx - sum_x * sum_x;
        if denominator.abs() < f64::EPSILON || !denominator.is_finite() {
            return Err(PredictionUnavailable::DegenerateSeries);
        }
        let slope = (nf * sum_xy - sum_x * sum_y) / denominator;
        let intercept = (sum_y - slope * sum_x) / nf;

        let mean = sum_y / nf;
        let mut ss_tot = 0.0;
        let mut ss_res = 0.0;
        for (i, &y) in self.history.iter().enumerate() {
            let fitted = slope * i as f64 + intercept;
            ss_tot += (y - mean).powi(2);
            ss_res += (y - fitted).powi(2);
        }
        // A flat series is explained perfectly by a flat line.
        let r_squared = if ss_tot <= f64::EPSILON {
            1.0
        } else {
            (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
        };

        if !slope.is_finite() || !intercept.is_finite() {
            return Err(PredictionUnavailable::DegenerateSeries);
        }
        Ok(LinearModel {
            slope,
            intercept,
            r_squared,
        })
    }

    /// Forecast the next load sample.
    ///
    /// Without a usable regression this falls back to
    /// `min(1, current_load + 0.1)` with confidence 0.5.
    pub fn predict(&self, current_load: f64) -> Prediction {
        match self.fit() {
            Ok(model) => Prediction {
                predicted_load: model.at(self.history.len() as f64).clamp(0.0, 1.0),
                confidence: model.r_squared,
                source: PredictionSource::Regression,
            },
            Err(reason) => Prediction {
                predicted_load: (current_load + 0.1).min(1.0),
                confidence: 0.5,
                source: PredictionSource::Fallback(reason),
            },
        }
    }
}

impl Default for LoadPredictor {
    fn default() -> Self {
        Self::new()
    }
}
