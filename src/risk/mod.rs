//! Risk Assessment
//!
//! Turns a dependency report plus operational context into four category scores, an
//! overall score, a risk level and rule-matched recommendations. No I/O happens here.

mod engine;

pub use engine::RiskAssessmentEngine;
pub(crate) use engine::is_trivial_rollback;

use crate::config::RiskWeights;
use crate::operation::OperationKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// RISK LEVELS
// =============================================================================

/// Four-band severity shared by dependency impacts, plan steps and assessments
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// LOW < 35 ≤ MEDIUM < 70 ≤ HIGH < 85 ≤ CRITICAL
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 85.0 => RiskLevel::Critical,
            s if s >= 70.0 => RiskLevel::High,
            s if s >= 35.0 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskCategory {
    DataLoss,
    SystemAvailability,
    PerformanceDegradation,
    RollbackComplexity,
}

impl RiskCategory {
    pub const ALL: [RiskCategory; 4] = [
        RiskCategory::DataLoss,
        RiskCategory::SystemAvailability,
        RiskCategory::PerformanceDegradation,
        RiskCategory::RollbackComplexity,
    ];

    pub fn weight(&self, weights: &RiskWeights) -> f64 {
        match self {
            RiskCategory::DataLoss => weights.data_loss,
            RiskCategory::SystemAvailability => weights.system_availability,
            RiskCategory::PerformanceDegradation => weights.performance_degradation,
            RiskCategory::RollbackComplexity => weights.rollback_complexity,
        }
    }
}

// =============================================================================
// ASSESSMENT
// =============================================================================

/// One contribution to a category score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactor {
    pub code: String,
    pub category: RiskCategory,
    pub description: String,
    pub severity: RiskLevel,
    /// Points added to the category before multipliers
    pub score_impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub priority: RecommendationPriority,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationPriority {
    Required,
    Recommended,
    Optional,
}

/// Result of scoring one operation against one dependency report
///
/// Carries no timestamp: identical inputs produce identical values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComprehensiveRiskAssessment {
    pub operation: OperationKind,
    pub target: String,
    /// 0 (harmless) to 100 (certain damage)
    pub overall_score: f64,
    pub risk_level: RiskLevel,
    pub category_scores: BTreeMap<RiskCategory, f64>,
    pub risk_factors: Vec<RiskFactor>,
    pub recommendations: Vec<Recommendation>,
    pub weights: RiskWeights,
}

impl ComprehensiveRiskAssessment {
    pub fn category_score(&self, category: RiskCategory) -> f64 {
        self.category_scores.get(&category).copied().unwrap_or(0.0)
    }

    pub fn is_critical(&self) -> bool {
        self.risk_level == RiskLevel::Critical
    }
}
