//! # Stage: Statistics & Decision Policy
//!
//! ## Responsibility
//! Turn an experiment's counters into a [`StatisticalAnalysis`]: conversion
//! rates, a two-proportion z-test, a two-tailed p-value, the minimum sample
//! size for the target effect, and a recommended action.
//!
//! ## Guarantees
//! - Pure: no I/O, no clock reads (`now_ms` is an argument)
//! - Non-panicking: zero visitors, zero conversions and degenerate baselines
//!   produce neutral values (`z = 0`, `p = 1`, not significant)
//! - Symmetric: swapping the arms negates the z-score and leaves `p` unchanged
//!
//! ## NOT Responsible For
//! - Triggering completion (see [`super::completion`])

use serde::{Deserialize, Serialize};

use super::model::{Arm, Experiment};

const MS_PER_DAY: f64 = 86_400_000.0;

// ---------------------------------------------------------------------------
// AnalysisConfig
// ---------------------------------------------------------------------------

/// Thresholds for significance testing and sample-size estimation.
///
/// ```toml
/// [analysis]
/// alpha             = 0.05
/// min_visitors      = 100
/// target_effect     = 0.2
/// baseline_fallback = 0.05
/// z_alpha           = 1.96
/// z_beta            = 0.84
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Significance threshold for the p-value.
    pub alpha: f64,
    /// The larger arm must have at least this many visitors to be significant.
    pub min_visitors: u64,
    /// Relative lift the sample-size estimate is powered for (0.2 = +20%).
    pub target_effect: f64,
    /// Baseline rate used when the control arm has no conversions yet.
    pub baseline_fallback: f64,
    /// z-value for alpha (two-tailed 0.05).
    pub z_alpha: f64,
    /// z-value for power (0.8).
    pub z_beta: f64,
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(format!("alpha must be in (0, 1), got {}", self.alpha));
        }
        if !(self.target_effect > 0.0 && self.target_effect.is_finite()) {
            return Err(format!("target_effect must be > 0, got {}", self.target_effect));
        }
        if !(self.baseline_fallback > 0.0 && self.baseline_fallback < 1.0) {
            return Err(format!(
                "baseline_fallback must be in (0, 1), got {}",
                self.baseline_fallback
            ));
        }
        if !(self.z_alpha > 0.0 && self.z_beta > 0.0) {
            return Err("z_alpha and z_beta must be > 0".into());
        }
        Ok(())
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            min_visitors: 100,
            target_effect: 0.2,
            baseline_fallback: 0.05,
            z_alpha: 1.96,
            z_beta: 0.84,
        }
    }
}

// ---------------------------------------------------------------------------
// RecommendedAction
// ---------------------------------------------------------------------------

/// What the decision policy recommends for an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Continue,
    DeclareWinner,
    /// Futility stop: twice the required sample without significance.
    StopTest,
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecommendedAction::Continue => write!(f, "continue"),
            RecommendedAction::DeclareWinner => write!(f, "declare_winner"),
            RecommendedAction::StopTest => write!(f, "stop_test"),
        }
    }
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// `conversions / visitors`, or 0 with no visitors.
pub fn conversion_rate(conversions: u64, visitors: u64) -> f64 {
    if visitors == 0 {
        0.0
    } else {
        conversions as f64 / visitors as f64
    }
}

/// Relative lift of the variant over control in percent; 0 when control is 0.
pub fn improvement_percentage(control_rate: f64, variant_rate: f64) -> f64 {
    if control_rate > 0.0 {
        (variant_rate - control_rate) / control_rate * 100.0
    } else {
        0.0
    }
}

/// Standard normal CDF via the Zelen & Severo rational approximation
/// (Abramowitz & Stegun 26.2.17, five-term polynomial).
pub fn normal_cdf(z: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.2316419 * z.abs());
    let d = 0.3989423 * (-z * z / 2.0).exp();
    let prob = d
        * t
        * (0.3193815 + t * (-0.3565638 + t * (1.781478 + t * (-1.821256 + t * 1.330274))));
    if z > 0.0 {
        1.0 - prob
    } else {
        prob
    }
}

/// Two-tailed p-value for a z-score, clamped to `[0, 1]`.
pub fn two_tailed_p_value(z: f64) -> f64 {
    if !z.is_finite() {
        return if z.is_nan() { 1.0 } else { 0.0 };
    }
    (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0)
}

/// Outcome of a two-proportion z-test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZTest {
    pub z_score: f64,
    pub p_value: f64,
}

impl ZTest {
    /// No evidence either way.
    pub const NEUTRAL: ZTest = ZTest { z_score: 0.0, p_value: 1.0 };
}

/// Pooled two-proportion z-test of variant against control.
pub fn two_proportion_z_test(
    control_conversions: u64,
    control_visitors: u64,
    variant_conversions: u64,
    variant_visitors: u64,
) -> ZTest {
    if control_visitors == 0 || variant_visitors == 0 {
        return ZTest::NEUTRAL;
    }
    let n1 = control_visitors as f64;
    let n2 = variant_visitors as f64;
    let r1 = control_conversions as f64 / n1;
    let r2 = variant_conversions as f64 / n2;

    let pooled = (control_conversions + variant_conversions) as f64 / (n1 + n2);
    let standard_error = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if standard_error.is_nan() || standard_error <= 0.0 {
        return ZTest::NEUTRAL;
    }
    let z_score = (r2 - r1) / standard_error;
    ZTest { z_score, p_value: two_tailed_p_value(z_score) }
}

/// Per-arm visitors needed to detect `config.target_effect` relative lift over
/// `control_rate` (or the fallback baseline when control has no conversions).
///
/// Never below 1.
pub fn min_sample_size(control_rate: f64, config: &AnalysisConfig) -> u64 {
    let baseline = if control_rate > 0.0 { control_rate } else { config.baseline_fallback };
    let p2 = baseline * (1.0 + config.target_effect);
    let pooled = (baseline + p2) / 2.0;
    let effect = (p2 - baseline).abs();
    let z = config.z_alpha + config.z_beta;

    let n = (z * z * 2.0 * pooled * (1.0 - pooled) / (effect * effect)).ceil();
    if n.is_finite() && n >= 1.0 {
        n as u64
    } else {
        1
    }
}

/// Ordered decision policy.
pub fn recommend(is_significant: bool, current: u64, min_sample: u64) -> RecommendedAction {
    if is_significant && current >= min_sample {
        RecommendedAction::DeclareWinner
    } else if current >= min_sample.saturating_mul(2) && !is_significant {
        RecommendedAction::StopTest
    } else {
        RecommendedAction::Continue
    }
}

/// Days until `min_sample` is reached at the observed traffic rate.
///
/// `None` when the experiment has not run for any measurable time, has no
/// traffic, or has already reached the sample.
pub fn estimate_days_to_significance(
    start_ms: u64,
    now_ms: u64,
    current: u64,
    min_sample: u64,
) -> Option<u64> {
    let days_running = (now_ms.saturating_sub(start_ms) as f64 / MS_PER_DAY).ceil();
    if days_running <= 0.0 {
        return None;
    }
    let per_day = current as f64 / days_running;
    if per_day <= 0.0 {
        return None;
    }
    let estimate = ((min_sample as f64 - current as f64) / per_day).ceil();
    if estimate > 0.0 {
        Some(estimate as u64)
    } else {
        None
    }
}

/// Arm with the higher conversion rate; ties go to control.
pub fn leading_arm(control_rate: f64, variant_rate: f64) -> Arm {
    if variant_rate > control_rate {
        Arm::Variant
    } else {
        Arm::Control
    }
}

// ---------------------------------------------------------------------------
// StatisticalAnalysis
// ---------------------------------------------------------------------------

/// Derived view of an experiment's current evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalAnalysis {
    pub experiment_id: String,
    pub control_rate: f64,
    pub variant_rate: f64,
    pub improvement_percentage: f64,
    pub z_score: f64,
    pub p_value: f64,
    pub confidence_level: f64,
    /// Total visitors across both arms.
    pub sample_size: u64,
    pub control_visitors: u64,
    pub variant_visitors: u64,
    pub is_significant: bool,
    pub min_sample_size: u64,
    pub recommended_action: RecommendedAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_days_to_significance: Option<u64>,
}

impl StatisticalAnalysis {
    pub fn leading_arm(&self) -> Arm {
        leading_arm(self.control_rate, self.variant_rate)
    }
}

/// Analyze an experiment's counters as of `now_ms`.
pub fn analyze(
    experiment: &Experiment,
    config: &AnalysisConfig,
    now_ms: u64,
) -> StatisticalAnalysis {
    let cv = experiment.control_visitors;
    let vv = experiment.variant_visitors;
    let control_rate = conversion_rate(experiment.control_conversions, cv);
    let variant_rate = conversion_rate(experiment.variant_conversions, vv);

    let test = two_proportion_z_test(
        experiment.control_conversions,
        cv,
        experiment.variant_conversions,
        vv,
    );
    let is_significant = test.p_value < config.alpha && cv.max(vv) >= config.min_visitors;

    let sample_size = cv + vv;
    let min_sample = min_sample_size(control_rate, config);

    StatisticalAnalysis {
        experiment_id: experiment.id.clone(),
        control_rate,
        variant_rate,
        improvement_percentage: improvement_percentage(control_rate, variant_rate),
        z_score: test.z_score,
        p_value: test.p_value,
        confidence_level: (1.0 - test.p_value) * 100.0,
        sample_size,
        control_visitors: cv,
        variant_visitors: vv,
        is_significant,
        min_sample_size: min_sample,
        recommended_action: recommend(is_significant, sample_size, min_sample),
        estimated_days_to_significance: estimate_days_to_significance(
            experiment.start_date,
            now_ms,
            sample_size,
            min_sample,
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{ExperimentStatus, TrafficSplit};
    use serde_json::json;

    fn experiment(cv: u64, cc: u64, vv: u64, vc: u64) -> Experiment {
        Experiment {
            id: "exp-1".into(),
            site_id: "site".into(),
            name: "headline".into(),
            kind: "general".into(),
            control_content: json!("A"),
            variant_content: json!("B"),
            traffic_split: TrafficSplit::default(),
            start_date: 0,
            end_date: None,
            status: ExperimentStatus::Active,
            winner: None,
            confidence_level: None,
            statistical_significance: None,
            improvement_percentage: None,
            control_visitors: cv,
            variant_visitors: vv,
            control_conversions: cc,
            variant_conversions: vc,
        }
    }

    // ===== primitives =====

    #[test]
    fn test_conversion_rate_zero_visitors() {
        assert_eq!(conversion_rate(0, 0), 0.0);
        assert_eq!(conversion_rate(5, 0), 0.0);
    }

    #[test]
    fn test_conversion_rate_basic() {
        assert!((conversion_rate(5, 100) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_improvement_zero_control() {
        assert_eq!(improvement_percentage(0.0, 0.5), 0.0);
    }

    #[test]
    fn test_improvement_doubling_is_100() {
        assert!((improvement_percentage(0.02, 0.04) - 100.0).abs() < 1e-9);
        assert!((improvement_percentage(0.04, 0.02) + 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_normal_cdf_at_zero_is_half() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_normal_cdf_known_points() {
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-4);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-4);
        assert!((normal_cdf(1.0) - 0.8413).abs() < 1e-4);
    }

    #[test]
    fn test_normal_cdf_monotonic() {
        let mut prev = 0.0;
        for i in -40..=40 {
            let v = normal_cdf(i as f64 / 10.0);
            assert!(v >= prev, "cdf not monotonic at {}", i);
            prev = v;
        }
    }

    #[test]
    fn test_p_value_at_zero_is_one() {
        assert_eq!(two_tailed_p_value(0.0), 1.0);
    }

    #[test]
    fn test_p_value_196_is_005() {
        assert!((two_tailed_p_value(1.96) - 0.05).abs() < 1e-3);
        assert!((two_tailed_p_value(-1.96) - 0.05).abs() < 1e-3);
    }

    #[test]
    fn test_p_value_large_z_near_zero() {
        assert!(two_tailed_p_value(10.0) < 1e-6);
        assert_eq!(two_tailed_p_value(f64::INFINITY), 0.0);
        assert_eq!(two_tailed_p_value(f64::NAN), 1.0);
    }

    // ===== z-test =====

    #[test]
    fn test_z_test_zero_visitors_neutral() {
        assert_eq!(two_proportion_z_test(0, 0, 0, 0), ZTest::NEUTRAL);
        assert_eq!(two_proportion_z_test(0, 0, 5, 10), ZTest::NEUTRAL);
        assert_eq!(two_proportion_z_test(5, 10, 0, 0), ZTest::NEUTRAL);
    }

    #[test]
    fn test_z_test_zero_pooled_neutral() {
        assert_eq!(two_proportion_z_test(0, 100, 0, 100), ZTest::NEUTRAL);
        // all converted: pooled = 1 → se = 0
        assert_eq!(two_proportion_z_test(100, 100, 50, 50), ZTest::NEUTRAL);
    }

    #[test]
    fn test_z_test_known_value() {
        // r1 = 0.5, r2 = 0.7, pooled = 0.6, se = 0.04 → z = 5
        let t = two_proportion_z_test(150, 300, 210, 300);
        assert!((t.z_score - 5.0).abs() < 1e-9, "z={}", t.z_score);
        assert!(t.p_value < 1e-5);
    }

    #[test]
    fn test_z_test_symmetry() {
        let a = two_proportion_z_test(12, 340, 31, 290);
        let b = two_proportion_z_test(31, 290, 12, 340);
        assert_eq!(a.z_score, -b.z_score);
        assert_eq!(a.p_value, b.p_value);
    }

    // ===== min sample size =====

    #[test]
    fn test_min_sample_fallback_baseline() {
        // baseline 0.05 → p2 0.06, pooled 0.055, effect 0.01
        // 7.84 * 2 * 0.055 * 0.945 / 0.0001 = 8149.68 → 8150
        assert_eq!(min_sample_size(0.0, &AnalysisConfig::default()), 8150);
    }

    #[test]
    fn test_min_sample_half_baseline() {
        // 7.84 * 2 * 0.55 * 0.45 / 0.01 = 388.08 → 389
        assert_eq!(min_sample_size(0.5, &AnalysisConfig::default()), 389);
    }

    #[test]
    fn test_min_sample_two_percent_baseline() {
        // 7.84 * 2 * 0.022 * 0.978 / 0.000016 = 21085.7 → 21086
        assert_eq!(min_sample_size(0.02, &AnalysisConfig::default()), 21086);
    }

    #[test]
    fn test_min_sample_degenerate_baseline_clamped() {
        // baseline 1.0 → pooled > 1 → negative estimate
        assert_eq!(min_sample_size(1.0, &AnalysisConfig::default()), 1);
    }

    #[test]
    fn test_min_sample_shrinks_with_larger_effect() {
        let small = min_sample_size(0.1, &AnalysisConfig::default());
        let wide = AnalysisConfig { target_effect: 0.5, ..Default::default() };
        let large = min_sample_size(0.1, &wide);
        assert!(large < small);
    }

    // ===== decision policy =====

    #[test]
    fn test_recommend_declare_winner() {
        assert_eq!(recommend(true, 500, 400), RecommendedAction::DeclareWinner);
        assert_eq!(recommend(true, 400, 400), RecommendedAction::DeclareWinner);
    }

    #[test]
    fn test_recommend_significant_but_small_continues() {
        assert_eq!(recommend(true, 399, 400), RecommendedAction::Continue);
    }

    #[test]
    fn test_recommend_futility() {
        assert_eq!(recommend(false, 800, 400), RecommendedAction::StopTest);
        assert_eq!(recommend(false, 799, 400), RecommendedAction::Continue);
    }

    #[test]
    fn test_recommend_significant_never_stops() {
        assert_eq!(recommend(true, 10_000, 400), RecommendedAction::DeclareWinner);
    }

    #[test]
    fn test_action_display() {
        assert_eq!(RecommendedAction::DeclareWinner.to_string(), "declare_winner");
        assert_eq!(
            serde_json::to_string(&RecommendedAction::StopTest).unwrap(),
            "\"stop_test\""
        );
    }

    // ===== days estimate =====

    #[test]
    fn test_days_estimate_none_when_just_started() {
        assert_eq!(estimate_days_to_significance(1_000, 1_000, 50, 400), None);
    }

    #[test]
    fn test_days_estimate_none_without_traffic() {
        assert_eq!(estimate_days_to_significance(0, 3 * 86_400_000, 0, 400), None);
    }

    #[test]
    fn test_days_estimate_basic() {
        // 2 days, 100 visitors → 50/day; 300 remaining → 6 days
        assert_eq!(estimate_days_to_significance(0, 2 * 86_400_000, 100, 400), Some(6));
    }

    #[test]
    fn test_days_estimate_partial_day_rounds_up() {
        // 1.5 days → 2 days running, 100/2 = 50/day, 50 remaining → 1
        assert_eq!(estimate_days_to_significance(0, 129_600_000, 100, 150), Some(1));
    }

    #[test]
    fn test_days_estimate_none_when_reached() {
        assert_eq!(estimate_days_to_significance(0, 86_400_000, 500, 400), None);
        assert_eq!(estimate_days_to_significance(0, 86_400_000, 400, 400), None);
    }

    // ===== analyze =====

    #[test]
    fn test_analyze_zero_data() {
        let a = analyze(&experiment(0, 0, 0, 0), &AnalysisConfig::default(), 0);
        assert_eq!(a.p_value, 1.0);
        assert_eq!(a.z_score, 0.0);
        assert_eq!(a.confidence_level, 0.0);
        assert!(!a.is_significant);
        assert_eq!(a.recommended_action, RecommendedAction::Continue);
        assert_eq!(a.min_sample_size, 8150);
        assert_eq!(a.estimated_days_to_significance, None);
    }

    #[test]
    fn test_analyze_boundary_significant_but_continue() {
        let a = analyze(&experiment(100, 2, 100, 20), &AnalysisConfig::default(), 0);
        assert!(a.is_significant, "p={}", a.p_value);
        assert_eq!(a.sample_size, 200);
        assert_eq!(a.min_sample_size, 21086);
        assert_eq!(a.recommended_action, RecommendedAction::Continue);
    }

    #[test]
    fn test_analyze_boundary_declares_once_sample_reached() {
        let a = analyze(&experiment(11_000, 220, 11_000, 2_200), &AnalysisConfig::default(), 0);
        assert!(a.is_significant);
        assert!(a.sample_size >= a.min_sample_size);
        assert_eq!(a.recommended_action, RecommendedAction::DeclareWinner);
        assert_eq!(a.leading_arm(), Arm::Variant);
    }

    #[test]
    fn test_analyze_requires_min_visitors() {
        // Huge effect but only 50 visitors per arm
        let a = analyze(&experiment(50, 1, 50, 25), &AnalysisConfig::default(), 0);
        assert!(a.p_value < 0.05);
        assert!(!a.is_significant);
    }

    #[test]
    fn test_analyze_futility_stop() {
        // baseline 0.5 → min 389; 800 visitors ≥ 778, p ≈ 0.78
        let a = analyze(&experiment(400, 200, 400, 204), &AnalysisConfig::default(), 0);
        assert!(!a.is_significant);
        assert!(a.p_value >= 0.05);
        assert_eq!(a.min_sample_size, 389);
        assert_eq!(a.recommended_action, RecommendedAction::StopTest);
    }

    #[test]
    fn test_analyze_declare_winner_half_baseline() {
        let a = analyze(&experiment(300, 150, 300, 210), &AnalysisConfig::default(), 0);
        assert!(a.is_significant);
        assert_eq!(a.recommended_action, RecommendedAction::DeclareWinner);
        assert!((a.improvement_percentage - 40.0).abs() < 1e-9);
        assert!(a.confidence_level > 99.9);
    }

    #[test]
    fn test_analyze_serializes_snake_case_action() {
        let a = analyze(&experiment(0, 0, 0, 0), &AnalysisConfig::default(), 0);
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["recommended_action"], "continue");
        assert!(v.get("estimated_days_to_significance").is_none());
    }

    #[test]
    fn test_leading_arm_tie_is_control() {
        assert_eq!(leading_arm(0.1, 0.1), Arm::Control);
        assert_eq!(leading_arm(0.1, 0.2), Arm::Variant);
        assert_eq!(leading_arm(0.3, 0.2), Arm::Control);
    }

    #[test]
    fn test_config_validation() {
        assert!(AnalysisConfig::default().validate().is_ok());
        assert!(AnalysisConfig { alpha: 0.0, ..Default::default() }.validate().is_err());
        assert!(AnalysisConfig { alpha: 1.0, ..Default::default() }.validate().is_err());
        assert!(AnalysisConfig { target_effect: 0.0, ..Default::default() }.validate().is_err());
        let config = AnalysisConfig { baseline_fallback: 1.0, ..Default::default() };
        assert!(config.validate().is_err());
        assert!(AnalysisConfig { z_beta: 0.0, ..Default::default() }.validate().is_err());
    }
}
