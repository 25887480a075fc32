//! Configuration sections for the pose-graph back-end.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pose graph configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoseGraphConfig {
    /// Dispatch optimization after this many nodes without a loop
    /// closure pass (0 disables automatic dispatch).
    #[serde(default = "default_optimize_every_n_nodes")]
    pub optimize_every_n_nodes: usize,

    /// Translation weight for intra-submap matcher constraints.
    #[serde(default = "default_matcher_translation_weight")]
    pub matcher_translation_weight: f64,

    /// Rotation weight for intra-submap matcher constraints.
    #[serde(default = "default_matcher_rotation_weight")]
    pub matcher_rotation_weight: f64,

    /// Window, in seconds after the last inter-trajectory connection,
    /// within which a local constraint search suffices.
    #[serde(default = "default_global_constraint_search_after_secs")]
    pub global_constraint_search_after_secs: f64,

    /// Ratio of cross-trajectory nodes attempted as global matches when
    /// no recent connection exists.
    #[serde(default = "default_global_sampling_ratio")]
    pub global_sampling_ratio: f64,

    /// Iteration cap applied for the final optimization only.
    #[serde(default = "default_max_num_final_iterations")]
    pub max_num_final_iterations: usize,

    /// Constraint builder configuration.
    #[serde(default)]
    pub constraint_builder: ConstraintBuilderConfig,

    /// Optimization problem configuration.
    #[serde(default)]
    pub optimization: OptimizationConfig,
}

fn default_optimize_every_n_nodes() -> usize {
    90
}

fn default_matcher_translation_weight() -> f64 {
    5e2
}

fn default_matcher_rotation_weight() -> f64 {
    1.6e3
}

fn default_global_constraint_search_after_secs() -> f64 {
    10.0
}

fn default_global_sampling_ratio() -> f64 {
    0.003
}

fn default_max_num_final_iterations() -> usize {
    200
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            optimize_every_n_nodes: default_optimize_every_n_nodes(),
            matcher_translation_weight: default_matcher_translation_weight(),
            matcher_rotation_weight: default_matcher_rotation_weight(),
            global_constraint_search_after_secs: default_global_constraint_search_after_secs(),
            global_sampling_ratio: default_global_sampling_ratio(),
            max_num_final_iterations: default_max_num_final_iterations(),
            constraint_builder: ConstraintBuilderConfig::default(),
            optimization: OptimizationConfig::default(),
        }
    }
}

impl PoseGraphConfig {
    /// Validate parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.global_sampling_ratio && self.global_sampling_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "global_sampling_ratio must be in (0, 1], got {}",
                self.global_sampling_ratio
            )));
        }
        self.constraint_builder.validate()
    }
}

/// Constraint builder configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstraintBuilderConfig {
    /// Ratio of candidate local constraints actually matched.
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,

    /// Minimum score for a local match to become a constraint.
    #[serde(default = "default_min_score")]
    pub min_score: f64,

    /// Minimum score for a full-submap (global localization) match.
    #[serde(default = "default_global_localization_min_score")]
    pub global_localization_min_score: f64,

    /// Translation weight stamped onto loop-closure constraints.
    #[serde(default = "default_loop_closure_translation_weight")]
    pub loop_closure_translation_weight: f64,

    /// Rotation weight stamped onto loop-closure constraints.
    #[serde(default = "default_loop_closure_rotation_weight")]
    pub loop_closure_rotation_weight: f64,

    /// Local search window half-extent in meters.
    #[serde(default = "default_search_window_linear")]
    pub search_window_linear: f64,

    /// Local search window half-extent in radians.
    #[serde(default = "default_search_window_angular")]
    pub search_window_angular: f64,

    /// Linear step of the correlative search, meters.
    #[serde(default = "default_linear_resolution")]
    pub linear_resolution: f64,

    /// Angular step of the correlative search, radians.
    #[serde(default = "default_angular_resolution")]
    pub angular_resolution: f64,
}

fn default_sampling_ratio() -> f64 {
    0.3
}

fn default_min_score() -> f64 {
    0.55
}

fn default_global_localization_min_score() -> f64 {
    0.6
}

fn default_loop_closure_translation_weight() -> f64 {
    1.1e4
}

fn default_loop_closure_rotation_weight() -> f64 {
    1e5
}

fn default_search_window_linear() -> f64 {
    7.0
}

fn default_search_window_angular() -> f64 {
    0.5
}

fn default_linear_resolution() -> f64 {
    0.05
}

fn default_angular_resolution() -> f64 {
    0.02
}

impl Default for ConstraintBuilderConfig {
    fn default() -> Self {
        Self {
            sampling_ratio: default_sampling_ratio(),
            min_score: default_min_score(),
            global_localization_min_score: default_global_localization_min_score(),
            loop_closure_translation_weight: default_loop_closure_translation_weight(),
            loop_closure_rotation_weight: default_loop_closure_rotation_weight(),
            search_window_linear: default_search_window_linear(),
            search_window_angular: default_search_window_angular(),
            linear_resolution: default_linear_resolution(),
            angular_resolution: default_angular_resolution(),
        }
    }
}

impl ConstraintBuilderConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.sampling_ratio && self.sampling_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "sampling_ratio must be in (0, 1], got {}",
                self.sampling_ratio
            )));
        }
        Ok(())
    }
}

/// Optimization problem configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizationConfig {
    /// Iteration cap for each solve.
    #[serde(default = "default_max_num_iterations")]
    pub max_num_iterations: usize,

    /// Relative error change below which the solve terminates.
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,

    /// Initial Levenberg-Marquardt damping.
    #[serde(default = "default_damping")]
    pub damping: f64,

    /// Huber loss scale applied to loop-closure residuals, meters.
    #[serde(default = "default_huber_scale")]
    pub huber_scale: f64,
}

fn default_max_num_iterations() -> usize {
    50
}

fn default_convergence_threshold() -> f64 {
    1e-7
}

fn default_damping() -> f64 {
    1e-4
}

fn default_huber_scale() -> f64 {
    1e1
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            max_num_iterations: default_max_num_iterations(),
            convergence_threshold: default_convergence_threshold(),
            damping: default_damping(),
            huber_scale: default_huber_scale(),
        }
    }
}

/// Submap insertion policy configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmapConfig {
    /// Range-data count after which a submap stops being the newest and
    /// a successor is started; a submap is finished at twice this count.
    #[serde(default = "default_num_range_data")]
    pub num_range_data: usize,

    /// Grid resolution in meters per cell.
    #[serde(default = "default_resolution")]
    pub resolution: f64,

    /// Initial submap grid edge length in cells.
    #[serde(default = "default_grid_size")]
    pub grid_size: usize,
}

fn default_num_range_data() -> usize {
    90
}

fn default_resolution() -> f64 {
    0.05
}

fn default_grid_size() -> usize {
    100
}

impl Default for SubmapConfig {
    fn default() -> Self {
        Self {
            num_range_data: default_num_range_data(),
            resolution: default_resolution(),
            grid_size: default_grid_size(),
        }
    }
}

/// Overlapping-submaps trimmer configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverlappingTrimmerConfig {
    /// How many of the freshest submaps to keep per covered cell.
    #[serde(default = "default_fresh_submaps_count")]
    pub fresh_submaps_count: u16,

    /// Minimum number of cells a submap must win to be kept.
    #[serde(default = "default_min_covered_cells_count")]
    pub min_covered_cells_count: u16,
}

fn default_fresh_submaps_count() -> u16 {
    3
}

fn default_min_covered_cells_count() -> u16 {
    100
}

impl Default for OverlappingTrimmerConfig {
    fn default() -> Self {
        Self {
            fresh_submaps_count: default_fresh_submaps_count(),
            min_covered_cells_count: default_min_covered_cells_count(),
        }
    }
}
