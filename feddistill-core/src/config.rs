//! Configuration for feddistill.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistillConfig {
    #[serde(default)]
    pub trainer: TrainerSettings,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

/// Orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSettings {
    /// Rounds of local-only training before distillation starts. Must be >= 1.
    #[serde(default = "default_pretraining_rounds")]
    pub pretraining_rounds: usize,
    /// Local epochs per client per round.
    #[serde(default = "default_num_local_epochs")]
    pub num_local_epochs: usize,
    /// Scoring metric: `acc` or `bacc`.
    #[serde(default = "default_metric")]
    pub metric: String,
    /// Rounds to run when no count is given explicitly.
    #[serde(default = "default_global_epochs")]
    pub global_epochs: usize,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            pretraining_rounds: default_pretraining_rounds(),
            num_local_epochs: default_num_local_epochs(),
            metric: default_metric(),
            global_epochs: default_global_epochs(),
        }
    }
}

fn default_pretraining_rounds() -> usize {
    1
}

fn default_num_local_epochs() -> usize {
    1
}

fn default_metric() -> String {
    "acc".to_string()
}

fn default_global_epochs() -> usize {
    10
}

/// Synthetic federation used by the command-line driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_num_clients")]
    pub num_clients: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_num_features")]
    pub num_features: usize,
    #[serde(default = "default_samples_per_client")]
    pub samples_per_client: usize,
    #[serde(default = "default_reference_size")]
    pub reference_size: usize,
    #[serde(default = "default_test_size")]
    pub test_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Weight of the distillation pass relative to the private pass.
    #[serde(default = "default_distillation_weight")]
    pub distillation_weight: f32,
    /// Number of clients trained on heavily corrupted labels.
    #[serde(default = "default_noisy_clients")]
    pub noisy_clients: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_clients: default_num_clients(),
            num_classes: default_num_classes(),
            num_features: default_num_features(),
            samples_per_client: default_samples_per_client(),
            reference_size: default_reference_size(),
            test_size: default_test_size(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            distillation_weight: default_distillation_weight(),
            noisy_clients: default_noisy_clients(),
            seed: default_seed(),
        }
    }
}

fn default_num_clients() -> usize {
    4
}

fn default_num_classes() -> usize {
    3
}

fn default_num_features() -> usize {
    8
}

fn default_samples_per_client() -> usize {
    120
}

fn default_reference_size() -> usize {
    200
}

fn default_test_size() -> usize {
    100
}

fn default_batch_size() -> usize {
    32
}

fn default_learning_rate() -> f32 {
    0.1
}

fn default_distillation_weight() -> f32 {
    0.5
}

fn default_noisy_clients() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

/// Report output settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Append one JSON line per round to this file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonl_path: Option<PathBuf>,
}

/// Workspace-local config file location.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".feddistill").join("config.toml")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `FEDDISTILL_`)
/// 3. Workspace-local config (`.feddistill/config.toml`)
/// 4. User config (`~/.config/feddistill/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&DistillConfig>,
) -> Result<DistillConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(DistillConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "feddistill", "feddistill") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // FEDDISTILL_TRAINER__METRIC, FEDDISTILL_SIMULATION__SEED, ...
    figment = figment.merge(Env::prefixed("FEDDISTILL_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Load a single explicit config file over the defaults, then environment.
pub fn load_config_file(path: &Path) -> Result<DistillConfig, Box<figment::Error>> {
    Figment::from(Serialized::defaults(DistillConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("FEDDISTILL_").split("__"))
        .extract()
        .map_err(Box::new)
}
