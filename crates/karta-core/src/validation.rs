use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::chaos::ChaosActionTree;
use crate::config::KartaConfig;
use crate::types::{JobWork, TestJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

impl ValidationIssue {
    pub fn is_error(&self) -> bool {
        self.level == ValidationLevel::Error
    }
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

impl Validate for KartaConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.test_thread_count == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "test_thread_count.zero",
                message: "test_thread_count must be greater than zero".to_string(),
            });
        }

        for (group, size) in &self.thread_groups {
            if *size == 0 {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Error,
                    code: "thread_groups.size.zero",
                    message: format!("thread group '{group}' has size 0 and can never run a test"),
                });
            }
        }

        if self.minions_enabled && self.minions.is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "minions.enabled.empty",
                message: "minions are enabled but none are configured; runs stay local".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for minion in &self.minions {
            if !seen.insert(minion.name.as_str()) {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Error,
                    code: "minions.name.duplicate",
                    message: format!("minion name '{}' is configured more than once", minion.name),
                });
            }
            if minion.address.trim().is_empty() {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Error,
                    code: "minions.address.empty",
                    message: format!("minion '{}' has no address", minion.name),
                });
            }
        }

        if !self.enabled_plugins.is_empty() {
            let enabled: HashSet<&str> = self.enabled_plugins.iter().map(String::as_str).collect();
            let defaults = self
                .default_step_runner_plugin
                .iter()
                .chain(self.default_feature_source_parser_plugin.iter())
                .chain(self.default_test_data_source_plugins.iter());
            for plugin in defaults {
                if !enabled.contains(plugin.as_str()) {
                    issues.push(ValidationIssue {
                        level: ValidationLevel::Warning,
                        code: "plugins.default.not_enabled",
                        message: format!("default plugin '{plugin}' is not in enabled_plugins"),
                    });
                }
            }
        }

        issues
    }
}

impl Validate for TestJob {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        match &self.work {
            JobWork::Steps { steps } if steps.is_empty() => issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "job.steps.empty",
                message: format!("job '{}' has no steps", self.name),
            }),
            JobWork::Steps { .. } => {}
            JobWork::Chaos { tree } => {
                if let Err(err) = ChaosActionTree::from_spec(tree).validate() {
                    issues.push(ValidationIssue {
                        level: ValidationLevel::Error,
                        code: "job.chaos.invalid",
                        message: format!("job '{}' chaos tree is invalid: {err}", self.name),
                    });
                }
            }
            JobWork::Unsupported => issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "job.kind.unsupported",
                message: format!("job '{}' has an unsupported kind", self.name),
            }),
        }
        issues
    }
}
