//! Target distribution over task categories.
//!
//! Weights need not sum to 1; they are normalized when the sampler computes
//! target counts. Each category may also name the toolsets offered to the
//! model for its tasks.
//!
//! ```yaml
//! categories:
//!   browser: { weight: 0.5, toolsets: [browser, web] }
//!   research: 0.3
//! unweighted: { weight: 0.2 }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::task::Task;
use crate::error::ConfigError;

/// Bucket name for tasks whose category has no configured weight.
pub const UNWEIGHTED: &str = "unweighted";

/// Weight and toolsets for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CategoryRepr")]
pub struct CategorySpec {
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub toolsets: Vec<String>,
}

impl CategorySpec {
    pub fn new(weight: f64) -> Self {
        Self {
            weight,
            toolsets: Vec::new(),
        }
    }

    pub fn with_toolsets(mut self, toolsets: Vec<String>) -> Self {
        self.toolsets = toolsets;
        self
    }
}

/// Accepts either a bare weight or the full object form.
#[derive(Deserialize)]
#[serde(untagged)]
enum CategoryRepr {
    Weight(f64),
    Full {
        weight: f64,
        #[serde(default)]
        toolsets: Vec<String>,
    },
}

impl From<CategoryRepr> for CategorySpec {
    fn from(repr: CategoryRepr) -> Self {
        match repr {
            CategoryRepr::Weight(weight) => CategorySpec::new(weight),
            CategoryRepr::Full { weight, toolsets } => CategorySpec { weight, toolsets },
        }
    }
}

/// Mapping from category to target weight, plus the fallback bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionSpec {
    #[serde(default)]
    pub categories: BTreeMap<String, CategorySpec>,
    /// Weight of the bucket that collects uncategorized tasks and tasks whose
    /// category is not listed. `None` makes such tasks a configuration error.
    #[serde(default)]
    pub unweighted: Option<CategorySpec>,
}

impl Default for DistributionSpec {
    fn default() -> Self {
        Self::uniform()
    }
}

impl DistributionSpec {
    /// A distribution with no categories where every task lands in the
    /// fallback bucket.
    pub fn uniform() -> Self {
        Self {
            categories: BTreeMap::new(),
            unweighted: Some(CategorySpec::new(1.0)),
        }
    }

    /// A strict distribution with no fallback bucket.
    pub fn strict() -> Self {
        Self {
            categories: BTreeMap::new(),
            unweighted: None,
        }
    }

    /// Adds or replaces a category weight.
    pub fn with_category(mut self, name: impl Into<String>, weight: f64) -> Self {
        self.categories.insert(name.into(), CategorySpec::new(weight));
        self
    }

    /// Adds or replaces a category with its toolsets.
    pub fn with_category_spec(mut self, name: impl Into<String>, spec: CategorySpec) -> Self {
        self.categories.insert(name.into(), spec);
        self
    }

    /// Sets the fallback bucket weight.
    pub fn with_unweighted(mut self, weight: f64) -> Self {
        self.unweighted = Some(CategorySpec::new(weight));
        self
    }

    /// Removes the fallback bucket.
    pub fn without_unweighted(mut self) -> Self {
        self.unweighted = None;
        self
    }

    /// Parses a distribution from YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let spec: DistributionSpec = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Reads and parses a distribution file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Checks that every weight is finite and non-negative, and that the
    /// weights do not all vanish.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let entries = self
            .categories
            .iter()
            .map(|(name, spec)| (name.as_str(), spec))
            .chain(self.unweighted.iter().map(|spec| (UNWEIGHTED, spec)));

        let mut any = false;
        let mut total = 0.0;
        for (name, spec) in entries {
            any = true;
            if !spec.weight.is_finite() || spec.weight < 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("distribution.{}", name),
                    message: format!("weight must be a non-negative number, got {}", spec.weight),
                });
            }
            total += spec.weight;
        }

        if !any {
            return Err(ConfigError::ValidationFailed(
                "distribution has no categories and no unweighted bucket".to_string(),
            ));
        }
        if total <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "distribution weights sum to zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks that every toolset named by a category exists.
    pub fn validate_toolsets(&self, known: &BTreeSet<String>) -> Result<(), ConfigError> {
        let entries = self
            .categories
            .iter()
            .map(|(name, spec)| (name.as_str(), spec))
            .chain(self.unweighted.iter().map(|spec| (UNWEIGHTED, spec)));

        for (category, spec) in entries {
            for toolset in &spec.toolsets {
                if !known.contains(toolset) {
                    return Err(ConfigError::UnknownToolset {
                        category: category.to_string(),
                        toolset: toolset.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolves the bucket a task is counted under.
    pub fn bucket_for(&self, task: &Task) -> Result<String, ConfigError> {
        if let Some(category) = task.category.as_deref() {
            if self.categories.contains_key(category) {
                return Ok(category.to_string());
            }
        }

        if self.unweighted.is_some() {
            return Ok(UNWEIGHTED.to_string());
        }

        Err(ConfigError::UnweightedCategory {
            category: task
                .category
                .clone()
                .unwrap_or_else(|| "<uncategorized>".to_string()),
        })
    }

    /// Weight of a bucket, zero for unknown buckets.
    pub fn weight(&self, bucket: &str) -> f64 {
        self.spec(bucket).map(|s| s.weight).unwrap_or(0.0)
    }

    /// Toolsets configured for a bucket; empty means every tool.
    pub fn toolsets(&self, bucket: &str) -> &[String] {
        self.spec(bucket)
            .map(|s| s.toolsets.as_slice())
            .unwrap_or(&[])
    }

    /// Every bucket that carries a weight, in name order.
    pub fn buckets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.categories.keys().cloned().collect();
        if self.unweighted.is_some() && !self.categories.contains_key(UNWEIGHTED) {
            names.push(UNWEIGHTED.to_string());
            names.sort();
        }
        names
    }

    fn spec(&self, bucket: &str) -> Option<&CategorySpec> {
        match self.categories.get(bucket) {
            Some(spec) => Some(spec),
            None if bucket == UNWEIGHTED => self.unweighted.as_ref(),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_both_forms() {
        let yaml = r#"
categories:
  browser: { weight: 0.5, toolsets: [browser, web] }
  research: 0.3
unweighted: 0.2
"#;
        let spec = DistributionSpec::from_yaml_str(yaml).expect("should parse");
        assert_eq!(spec.categories.len(), 2);
        assert!((spec.weight("browser") - 0.5).abs() < f64::EPSILON);
        assert_eq!(spec.toolsets("browser"), &["browser".to_string(), "web".to_string()]);
        assert!(spec.toolsets("research").is_empty());
        assert!((spec.weight(UNWEIGHTED) - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_negative_weight_rejected() {
        let err = DistributionSpec::from_yaml_str("categories:\n  a: -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_empty_strict_distribution_rejected() {
        let err = DistributionSpec::strict().validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_all_zero_weights_rejected() {
        let yaml = "categories:\n  a: 0.0\n  b: 0\nunweighted: 0.0\n";
        let err = DistributionSpec::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));

        // A zero weight alongside a positive one is fine.
        let spec = DistributionSpec::strict()
            .with_category("a", 0.0)
            .with_category("b", 1.0);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_bucket_resolution() {
        let spec = DistributionSpec::uniform().with_category("web", 1.0);
        let web = Task::new(0, "a").with_category("web");
        let other = Task::new(1, "b").with_category("vision");
        let none = Task::new(2, "c");

        assert_eq!(spec.bucket_for(&web).expect("weighted"), "web");
        assert_eq!(spec.bucket_for(&other).expect("fallback"), UNWEIGHTED);
        assert_eq!(spec.bucket_for(&none).expect("fallback"), UNWEIGHTED);
    }

    #[test]
    fn test_bucket_without_fallback_is_config_error() {
        let spec = DistributionSpec::strict().with_category("web", 1.0);
        let task = Task::new(0, "a").with_category("vision");
        let err = spec.bucket_for(&task).unwrap_err();
        assert!(matches!(err, ConfigError::UnweightedCategory { category } if category == "vision"));
    }

    #[test]
    fn test_unknown_toolset_rejected() {
        let spec = DistributionSpec::strict().with_category_spec(
            "browser",
            CategorySpec::new(1.0).with_toolsets(vec!["browser".to_string()]),
        );
        let known: BTreeSet<String> = ["terminal".to_string()].into_iter().collect();
        let err = spec.validate_toolsets(&known).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownToolset { .. }));
    }

    #[test]
    fn test_buckets_include_fallback() {
        let spec = DistributionSpec::uniform().with_category("web", 1.0);
        assert_eq!(spec.buckets(), vec!["unweighted".to_string(), "web".to_string()]);
    }
}
