use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Represents a parsed test flow document
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TestFlow {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub config: Option<FlowConfig>,

    /// Steps executed before the main step list
    #[serde(default)]
    pub before_test: Vec<TestStep>,

    #[serde(default)]
    pub steps: Vec<TestStep>,

    /// Steps executed after the main step list
    #[serde(default)]
    pub after_test: Vec<TestStep>,

    /// Pure delegation to another flow file
    #[serde(default)]
    pub flow: Option<String>,
}

impl TestFlow {
    /// All steps in execution order. `beforeTest`, `steps` and `afterTest`
    /// share one contiguous zero-based index space per file; the reconciler
    /// relies on this numbering.
    pub fn flattened_steps(&self) -> impl Iterator<Item = &TestStep> {
        self.before_test
            .iter()
            .chain(self.steps.iter())
            .chain(self.after_test.iter())
    }

    pub fn step_count(&self) -> usize {
        self.before_test.len() + self.steps.len() + self.after_test.len()
    }

    /// A flow with no steps of its own that only points at another file
    pub fn is_pure_delegation(&self) -> bool {
        self.flow.is_some() && self.step_count() == 0
    }
}

/// Per-flow request configuration. A nested flow's config is shallow-merged
/// over its parent's.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,

    /// Request timeout in milliseconds
    #[serde(default, alias = "timeoutMs")]
    pub timeout: Option<u64>,
}

impl FlowConfig {
    /// Shallow-merge `child` over `self`: fields the child sets win,
    /// everything else is inherited.
    pub fn merged_with(&self, child: Option<&FlowConfig>) -> FlowConfig {
        let Some(child) = child else {
            return self.clone();
        };
        FlowConfig {
            base_url: child.base_url.clone().or_else(|| self.base_url.clone()),
            headers: child.headers.clone().or_else(|| self.headers.clone()),
            timeout: child.timeout.or(self.timeout),
        }
    }
}

/// A single step: either an HTTP action or a reference to another flow file.
/// Exactly one of the two holds per step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TestStep {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,

    #[serde(default)]
    pub body: Option<serde_json::Value>,

    /// Assertions: `status`, `responseTime`, and `body.<path>` keys
    #[serde(default)]
    pub verify: Option<HashMap<String, serde_json::Value>>,

    /// Variable extraction: `var: "body.<path>"`
    #[serde(default)]
    pub extract: Option<HashMap<String, String>>,

    /// Reference to another flow file, resolved relative to this file
    #[serde(default)]
    pub flow: Option<String>,
}

impl TestStep {
    pub fn is_flow_ref(&self) -> bool {
        self.flow.is_some()
    }

    pub fn is_action(&self) -> bool {
        self.url.is_some() || self.method.is_some()
    }

    /// Reject steps that are both an action and a flow reference, or neither
    pub fn validate(&self) -> Result<(), String> {
        match (self.is_flow_ref(), self.is_action()) {
            (true, true) => Err(format!(
                "step '{}' declares both an action and a flow reference",
                self.name
            )),
            (false, false) => Err(format!(
                "step '{}' declares neither an action nor a flow reference",
                self.name
            )),
            _ => Ok(()),
        }
    }

    /// Get a display name for the step
    pub fn display_name(&self) -> String {
        if let Some(ref flow) = self.flow {
            return format!("runFlow(\"{}\")", flow);
        }
        let method = self.method.as_deref().unwrap_or("GET");
        match self.url {
            Some(ref url) if self.name.is_empty() => format!("{} {}", method, url),
            _ if self.name.is_empty() => method.to_string(),
            _ => self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str) -> TestStep {
        TestStep {
            name: name.to_string(),
            method: Some("GET".to_string()),
            url: Some("/x".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_flattened_index_space_is_contiguous() {
        let flow = TestFlow {
            before_test: vec![action("b0")],
            steps: vec![action("s0"), action("s1")],
            after_test: vec![action("a0")],
            ..Default::default()
        };
        let names: Vec<_> = flow.flattened_steps().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b0", "s0", "s1", "a0"]);
        assert_eq!(flow.step_count(), 4);
    }

    #[test]
    fn test_config_shallow_merge() {
        let parent = FlowConfig {
            base_url: Some("https://api.example.com".to_string()),
            headers: Some(HashMap::from([(
                "Authorization".to_string(),
                "Bearer t".to_string(),
            )])),
            timeout: Some(30_000),
        };
        let child = FlowConfig {
            base_url: Some("https://staging.example.com".to_string()),
            headers: None,
            timeout: None,
        };

        let merged = parent.merged_with(Some(&child));
        assert_eq!(merged.base_url.as_deref(), Some("https://staging.example.com"));
        assert!(merged.headers.is_some());
        assert_eq!(merged.timeout, Some(30_000));
    }

    #[test]
    fn test_step_validation() {
        let mut step = action("ok");
        assert!(step.validate().is_ok());

        step.flow = Some("other.yaml".to_string());
        assert!(step.validate().is_err());

        let empty = TestStep {
            name: "bad".to_string(),
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }
}
