//! Environment Cascade
//!
//! Environment variables are declared at three levels (workflow, job, step)
//! and merged with later layers overriding earlier ones. Local steps also
//! inherit the host process environment; the runner applies the declared
//! values on top of it.

use std::collections::BTreeMap;

/// Ordered stack of environment layers, lowest precedence first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvStack {
    layers: Vec<BTreeMap<String, String>>,
}

impl EnvStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a layer on top of the stack.
    pub fn push(&mut self, layer: BTreeMap<String, String>) {
        self.layers.push(layer);
    }

    /// Returns a copy of this stack with one more layer on top.
    pub fn with_layer(&self, layer: &BTreeMap<String, String>) -> Self {
        let mut stack = self.clone();
        stack.push(layer.clone());
        stack
    }

    /// Merges all declared layers; later layers win.
    pub fn resolve(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for layer in &self.layers {
            for (key, value) in layer {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// Resolves the declared environment for one step.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use localflow::execution::cascade;
///
/// let workflow = BTreeMap::from([("A".to_string(), "1".to_string())]);
/// let job = BTreeMap::from([("A".to_string(), "2".to_string()), ("B".to_string(), "1".to_string())]);
/// let step = BTreeMap::from([("B".to_string(), "2".to_string())]);
///
/// let env = cascade(&workflow, &job, &step);
/// assert_eq!(env["A"], "2");
/// assert_eq!(env["B"], "2");
/// ```
pub fn cascade(
    workflow: &BTreeMap<String, String>,
    job: &BTreeMap<String, String>,
    step: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut stack = EnvStack::new();
    stack.push(workflow.clone());
    stack.push(job.clone());
    stack.push(step.clone());
    stack.resolve()
}
