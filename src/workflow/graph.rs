//! Dependency Graph Resolution
//!
//! Builds the job dependency graph from `needs`, condition references and
//! condition `needs`, then provides:
//! - Unknown reference detection
//! - Cycle detection naming every member (strongly connected components)
//! - Deterministic topological layers (Kahn's algorithm, declaration order
//!   breaks ties)
//! - Closure queries for selective runs

use std::collections::HashMap;

use log::debug;

use crate::error::{WorkflowError, WorkflowResult};

use super::model::Workflow;

/// Validated dependency graph over a workflow's jobs.
#[derive(Debug)]
pub struct DependencyGraph<'a> {
    workflow: &'a Workflow,
    /// deps[i] lists the jobs job i waits for
    deps: Vec<Vec<usize>>,
    /// dependents[i] lists the jobs waiting for job i
    dependents: Vec<Vec<usize>>,
}

impl<'a> DependencyGraph<'a> {
    /// Builds the graph, rejecting unknown references and cycles.
    pub fn build(workflow: &'a Workflow) -> WorkflowResult<Self> {
        let index: HashMap<&str, usize> = workflow
            .jobs
            .iter()
            .enumerate()
            .map(|(i, job)| (job.id.as_str(), i))
            .collect();

        let mut deps = vec![Vec::new(); workflow.jobs.len()];
        let mut dependents = vec![Vec::new(); workflow.jobs.len()];

        for (i, job) in workflow.jobs.iter().enumerate() {
            for reference in job.dependencies() {
                let target = *index.get(reference).ok_or_else(|| WorkflowError::UnknownJob {
                    job: job.id.clone(),
                    reference: reference.to_string(),
                })?;
                deps[i].push(target);
                dependents[target].push(i);
            }
        }

        let graph = Self {
            workflow,
            deps,
            dependents,
        };

        let cyclic = graph.cyclic_members();
        if !cyclic.is_empty() {
            return Err(WorkflowError::Cycle {
                members: cyclic
                    .into_iter()
                    .map(|i| workflow.jobs[i].id.clone())
                    .collect(),
            });
        }

        Ok(graph)
    }

    /// Every job, grouped into layers that can run concurrently.
    pub fn order(&self) -> Vec<Vec<String>> {
        let layers = self.layers(&vec![true; self.workflow.jobs.len()]);
        debug!("Resolved layers: {:?}", layers);
        layers
    }

    /// Layers restricted to `target` (id or key) and its transitive
    /// dependencies.
    pub fn closure_for(&self, target: &str) -> WorkflowResult<Vec<Vec<String>>> {
        let start = self
            .workflow
            .get_job(target)
            .and_then(|job| self.workflow.job_index(&job.id))
            .ok_or_else(|| WorkflowError::JobNotFound(target.to_string()))?;

        let mut include = vec![false; self.workflow.jobs.len()];
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if include[node] {
                continue;
            }
            include[node] = true;
            stack.extend(self.deps[node].iter().copied());
        }

        let layers = self.layers(&include);
        debug!("Resolved layers for '{}': {:?}", target, layers);
        Ok(layers)
    }

    fn layers(&self, include: &[bool]) -> Vec<Vec<String>> {
        let mut in_degree: Vec<usize> = self
            .deps
            .iter()
            .map(|deps| deps.iter().filter(|&&d| include[d]).count())
            .collect();

        let mut current: Vec<usize> = (0..self.workflow.jobs.len())
            .filter(|&i| include[i] && in_degree[i] == 0)
            .collect();
        let mut layers = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                for &dependent in &self.dependents[node] {
                    if !include[dependent] {
                        continue;
                    }
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            next.dedup();

            layers.push(
                current
                    .iter()
                    .map(|&i| self.workflow.jobs[i].id.clone())
                    .collect(),
            );
            current = next;
        }

        layers
    }

    /// Jobs on a cycle, sorted by declaration order.
    fn cyclic_members(&self) -> Vec<usize> {
        let mut tarjan = Tarjan::new(&self.deps);
        for v in 0..self.deps.len() {
            if tarjan.index[v].is_none() {
                tarjan.strong_connect(v);
            }
        }

        let mut members: Vec<usize> = tarjan
            .components
            .into_iter()
            .filter(|c| c.len() > 1 || self.deps[c[0]].contains(&c[0]))
            .flatten()
            .collect();
        members.sort_unstable();
        members
    }
}

/// Tarjan's strongly connected components.
struct Tarjan<'g> {
    deps: &'g [Vec<usize>],
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next: usize,
    components: Vec<Vec<usize>>,
}

impl<'g> Tarjan<'g> {
    fn new(deps: &'g [Vec<usize>]) -> Self {
        let n = deps.len();
        Self {
            deps,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next: 0,
            components: Vec::new(),
        }
    }

    fn strong_connect(&mut self, v: usize) {
        self.index[v] = Some(self.next);
        self.lowlink[v] = self.next;
        self.next += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        let deps = self.deps;
        for &w in &deps[v] {
            match self.index[w] {
                None => {
                    self.strong_connect(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

/// Resolves the full execution order of a workflow.
pub fn resolve(workflow: &Workflow) -> WorkflowResult<Vec<Vec<String>>> {
    Ok(DependencyGraph::build(workflow)?.order())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Job, Step};

    fn job(id: &str, needs: &[&str]) -> Job {
        let mut job = Job::new(id).with_step(Step::new("s", "true"));
        for need in needs {
            job = job.depends_on(*need);
        }
        job
    }

    fn layers(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|layer| layer.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_linear_order() {
        let workflow = Workflow::from_jobs(
            "wf",
            vec![job("test", &["setup"]), job("setup", &[]), job("deploy", &["test"])],
        );

        assert_eq!(
            resolve(&workflow).unwrap(),
            layers(&[&["setup"], &["test"], &["deploy"]])
        );
    }

    #[test]
    fn test_diamond_layers_follow_declaration_order() {
        let workflow = Workflow::from_jobs(
            "wf",
            vec![
                job("root", &[]),
                job("right", &["root"]),
                job("left", &["root"]),
                job("join", &["left", "right"]),
                job("solo", &[]),
            ],
        );

        assert_eq!(
            resolve(&workflow).unwrap(),
            layers(&[&["root", "solo"], &["right", "left"], &["join"]])
        );
    }

    #[test]
    fn test_every_job_after_its_dependencies() {
        let workflow = Workflow::from_jobs(
            "wf",
            vec![
                job("e", &["d", "a"]),
                job("d", &["b", "c"]),
                job("c", &["a"]),
                job("b", &["a"]),
                job("a", &[]),
            ],
        );

        let order: Vec<String> = resolve(&workflow).unwrap().into_iter().flatten().collect();
        let position = |id: &str| order.iter().position(|j| j == id).unwrap();
        for job in &workflow.jobs {
            for dep in job.dependencies() {
                assert!(position(dep) < position(&job.id), "{} before {}", dep, job.id);
            }
        }
        assert_eq!(order.len(), 5);
    }

    #[test]
    fn test_cycle_names_all_members() {
        let workflow = Workflow::from_jobs(
            "wf",
            vec![
                job("ok", &[]),
                job("a", &["c"]),
                job("b", &["a"]),
                job("c", &["b"]),
                job("after", &["a"]),
            ],
        );

        match resolve(&workflow) {
            Err(WorkflowError::Cycle { members }) => assert_eq!(members, vec!["a", "b", "c"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let workflow = Workflow::from_jobs("wf", vec![job("loop", &["loop"]), job("x", &[])]);

        match resolve(&workflow) {
            Err(WorkflowError::Cycle { members }) => assert_eq!(members, vec!["loop"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_disjoint_cycles_all_reported() {
        let workflow = Workflow::from_jobs(
            "wf",
            vec![job("a", &["b"]), job("b", &["a"]), job("c", &["d"]), job("d", &["c"])],
        );

        match resolve(&workflow) {
            Err(WorkflowError::Cycle { members }) => {
                assert_eq!(members, vec!["a", "b", "c", "d"])
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_reference() {
        let workflow = Workflow::from_jobs("wf", vec![job("a", &[]), job("b", &["ghost"])]);

        match resolve(&workflow) {
            Err(WorkflowError::UnknownJob { job, reference }) => {
                assert_eq!(job, "b");
                assert_eq!(reference, "ghost");
            }
            other => panic!("expected unknown job, got {:?}", other),
        }
    }

    #[test]
    fn test_condition_reference_is_edge() {
        let workflow = Workflow::from_jobs(
            "wf",
            vec![
                job("report", &[]).with_condition("not build").unwrap(),
                job("build", &[]),
            ],
        );

        assert_eq!(
            resolve(&workflow).unwrap(),
            layers(&[&["build"], &["report"]])
        );
    }

    #[test]
    fn test_unknown_condition_reference() {
        let workflow = Workflow::from_jobs(
            "wf",
            vec![job("a", &[]).with_condition("a_typo").unwrap()],
        );
        assert!(matches!(
            resolve(&workflow),
            Err(WorkflowError::UnknownJob { .. })
        ));
    }

    #[test]
    fn test_closure_for_target() {
        let workflow = Workflow::from_jobs(
            "wf",
            vec![
                job("setup", &[]),
                job("lint", &[]),
                job("build", &["setup"]),
                job("test", &["build"]),
                job("docs", &["setup"]),
            ],
        );
        let graph = DependencyGraph::build(&workflow).unwrap();

        assert_eq!(
            graph.closure_for("test").unwrap(),
            layers(&[&["setup"], &["build"], &["test"]])
        );
        assert_eq!(graph.closure_for("setup").unwrap(), layers(&[&["setup"]]));
        assert!(matches!(
            graph.closure_for("nope"),
            Err(WorkflowError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_closure_accepts_job_key() {
        let workflow = Workflow::from_jobs(
            "wf",
            vec![
                Job::new("job_aaaa").with_key("build"),
                Job::new("job_bbbb").with_key("test").depends_on("job_aaaa"),
            ],
        );
        let graph = DependencyGraph::build(&workflow).unwrap();

        assert_eq!(
            graph.closure_for("test").unwrap(),
            layers(&[&["job_aaaa"], &["job_bbbb"]])
        );
    }

    #[test]
    fn test_empty_workflow_has_no_layers() {
        let workflow = Workflow::new("wf", "empty");
        assert!(resolve(&workflow).unwrap().is_empty());
    }
}
