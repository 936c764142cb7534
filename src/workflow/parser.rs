//! Workflow Parser
//!
//! Handles loading and parsing workflow definitions from YAML files.
//! Parsing is a validating constructor: defaults are filled in, job
//! references written as job keys are normalized to job ids, conditions are
//! parsed once, and the result is validated (structure, references, cycles)
//! before it is returned.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_yaml::Value;
use sha2::{Digest, Sha256};

use crate::error::{WorkflowError, WorkflowResult};
use crate::events::EventTriggerSpec;
use crate::output::OutputConfig;

use super::condition::Condition;
use super::model::{Job, Step, Workflow};
use super::validator::validate_workflow;

/// Generates a deterministic id of the form `<prefix>_<sha256[:8]>`.
///
/// # Example
///
/// ```
/// use localflow::workflow::generate_id;
///
/// let id = generate_id("wf", "/home/me/.localflow/workflows/ci.yml");
/// assert!(id.starts_with("wf_"));
/// assert_eq!(id.len(), 11);
/// ```
pub fn generate_id(prefix: &str, content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("{}_{}", prefix, &hex::encode(digest)[..8])
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// Deserializes either a single string or a list of strings.
pub fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) if s.trim().is_empty() => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(items)) => items,
    })
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Environment maps accept any scalar value and store it as text.
fn env_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    raw.into_iter()
        .map(|(key, value)| match scalar_to_string(value) {
            Some(value) => Ok((key, value)),
            None => Err(de::Error::custom(format!(
                "environment variable '{}' must be a scalar",
                key
            ))),
        })
        .collect()
}

fn optional_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_to_string(value)
            .map(Some)
            .ok_or_else(|| de::Error::custom("expected a scalar value")),
    }
}

#[derive(Debug, Deserialize)]
struct RawWorkflow {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    #[serde(default, deserialize_with = "optional_scalar")]
    version: Option<String>,
    author: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    tags: Vec<String>,
    #[serde(default, deserialize_with = "env_map")]
    env: BTreeMap<String, String>,
    image: Option<String>,
    #[serde(default)]
    jobs: serde_yaml::Mapping,
    #[serde(default)]
    events: Vec<EventTriggerSpec>,
    output: Option<OutputConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawJob {
    id: Option<String>,
    description: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    tags: Vec<String>,
    #[serde(default, deserialize_with = "env_map")]
    env: BTreeMap<String, String>,
    image: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default, deserialize_with = "one_or_many")]
    needs: Vec<String>,
    #[serde(rename = "if", alias = "condition")]
    condition: Option<RawCondition>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    name: Option<String>,
    run: String,
    #[serde(alias = "working-directory")]
    working_dir: Option<PathBuf>,
    #[serde(default, deserialize_with = "env_map")]
    env: BTreeMap<String, String>,
    #[serde(default)]
    local: bool,
    image: Option<String>,
    #[serde(rename = "if", alias = "condition")]
    condition: Option<RawCondition>,
    #[serde(default, alias = "continue-on-error")]
    continue_on_error: bool,
    shell: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCondition {
    Flag(bool),
    Expression(String),
    Detailed {
        #[serde(rename = "if")]
        expression: Option<String>,
        #[serde(default, deserialize_with = "one_or_many")]
        needs: Vec<String>,
    },
}

impl RawCondition {
    fn into_condition(self) -> WorkflowResult<Condition> {
        Ok(match self {
            RawCondition::Flag(true) => Condition::always(),
            RawCondition::Flag(false) => Condition::parse("false")?,
            RawCondition::Expression(expression) => Condition::parse(&expression)?,
            RawCondition::Detailed { expression, needs } => {
                Condition::parse(expression.as_deref().unwrap_or("true"))?.with_needs(needs)
            }
        })
    }
}

fn parse_error(origin: &str, message: impl ToString) -> WorkflowError {
    WorkflowError::Parse {
        origin: origin.to_string(),
        message: message.to_string(),
    }
}

fn build_step(raw: RawStep, index: usize) -> WorkflowResult<Step> {
    Ok(Step {
        name: raw
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("step {}", index + 1)),
        run: raw.run,
        working_dir: raw.working_dir,
        env: raw.env,
        local: raw.local,
        image: raw.image,
        condition: raw.condition.map(RawCondition::into_condition).transpose()?,
        continue_on_error: raw.continue_on_error,
        shell: raw.shell,
    })
}

fn build_job(workflow_id: &str, key: String, raw: RawJob) -> WorkflowResult<Job> {
    let id = raw
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| generate_id("job", &format!("{}_{}", workflow_id, key)));

    let steps = raw
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, step)| build_step(step, i))
        .collect::<WorkflowResult<Vec<_>>>()?;

    let mut needs: Vec<String> = Vec::new();
    for need in raw.needs {
        if !needs.contains(&need) {
            needs.push(need);
        }
    }

    Ok(Job {
        key,
        id,
        description: raw.description,
        tags: raw.tags.into_iter().collect(),
        env: raw.env,
        image: raw.image,
        steps,
        needs,
        condition: raw.condition.map(RawCondition::into_condition).transpose()?,
    })
}

/// Rewrites references written as job keys into job ids.
fn normalize_references(workflow: &mut Workflow) {
    let ids: HashSet<String> = workflow.jobs.iter().map(|j| j.id.clone()).collect();
    let keys: HashMap<String, String> = workflow
        .jobs
        .iter()
        .map(|j| (j.key.clone(), j.id.clone()))
        .collect();

    let normalize = |reference: &str| -> Option<String> {
        if ids.contains(reference) {
            None
        } else {
            keys.get(reference).cloned()
        }
    };

    for job in &mut workflow.jobs {
        for need in &mut job.needs {
            if let Some(id) = normalize(need) {
                debug!("Job '{}': need '{}' resolved to '{}'", job.key, need, id);
                *need = id;
            }
        }
        if let Some(condition) = &mut job.condition {
            condition.rename_references(normalize);
        }
        for step in &mut job.steps {
            if let Some(condition) = &mut step.condition {
                condition.rename_references(normalize);
            }
        }
    }

    let workflow_id = workflow.id.clone();
    for event in &mut workflow.events {
        if event.workflow_id != workflow_id {
            continue;
        }
        for job in &mut event.job_ids {
            if let Some(id) = normalize(job) {
                *job = id;
            }
        }
    }
}

/// Parses and validates a workflow from YAML text.
///
/// # Arguments
///
/// * `content` - YAML document
/// * `source` - File the document came from; used for the default id and
///   name and to resolve relative watch paths
pub fn parse_workflow(content: &str, source: Option<&Path>) -> WorkflowResult<Workflow> {
    let origin = source
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<inline>".to_string());

    let raw: RawWorkflow = serde_yaml::from_str(content).map_err(|e| parse_error(&origin, e))?;

    let id = raw
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| match source {
            Some(path) => generate_id("wf", &path.display().to_string()),
            None => generate_id("wf", content),
        });

    let name = raw
        .name
        .or_else(|| {
            source
                .and_then(Path::file_stem)
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| id.clone());

    let mut jobs = Vec::with_capacity(raw.jobs.len());
    for (key, value) in raw.jobs {
        let key = match key {
            Value::String(key) => key,
            other => {
                return Err(parse_error(
                    &origin,
                    format!("job keys must be strings, found {:?}", other),
                ))
            }
        };
        let raw_job: RawJob = match value {
            Value::Null => RawJob::default(),
            value => serde_yaml::from_value(value)
                .map_err(|e| parse_error(&origin, format!("job '{}': {}", key, e)))?,
        };
        jobs.push(build_job(&id, key, raw_job)?);
    }

    let base_dir = source.and_then(Path::parent);
    let mut events = Vec::with_capacity(raw.events.len());
    for (index, spec) in raw.events.into_iter().enumerate() {
        let trigger = spec
            .compile(&id, base_dir)
            .map_err(|e| WorkflowError::Validation(vec![format!("Event #{}: {}", index, e)]))?;
        events.push(trigger);
    }

    let mut workflow = Workflow {
        id,
        name,
        description: raw.description,
        version: raw.version.unwrap_or_else(|| "1.0.0".to_string()),
        author: raw.author,
        tags: raw.tags.into_iter().collect(),
        env: raw.env,
        image: raw.image,
        jobs,
        events,
        output: raw.output,
        source: source.map(Path::to_path_buf),
    };

    normalize_references(&mut workflow);
    validate_workflow(&workflow)?;

    Ok(workflow)
}

/// Loads a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use localflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("ci.yml")?;
///     println!("Loaded {} jobs", workflow.jobs.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> WorkflowResult<Workflow> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| WorkflowError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let source = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    let workflow = parse_workflow(&content, Some(&source))?;
    info!(
        "Loaded workflow '{}' ({}) with {} jobs",
        workflow.name,
        workflow.id,
        workflow.jobs.len()
    );
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CI: &str = r#"
id: wf_ci
name: CI
tags: [build, nightly]
env:
  LEVEL: workflow
  RETRIES: 3
jobs:
  setup:
    id: job_setup
    steps:
      - run: echo setup
  test:
    needs: setup
    steps:
      - name: unit
        run: echo test
        env:
          LEVEL: step
  report:
    needs: [test]
    if: not test
    steps:
      - run: echo report
        local: true
"#;

    #[test]
    fn test_parse_full_workflow() {
        let workflow = parse_workflow(CI, None).unwrap();

        assert_eq!(workflow.id, "wf_ci");
        assert_eq!(workflow.name, "CI");
        assert_eq!(workflow.version, "1.0.0");
        assert!(workflow.has_tag("nightly"));
        assert_eq!(workflow.env["RETRIES"], "3");
        assert_eq!(workflow.jobs.len(), 3);

        let setup = &workflow.jobs[0];
        assert_eq!(setup.id, "job_setup");
        assert_eq!(setup.steps[0].name, "step 1");

        let test = workflow.get_job("test").unwrap();
        assert_eq!(test.id, generate_id("job", "wf_ci_test"));
        assert_eq!(test.needs, vec!["job_setup"]);
        assert_eq!(test.steps[0].env["LEVEL"], "step");

        let report = workflow.get_job("report").unwrap();
        assert_eq!(report.needs, vec![test.id.clone()]);
        assert_eq!(report.condition_references(), vec![test.id.as_str()]);
        assert!(report.steps[0].local);
    }

    #[test]
    fn test_condition_forms() {
        let yaml = r#"
id: wf
jobs:
  a:
    steps: [{run: "true"}]
  b:
    if: true
    steps: [{run: "true"}]
  c:
    condition:
      if: "a or b"
      needs: [a]
    steps:
      - run: "true"
        if: "'a'"
"#;
        let workflow = parse_workflow(yaml, None).unwrap();
        let b = workflow.get_job("b").unwrap();
        assert_eq!(b.condition.as_ref().unwrap().source(), "true");

        let c = workflow.get_job("c").unwrap();
        let condition = c.condition.as_ref().unwrap();
        assert_eq!(condition.source(), "a or b");
        let a_id = workflow.get_job("a").unwrap().id.clone();
        assert_eq!(condition.needs(), &[a_id.clone()]);
        assert_eq!(
            c.steps[0].condition.as_ref().unwrap().references(),
            vec![a_id.as_str()]
        );
    }

    #[test]
    fn test_missing_run_is_parse_error() {
        let yaml = "id: wf\njobs:\n  a:\n    steps:\n      - name: nothing\n";
        assert!(matches!(
            parse_workflow(yaml, None),
            Err(WorkflowError::Parse { .. })
        ));
    }

    #[test]
    fn test_unknown_step_field_rejected() {
        let yaml = "id: wf\njobs:\n  a:\n    steps:\n      - run: echo\n        retries: 3\n";
        match parse_workflow(yaml, None) {
            Err(WorkflowError::Parse { message, .. }) => assert!(message.contains("retries")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let yaml = "id: wf\njobs:\n  a:\n    steps: echo hi\n";
        assert!(matches!(
            parse_workflow(yaml, None),
            Err(WorkflowError::Parse { .. })
        ));
    }

    #[test]
    fn test_bad_condition_rejected_at_load() {
        let yaml = "id: wf\njobs:\n  a:\n    if: 'a and'\n    steps: [{run: 'true'}]\n";
        match parse_workflow(yaml, None) {
            Err(WorkflowError::ConditionSyntax(err)) => assert_eq!(err.fragment, "and"),
            other => panic!("expected condition syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_need_rejected_at_load() {
        let yaml = "id: wf\njobs:\n  a:\n    needs: [ghost]\n    steps: [{run: 'true'}]\n";
        match parse_workflow(yaml, None) {
            Err(WorkflowError::UnknownJob { reference, .. }) => assert_eq!(reference, "ghost"),
            other => panic!("expected unknown job, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_rejected_at_load() {
        let yaml = r#"
id: wf
jobs:
  a: {needs: [b], steps: [{run: "true"}]}
  b: {needs: [a], steps: [{run: "true"}]}
"#;
        assert!(matches!(
            parse_workflow(yaml, None),
            Err(WorkflowError::Cycle { .. })
        ));
    }

    #[test]
    fn test_empty_job_rejected() {
        let yaml = "id: wf\njobs:\n  a:\n";
        assert!(matches!(
            parse_workflow(yaml, None),
            Err(WorkflowError::Validation(_))
        ));
    }

    #[test]
    fn test_events_compile_and_normalize_jobs() {
        let yaml = r#"
id: wf_events
jobs:
  ingest:
    steps: [{run: "true"}]
events:
  - type: file_create
    jobs: [ingest]
    trigger:
      paths: /tmp/inbox
      patterns: ["*.csv"]
      recursive: true
      max_depth: 2
"#;
        let workflow = parse_workflow(yaml, None).unwrap();
        let event = &workflow.events[0];
        assert_eq!(event.kind, EventKind::Create);
        assert_eq!(event.workflow_id, "wf_events");
        assert_eq!(event.job_ids, vec![workflow.jobs[0].id.clone()]);
        assert_eq!(event.filter.max_depth, Some(2));
    }

    #[test]
    fn test_invalid_event_pattern_rejected() {
        let yaml = r#"
id: wf
jobs:
  a: {steps: [{run: "true"}]}
events:
  - type: create
    trigger: {paths: [/tmp], patterns: ["re:(oops"]}
"#;
        assert!(matches!(
            parse_workflow(yaml, None),
            Err(WorkflowError::Validation(_))
        ));
    }

    #[test]
    fn test_load_workflow_defaults_from_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "jobs:\n  build:\n    steps:\n      - run: echo build").unwrap();

        let workflow = load_workflow(file.path()).unwrap();
        let canonical = fs::canonicalize(file.path()).unwrap();

        assert_eq!(workflow.id, generate_id("wf", &canonical.display().to_string()));
        assert_eq!(
            workflow.name,
            canonical.file_stem().unwrap().to_string_lossy()
        );
        assert_eq!(workflow.source.as_deref(), Some(canonical.as_path()));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            load_workflow("/nonexistent/localflow/workflow.yml"),
            Err(WorkflowError::Read { .. })
        ));
    }

    #[test]
    fn test_generate_id_is_deterministic() {
        assert_eq!(generate_id("job", "abc"), generate_id("job", "abc"));
        assert_ne!(generate_id("job", "abc"), generate_id("job", "abd"));
        assert_eq!(generate_id("wf", ""), "wf_e3b0c442");
    }
}
