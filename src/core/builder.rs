//! Graph builder: binds rule templates to samples and wires the DAG.
//!
//! Binding happens in three passes. First every template is instantiated per
//! sample (or once, for aggregate templates) with all paths resolved to
//! strings. Then every output path is assigned its single owner. Finally each
//! input is matched against the owners by exact string comparison, and the
//! graph is sealed with a topological sort.

use crate::core::dag::TaskGraph;
use crate::core::sample::{Sample, SampleRegistry};
use crate::core::task::{Binding, NamedPath, Task, TaskId};
use crate::core::template::{substitute, wildcards, PathSpec, Port, RuleTemplate, Scope};
use crate::error::{Error, Result};
use crate::{mlog, mlog_debug};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Builds a `TaskGraph` from templates and a sample registry.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    output_root: PathBuf,
}

impl GraphBuilder {
    /// Relative template paths are placed under `output_root`.
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Bind every template and return the sealed graph.
    ///
    /// # Errors
    /// - `UnresolvedWildcard` for a placeholder the binding cannot fill
    /// - `DuplicateOutput` when two tasks declare the same output path
    /// - `DanglingInput` for an input nothing produces and nobody supplies
    /// - `CyclicGraph` when outputs feed back into their own ancestors
    pub fn build(&self, templates: &[RuleTemplate], samples: &SampleRegistry) -> Result<TaskGraph> {
        let templates = index_templates(templates)?;

        let mut tasks = Vec::new();
        for template in templates.ordered.iter() {
            for binding in bindings(template, samples) {
                tasks.push(self.bind(template, &binding, &templates, samples)?);
            }
        }

        let mut owners: HashMap<String, TaskId> = HashMap::new();
        for task in &tasks {
            for output in &task.outputs {
                if let Some(first) = owners.insert(output.path.clone(), task.id.clone()) {
                    return Err(Error::DuplicateOutput {
                        path: output.path.clone(),
                        first: first.to_string(),
                        second: task.id.to_string(),
                    });
                }
            }
        }

        let supplied: HashSet<String> = samples
            .iter()
            .flat_map(|s| s.inputs.values())
            .map(|p| p.to_string_lossy().into_owned())
            .collect();

        let mut edges = Vec::new();
        for task in &tasks {
            for input in &task.inputs {
                match owners.get(&input.path) {
                    Some(owner) => edges.push((owner.clone(), task.id.clone(), input.path.clone())),
                    None if supplied.contains(&input.path) || Path::new(&input.path).exists() => {}
                    None => {
                        return Err(Error::DanglingInput {
                            task: task.id.to_string(),
                            path: input.path.clone(),
                        })
                    }
                }
            }
        }

        let mut graph = TaskGraph::new();
        for task in tasks {
            graph.add_task(task)?;
        }
        for (from, to, path) in &edges {
            graph.add_dependency(from, to, path)?;
        }
        graph.seal()?;

        mlog!(
            "Built task graph: {} tasks, {} dependencies over {} samples",
            graph.task_count(),
            graph.dependency_count(),
            samples.len()
        );
        Ok(graph)
    }

    fn bind(
        &self,
        template: &Arc<RuleTemplate>,
        binding: &Binding,
        templates: &TemplateIndex,
        samples: &SampleRegistry,
    ) -> Result<Task> {
        let id = TaskId::new(template.name.clone(), binding.clone());
        let sample = binding.sample().and_then(|s| samples.get(s));

        let mut outputs = Vec::new();
        for port in &template.outputs {
            if let Some(path) = self.resolve_output(template, port, sample)? {
                outputs.push(NamedPath::new(port.name.clone(), path));
            }
        }

        let mut inputs = Vec::new();
        for port in &template.inputs {
            let paths = self.resolve_input(template, port, sample, templates, samples)?;
            if paths.is_empty() && port.requires_role.is_none() && !samples.is_empty() {
                return Err(Error::DanglingInput {
                    task: id.to_string(),
                    path: describe_spec(&port.spec),
                });
            }
            inputs.extend(paths.into_iter().map(|p| NamedPath::new(port.name.clone(), p)));
        }

        mlog_debug!(
            "Bound {}: {} input(s), {} output(s)",
            id,
            inputs.len(),
            outputs.len()
        );
        Ok(Task::new(id, Arc::clone(template), inputs, outputs))
    }

    /// Resolve one output port for one binding. `None` if the port does not
    /// exist for this sample.
    fn resolve_output(
        &self,
        template: &RuleTemplate,
        port: &Port,
        sample: Option<&Sample>,
    ) -> Result<Option<String>> {
        if !port_applies(port, sample) {
            return Ok(None);
        }
        let path = match &port.spec {
            PathSpec::Literal(path) => path.clone(),
            PathSpec::Wildcard(pattern) => fill(template, pattern, sample)?,
            other => {
                return Err(Error::Validation(format!(
                    "rule {} output {} must be a literal or wildcard path, not {}",
                    template.name,
                    port.name,
                    describe_spec(other)
                )))
            }
        };
        Ok(Some(self.under_root(&path)))
    }

    fn resolve_input(
        &self,
        template: &RuleTemplate,
        port: &Port,
        sample: Option<&Sample>,
        templates: &TemplateIndex,
        samples: &SampleRegistry,
    ) -> Result<Vec<String>> {
        if !port_applies(port, sample) {
            return Ok(Vec::new());
        }
        match &port.spec {
            PathSpec::Literal(path) => Ok(vec![self.under_root(path)]),
            PathSpec::Wildcard(pattern) => match sample {
                Some(_) => Ok(vec![self.under_root(&fill(template, pattern, sample)?)]),
                None if wildcards(pattern).is_empty() => Ok(vec![self.under_root(pattern)]),
                // Aggregate inputs expand once per sample.
                None => samples
                    .iter()
                    .map(|s| fill(template, pattern, Some(s)).map(|p| self.under_root(&p)))
                    .collect(),
            },
            PathSpec::SampleInput(role) => match sample {
                Some(s) => match s.input(role) {
                    Some(path) => Ok(vec![path.to_string_lossy().into_owned()]),
                    None => Err(Error::MalformedInput(format!(
                        "sample {} lacks input \"{}\" required by rule {}",
                        s.id, role, template.name
                    ))),
                },
                None => Ok(samples
                    .iter()
                    .filter_map(|s| s.input(role))
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect()),
            },
            PathSpec::OutputOf { rule, port: name } => {
                let producer = templates.get(rule).ok_or_else(|| {
                    Error::Validation(format!(
                        "rule {} references unknown rule {}",
                        template.name, rule
                    ))
                })?;
                let produced = producer.output_port(name).ok_or_else(|| {
                    Error::Validation(format!(
                        "rule {} references unknown output {}.{}",
                        template.name, rule, name
                    ))
                })?;
                match (producer.scope, sample) {
                    (Scope::PerSample, Some(s)) => {
                        Ok(self.resolve_output(producer, produced, Some(s))?.into_iter().collect())
                    }
                    (Scope::PerSample, None) => {
                        let mut paths = Vec::new();
                        for s in samples.iter() {
                            paths.extend(self.resolve_output(producer, produced, Some(s))?);
                        }
                        Ok(paths)
                    }
                    (Scope::Aggregate, _) => {
                        Ok(self.resolve_output(producer, produced, None)?.into_iter().collect())
                    }
                }
            }
        }
    }

    fn under_root(&self, path: &str) -> String {
        let p = Path::new(path);
        if p.is_absolute() {
            path.to_string()
        } else {
            self.output_root.join(p).to_string_lossy().into_owned()
        }
    }
}

/// Templates by name, keeping definition order.
struct TemplateIndex {
    ordered: Vec<Arc<RuleTemplate>>,
    by_name: HashMap<String, Arc<RuleTemplate>>,
}

impl TemplateIndex {
    fn get(&self, name: &str) -> Option<&Arc<RuleTemplate>> {
        self.by_name.get(name)
    }
}

fn index_templates(templates: &[RuleTemplate]) -> Result<TemplateIndex> {
    let mut ordered = Vec::with_capacity(templates.len());
    let mut by_name = HashMap::new();
    for template in templates {
        let shared = Arc::new(template.clone());
        if by_name
            .insert(template.name.clone(), Arc::clone(&shared))
            .is_some()
        {
            return Err(Error::Validation(format!(
                "rule {} is defined twice",
                template.name
            )));
        }
        ordered.push(shared);
    }
    Ok(TemplateIndex { ordered, by_name })
}

fn bindings(template: &RuleTemplate, samples: &SampleRegistry) -> Vec<Binding> {
    match template.scope {
        Scope::PerSample => samples
            .ids()
            .into_iter()
            .map(|id| Binding::Sample(id.to_string()))
            .collect(),
        Scope::Aggregate => vec![Binding::All],
    }
}

fn port_applies(port: &Port, sample: Option<&Sample>) -> bool {
    match (&port.requires_role, sample) {
        (Some(role), Some(s)) => s.has_role(role),
        _ => true,
    }
}

fn fill(template: &RuleTemplate, pattern: &str, sample: Option<&Sample>) -> Result<String> {
    let mut binding = BTreeMap::new();
    if let Some(s) = sample {
        binding.insert("sample", s.id.as_str());
    }
    substitute(pattern, &binding).map_err(|wildcard| Error::UnresolvedWildcard {
        rule: template.name.clone(),
        wildcard,
        pattern: pattern.to_string(),
    })
}

fn describe_spec(spec: &PathSpec) -> String {
    match spec {
        PathSpec::Literal(path) | PathSpec::Wildcard(path) => path.clone(),
        PathSpec::SampleInput(role) => format!("<sample {}>", role),
        PathSpec::OutputOf { rule, port } => format!("<{}.{}>", rule, port),
    }
}
