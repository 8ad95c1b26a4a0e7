use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::pipeline::checklist::{Checklist, FAN_OUT_SEPARATOR};
use crate::pipeline::retry::Backoff;
use crate::pipeline::StageStatus;
use crate::worker::ResultKind;

pub const RESERVED_ARGS: [&str; 3] = ["run_type", "run_date", "item"];

pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FanOut {
    Payload { stage: String, field: String },
    Static { items: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputBinding {
    pub arg: String,
    pub stage: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub worker: String,
    pub predecessors: Vec<String>,
    pub fan_out: Option<FanOut>,
    pub max_retries: u32,
    pub backoff: Backoff,
    pub timeout_secs: u64,
    pub critical: bool,
    pub run_types: Vec<String>,
    pub produces: ResultKind,
    pub inputs: Vec<InputBinding>,
}

impl StageDefinition {
    pub fn applies_to(&self, run_type: &str) -> bool {
        self.run_types.iter().any(|value| value == run_type)
    }

    pub fn is_fan_out(&self) -> bool {
        self.fan_out.is_some()
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read stage catalog '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse stage catalog YAML: {0}")]
    ParseYaml(String),
    #[error("invalid stage catalog: {}", .errors.join("; "))]
    Invalid { errors: Vec<String> },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogDocument {
    run_types: Vec<String>,
    #[serde(default)]
    defaults: CatalogDefaults,
    stages: Vec<StageDocument>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogDefaults {
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default)]
    backoff: Backoff,
}

impl Default for CatalogDefaults {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff: Backoff::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_produces() -> ResultKind {
    ResultKind::Empty
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageDocument {
    name: String,
    #[serde(default)]
    worker: Option<String>,
    #[serde(default)]
    predecessors: Vec<String>,
    #[serde(default)]
    fan_out: Option<FanOut>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    backoff: Option<Backoff>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    critical: bool,
    #[serde(default)]
    run_types: Vec<String>,
    #[serde(default = "default_produces")]
    produces: ResultKind,
    #[serde(default)]
    inputs: Vec<InputBinding>,
}

impl StageDocument {
    fn into_definition(
        self,
        defaults: &CatalogDefaults,
        all_run_types: &[String],
    ) -> StageDefinition {
        StageDefinition {
            worker: self
                .worker
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| self.name.clone()),
            name: self.name,
            predecessors: self.predecessors,
            fan_out: self.fan_out,
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            backoff: self.backoff.unwrap_or_else(|| defaults.backoff.clone()),
            timeout_secs: self.timeout_secs.unwrap_or(defaults.timeout_secs),
            critical: self.critical,
            run_types: if self.run_types.is_empty() {
                all_run_types.to_vec()
            } else {
                self.run_types
            },
            produces: self.produces,
            inputs: self.inputs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageCatalog {
    run_types: Vec<String>,
    stages: Vec<StageDefinition>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    digest: String,
}

impl StageCatalog {
    pub fn load_file(path: &Path) -> Result<Self, CatalogError> {
        let raw = fs::read_to_string(path).map_err(|error| CatalogError::ReadFile {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
        Self::from_yaml_str(raw.as_str())
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, CatalogError> {
        let document = serde_yaml::from_str::<CatalogDocument>(raw)
            .map_err(|error| CatalogError::ParseYaml(error.to_string()))?;
        let CatalogDocument {
            run_types,
            defaults,
            stages,
        } = document;
        let definitions = stages
            .into_iter()
            .map(|stage| stage.into_definition(&defaults, run_types.as_slice()))
            .collect::<Vec<_>>();
        Self::build(run_types, definitions, sha256_hex(raw.as_bytes()))
    }

    pub fn from_definitions(
        run_types: Vec<String>,
        stages: Vec<StageDefinition>,
    ) -> Result<Self, CatalogError> {
        let canonical = serde_json::to_vec(&(&run_types, &stages)).map_err(|error| {
            CatalogError::Invalid {
                errors: vec![format!("failed to fingerprint stage definitions: {error}")],
            }
        })?;
        Self::build(run_types, stages, sha256_hex(canonical.as_slice()))
    }

    fn build(
        run_types: Vec<String>,
        stages: Vec<StageDefinition>,
        digest: String,
    ) -> Result<Self, CatalogError> {
        let errors = validate_catalog(run_types.as_slice(), stages.as_slice());
        if !errors.is_empty() {
            return Err(CatalogError::Invalid { errors });
        }
        let order = topological_order(stages.as_slice())
            .map_err(|error| CatalogError::Invalid {
                errors: vec![error],
            })?;

        let mut by_name = stages
            .into_iter()
            .map(|stage| (stage.name.clone(), stage))
            .collect::<HashMap<_, _>>();
        let stages = order
            .iter()
            .filter_map(|name| by_name.remove(name))
            .collect::<Vec<_>>();

        let index = stages
            .iter()
            .enumerate()
            .map(|(idx, stage)| (stage.name.clone(), idx))
            .collect::<HashMap<_, _>>();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for stage in &stages {
            for predecessor in &stage.predecessors {
                dependents
                    .entry(predecessor.clone())
                    .or_default()
                    .push(stage.name.clone());
            }
        }

        Ok(Self {
            run_types,
            stages,
            index,
            dependents,
            digest,
        })
    }

    pub fn digest(&self) -> &str {
        self.digest.as_str()
    }

    pub fn run_types(&self) -> &[String] {
        self.run_types.as_slice()
    }

    pub fn has_run_type(&self, run_type: &str) -> bool {
        self.run_types.iter().any(|value| value == run_type)
    }

    pub fn stages(&self) -> &[StageDefinition] {
        self.stages.as_slice()
    }

    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.index.get(name).map(|idx| &self.stages[*idx])
    }

    pub fn stages_for(&self, run_type: &str) -> Vec<&StageDefinition> {
        self.stages
            .iter()
            .filter(|stage| stage.applies_to(run_type))
            .collect()
    }

    pub fn ready(&self, stage: &str, checklist: &Checklist) -> bool {
        let Some(definition) = self.get(stage) else {
            return false;
        };
        if matches!(
            checklist.status_of(stage),
            StageStatus::Succeeded | StageStatus::Running
        ) {
            return false;
        }
        definition
            .predecessors
            .iter()
            .all(|predecessor| checklist.is_succeeded(predecessor))
    }

    pub fn dependents_of(&self, stage: &str) -> &[String] {
        self.dependents
            .get(stage)
            .map_or(&[] as &[String], Vec::as_slice)
    }

    pub fn transitive_dependents(&self, stage: &str, run_type: &str) -> Vec<&StageDefinition> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([stage.to_string()]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(current.as_str()) {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                }
            }
        }
        self.stages
            .iter()
            .filter(|definition| seen.contains(&definition.name) && definition.applies_to(run_type))
            .collect()
    }
}

pub fn validate_catalog(run_types: &[String], stages: &[StageDefinition]) -> Vec<String> {
    let mut errors = Vec::new();

    if run_types.is_empty() {
        errors.push(String::from("catalog must declare at least one run type"));
    }
    let mut seen_run_types = HashSet::new();
    for run_type in run_types {
        if run_type.trim().is_empty() {
            errors.push(String::from("run type names must not be empty"));
        } else if !seen_run_types.insert(run_type.as_str()) {
            errors.push(format!("run type '{run_type}' is declared twice"));
        }
    }

    let mut by_name: BTreeMap<&str, &StageDefinition> = BTreeMap::new();
    for stage in stages {
        if stage.name.trim().is_empty() {
            errors.push(String::from("stage names must not be empty"));
            continue;
        }
        if stage.name.contains(FAN_OUT_SEPARATOR) {
            errors.push(format!(
                "stage '{}' must not contain '{FAN_OUT_SEPARATOR}'",
                stage.name
            ));
        }
        if by_name.insert(stage.name.as_str(), stage).is_some() {
            errors.push(format!("stage '{}' is declared twice", stage.name));
        }
    }

    for stage in stages {
        let name = stage.name.as_str();
        if stage.worker.trim().is_empty() {
            errors.push(format!("stage '{name}' has an empty worker id"));
        }
        if stage.timeout_secs == 0 {
            errors.push(format!("stage '{name}' must have timeout_secs > 0"));
        } else if stage.timeout_secs > MAX_TIMEOUT_SECS {
            errors.push(format!(
                "stage '{name}' timeout_secs {} exceeds the {MAX_TIMEOUT_SECS}s limit",
                stage.timeout_secs
            ));
        }
        if let Err(message) = stage.backoff.validate() {
            errors.push(format!("stage '{name}': {message}"));
        }
        if stage.run_types.is_empty() {
            errors.push(format!("stage '{name}' does not belong to any run type"));
        }
        for run_type in &stage.run_types {
            if !seen_run_types.contains(run_type.as_str()) {
                errors.push(format!("stage '{name}' uses unknown run type '{run_type}'"));
            }
        }

        let mut seen_predecessors = HashSet::new();
        for predecessor in &stage.predecessors {
            if predecessor == name {
                errors.push(format!("stage '{name}' cannot depend on itself"));
                continue;
            }
            if !seen_predecessors.insert(predecessor.as_str()) {
                errors.push(format!("stage '{name}' lists predecessor '{predecessor}' twice"));
                continue;
            }
            let Some(upstream) = by_name.get(predecessor.as_str()) else {
                errors.push(format!("stage '{name}' depends on unknown stage '{predecessor}'"));
                continue;
            };
            for run_type in &stage.run_types {
                if !upstream.applies_to(run_type) {
                    errors.push(format!(
                        "stage '{name}' runs for '{run_type}' but predecessor '{predecessor}' does not"
                    ));
                }
            }
        }

        match &stage.fan_out {
            Some(FanOut::Payload {
                stage: source,
                field,
            }) => {
                if !stage.predecessors.contains(source) {
                    errors.push(format!(
                        "stage '{name}' fans out over '{source}', which is not a predecessor"
                    ));
                } else if let Some(upstream) = by_name.get(source.as_str()) {
                    if upstream.is_fan_out() {
                        errors.push(format!(
                            "stage '{name}' fans out over '{source}', which itself fans out"
                        ));
                    } else if !upstream.produces.has_list_field(field) {
                        errors.push(format!(
                            "stage '{name}' fans out over '{source}.{field}', but {} results have no list field '{field}'",
                            upstream.produces
                        ));
                    }
                }
            }
            Some(FanOut::Static { items }) => {
                let mut seen_items = HashSet::new();
                for item in items {
                    if item.trim().is_empty() {
                        errors.push(format!("stage '{name}' has an empty fan-out item"));
                    } else if !seen_items.insert(item.as_str()) {
                        errors.push(format!("stage '{name}' lists fan-out item '{item}' twice"));
                    }
                }
            }
            None => {}
        }

        let mut seen_args = HashSet::new();
        for binding in &stage.inputs {
            let arg = binding.arg.as_str();
            if arg.trim().is_empty() {
                errors.push(format!("stage '{name}' has an input with an empty arg name"));
                continue;
            }
            if RESERVED_ARGS.contains(&arg) {
                errors.push(format!("stage '{name}' input '{arg}' shadows a reserved argument"));
            }
            if !seen_args.insert(arg) {
                errors.push(format!("stage '{name}' binds input '{arg}' twice"));
            }
            if !stage.predecessors.contains(&binding.stage) {
                errors.push(format!(
                    "stage '{name}' input '{arg}' reads from '{}', which is not a predecessor",
                    binding.stage
                ));
            } else if let Some(upstream) = by_name.get(binding.stage.as_str()) {
                if !upstream.produces.has_field(binding.field.as_str()) {
                    errors.push(format!(
                        "stage '{name}' input '{arg}' reads '{}.{}', but {} results have no field '{}'",
                        binding.stage, binding.field, upstream.produces, binding.field
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        if let Err(error) = topological_order(stages) {
            errors.push(error);
        }
    }

    errors
}

fn topological_order(stages: &[StageDefinition]) -> Result<Vec<String>, String> {
    let position = stages
        .iter()
        .enumerate()
        .map(|(idx, stage)| (stage.name.as_str(), idx))
        .collect::<HashMap<_, _>>();
    let mut in_degree = vec![0usize; stages.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];

    for (idx, stage) in stages.iter().enumerate() {
        for predecessor in &stage.predecessors {
            let Some(&upstream) = position.get(predecessor.as_str()) else {
                return Err(format!(
                    "stage '{}' depends on unknown stage '{predecessor}'",
                    stage.name
                ));
            };
            dependents[upstream].push(idx);
            in_degree[idx] += 1;
        }
    }

    // Kahn's algorithm, releasing stages in declaration order.
    let mut queue = (0..stages.len())
        .filter(|idx| in_degree[*idx] == 0)
        .collect::<VecDeque<_>>();
    let mut order = Vec::with_capacity(stages.len());
    while let Some(current) = queue.pop_front() {
        order.push(stages[current].name.clone());
        let mut released = Vec::new();
        for &dependent in &dependents[current] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                released.push(dependent);
            }
        }
        released.sort_unstable();
        queue.extend(released);
    }

    if order.len() != stages.len() {
        let remaining = stages
            .iter()
            .filter(|stage| !order.contains(&stage.name))
            .map(|stage| stage.name.clone())
            .collect::<Vec<_>>();
        return Err(format!(
            "cycle detected between stages: {}",
            remaining.join(", ")
        ));
    }
    Ok(order)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
