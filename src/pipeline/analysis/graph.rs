//! Static step graph and wave planning.
//!
//! The graph is validated once at construction. Planning a run removes the
//! disabled optional steps (their dependents inherit the removed step's own
//! dependencies) and groups the rest into waves by dependency depth.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::error::GraphError;
use super::types::StepName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDefinition {
    pub name: StepName,
    pub depends_on: Vec<StepName>,
    /// Skippable without failing the run.
    pub optional: bool,
    /// Depends on every other enabled step. At most one per graph.
    pub terminal: bool,
}

impl StepDefinition {
    pub fn required(name: StepName, depends_on: &[StepName]) -> Self {
        Self {
            name,
            depends_on: depends_on.to_vec(),
            optional: false,
            terminal: false,
        }
    }

    pub fn optional(name: StepName, depends_on: &[StepName]) -> Self {
        Self {
            optional: true,
            ..Self::required(name, depends_on)
        }
    }

    pub fn terminal(name: StepName) -> Self {
        Self {
            terminal: true,
            ..Self::required(name, &[])
        }
    }
}

/// The standard oncology analysis pipeline.
pub fn standard_definitions() -> Vec<StepDefinition> {
    use StepName::*;
    vec![
        StepDefinition::required(MedicalHistory, &[]),
        StepDefinition::required(Genomics, &[MedicalHistory]),
        StepDefinition::optional(ClinicalTrials, &[MedicalHistory]),
        StepDefinition::optional(Evidence, &[MedicalHistory]),
        StepDefinition::required(
            Treatment,
            &[MedicalHistory, Genomics, ClinicalTrials, Evidence],
        ),
        StepDefinition::terminal(Synthesis),
    ]
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Definition order is the canonical order used inside a wave.
    definitions: Vec<StepDefinition>,
    index: HashMap<StepName, usize>,
}

impl DependencyGraph {
    pub fn new(definitions: Vec<StepDefinition>) -> Result<Self, GraphError> {
        let mut index = HashMap::new();
        for (i, def) in definitions.iter().enumerate() {
            if index.insert(def.name, i).is_some() {
                return Err(GraphError::DuplicateStep(def.name));
            }
        }

        let mut terminal: Option<StepName> = None;
        for def in &definitions {
            for dep in &def.depends_on {
                if !index.contains_key(dep) {
                    return Err(GraphError::MissingDependency {
                        step: def.name,
                        missing: *dep,
                    });
                }
            }
            if def.terminal {
                if def.optional {
                    return Err(GraphError::OptionalTerminal(def.name));
                }
                if let Some(first) = terminal {
                    return Err(GraphError::MultipleTerminal(first, def.name));
                }
                terminal = Some(def.name);
            }
        }

        let graph = Self { definitions, index };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn standard() -> Result<Self, GraphError> {
        Self::new(standard_definitions())
    }

    pub fn definitions(&self) -> &[StepDefinition] {
        &self.definitions
    }

    pub fn steps(&self) -> impl Iterator<Item = StepName> + '_ {
        self.definitions.iter().map(|d| d.name)
    }

    pub fn get(&self, step: StepName) -> Option<&StepDefinition> {
        self.index.get(&step).map(|&i| &self.definitions[i])
    }

    fn terminal(&self) -> Option<StepName> {
        self.definitions.iter().find(|d| d.terminal).map(|d| d.name)
    }

    /// Edges including the implicit "terminal depends on everything" ones.
    fn full_dependencies(&self, def: &StepDefinition) -> Vec<StepName> {
        if def.terminal {
            self.steps().filter(|s| *s != def.name).collect()
        } else {
            def.depends_on.clone()
        }
    }

    /// Kahn's algorithm; whatever is left unprocessed sits on a cycle.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut indegree: HashMap<StepName, usize> = HashMap::new();
        let mut dependents: HashMap<StepName, Vec<StepName>> = HashMap::new();
        for def in &self.definitions {
            let deps = self.full_dependencies(def);
            indegree.insert(def.name, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(def.name);
            }
        }

        let mut ready: Vec<StepName> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(s, _)| *s)
            .collect();
        let mut processed = 0usize;
        while let Some(step) = ready.pop() {
            processed += 1;
            for next in dependents.get(&step).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(*next);
                    }
                }
            }
        }

        if processed == self.definitions.len() {
            return Ok(());
        }
        let mut stuck: Vec<StepName> = indegree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(s, _)| s)
            .collect();
        stuck.sort();
        Err(GraphError::Cycle(stuck))
    }

    /// Plan one run given the optional steps switched on.
    ///
    /// Deterministic: the same input always yields the same waves.
    pub fn plan(&self, enabled_optional: &[StepName]) -> ExecutionPlan {
        let enabled: HashSet<StepName> = self
            .definitions
            .iter()
            .filter(|d| !d.optional || enabled_optional.contains(&d.name))
            .map(|d| d.name)
            .collect();

        let mut resolved: HashMap<StepName, BTreeSet<StepName>> = HashMap::new();
        let mut dependencies: BTreeMap<StepName, Vec<StepName>> = BTreeMap::new();
        for def in &self.definitions {
            if !enabled.contains(&def.name) {
                continue;
            }
            let deps: BTreeSet<StepName> = if def.terminal {
                enabled.iter().copied().filter(|s| *s != def.name).collect()
            } else {
                def.depends_on
                    .iter()
                    .flat_map(|dep| self.effective(*dep, &enabled, &mut resolved))
                    .collect()
            };
            dependencies.insert(def.name, deps.into_iter().collect());
        }

        let mut level: HashMap<StepName, usize> = HashMap::new();
        for step in self.topological_order() {
            if let Some(deps) = dependencies.get(&step) {
                let l = deps
                    .iter()
                    .filter_map(|d| level.get(d))
                    .map(|l| l + 1)
                    .max()
                    .unwrap_or(0);
                level.insert(step, l);
            }
        }

        let wave_count = level.values().copied().max().map_or(0, |m| m + 1);
        let mut waves: Vec<Vec<StepName>> = vec![Vec::new(); wave_count];
        for def in &self.definitions {
            if let Some(&l) = level.get(&def.name) {
                waves[l].push(def.name);
            }
        }

        let optional = self
            .definitions
            .iter()
            .filter(|d| d.optional && enabled.contains(&d.name))
            .map(|d| d.name)
            .collect();

        ExecutionPlan {
            waves,
            dependencies,
            optional,
            terminal: self.terminal().filter(|t| enabled.contains(t)),
        }
    }

    /// What depending on `step` means once disabled steps are bypassed.
    fn effective(
        &self,
        step: StepName,
        enabled: &HashSet<StepName>,
        memo: &mut HashMap<StepName, BTreeSet<StepName>>,
    ) -> BTreeSet<StepName> {
        if enabled.contains(&step) {
            return BTreeSet::from([step]);
        }
        if let Some(cached) = memo.get(&step) {
            return cached.clone();
        }
        let inherited: BTreeSet<StepName> = self
            .get(step)
            .map(|d| d.depends_on.clone())
            .unwrap_or_default()
            .into_iter()
            .flat_map(|dep| self.effective(dep, enabled, memo))
            .collect();
        memo.insert(step, inherited.clone());
        inherited
    }

    /// Definition-order-stable topological order. The graph is known acyclic.
    fn topological_order(&self) -> Vec<StepName> {
        let mut order = Vec::with_capacity(self.definitions.len());
        let mut placed: HashSet<StepName> = HashSet::new();
        while order.len() < self.definitions.len() {
            let before = order.len();
            for def in &self.definitions {
                if placed.contains(&def.name) {
                    continue;
                }
                let deps = self.full_dependencies(def);
                if deps.iter().all(|d| placed.contains(d)) {
                    placed.insert(def.name);
                    order.push(def.name);
                }
            }
            if order.len() == before {
                break;
            }
        }
        order
    }
}

/// Waves for one run. Steps in wave `i` depend only on steps in earlier waves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    waves: Vec<Vec<StepName>>,
    dependencies: BTreeMap<StepName, Vec<StepName>>,
    optional: HashSet<StepName>,
    terminal: Option<StepName>,
}

impl ExecutionPlan {
    pub fn waves(&self) -> &[Vec<StepName>] {
        &self.waves
    }

    /// Every planned step, wave by wave.
    pub fn steps(&self) -> impl Iterator<Item = StepName> + '_ {
        self.waves.iter().flatten().copied()
    }

    pub fn total_steps(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    pub fn contains(&self, step: StepName) -> bool {
        self.dependencies.contains_key(&step)
    }

    pub fn dependencies_of(&self, step: StepName) -> &[StepName] {
        self.dependencies.get(&step).map_or(&[], Vec::as_slice)
    }

    pub fn is_optional(&self, step: StepName) -> bool {
        self.optional.contains(&step)
    }

    pub fn terminal(&self) -> Option<StepName> {
        self.terminal
    }
}
