use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::core::ArcStr;
use crate::error::{ContextError, ParameterError, RegistryError};
use crate::param::{self, ParamKind, ParamSpec, ParamValue, Params, Signature};
use crate::store::{Artifact, Store, StoreKey};

pub(crate) type RunFn<G> = Arc<dyn Fn(&TaskContext<'_, G>) -> anyhow::Result<Outputs> + Send + Sync>;

/// A registered computational step: parameter specs, dependency specs,
/// declared outputs and the run contract.
pub(crate) struct TaskKind<G: Send + Sync> {
    pub(crate) name: ArcStr,
    pub(crate) params: Vec<ParamSpec>,
    pub(crate) deps: Vec<DependencySpec>,
    pub(crate) outputs: Vec<ArcStr>,
    pub(crate) run: RunFn<G>,
}

impl<G: Send + Sync> fmt::Debug for TaskKind<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskKind({})", self.name)
    }
}

/// One declared dependency edge of a task kind.
pub(crate) struct DependencySpec {
    pub(crate) alias: ArcStr,
    pub(crate) kind: ArcStr,
    pub(crate) derive: Derive,
}

type ComputeFn = Arc<dyn Fn(&Params) -> anyhow::Result<ParamValue> + Send + Sync>;

enum Step {
    Set(ArcStr, ParamValue),
    Compute(ArcStr, ComputeFn),
}

/// A parameter derivation rule for a dependency edge.
///
/// Applied at graph-build time, never at run time: the dependency inherits
/// every identically-named parameter the child kind declares, then the
/// recorded steps override or add specific parameters in order.
///
/// # Example
///
/// ```rust
/// use karakuri::{Derive, ParamValue};
///
/// let rule = Derive::inherit()
///     .set("lookback", 1)
///     .compute("window", |params| Ok(ParamValue::Int(params.int("lookback")? * 21)));
/// ```
pub struct Derive {
    steps: Vec<Step>,
}

impl Derive {
    /// Pass through identically-named parameters, nothing else.
    pub fn inherit() -> Self {
        Self { steps: Vec::new() }
    }

    /// Fixes a parameter of the dependency to a constant.
    pub fn set(mut self, param: &str, value: impl Into<ParamValue>) -> Self {
        self.steps.push(Step::Set(param.into(), value.into()));
        self
    }

    /// Derives a parameter of the dependency from the parent's record.
    ///
    /// The function must be pure; it runs during graph expansion and its
    /// result becomes part of the dependency's signature.
    pub fn compute<F>(mut self, param: &str, derive: F) -> Self
    where
        F: Fn(&Params) -> anyhow::Result<ParamValue> + Send + Sync + 'static,
    {
        self.steps.push(Step::Compute(param.into(), Arc::new(derive)));
        self
    }

    pub(crate) fn apply(
        &self,
        parent: &Params,
        child: &[ParamSpec],
    ) -> anyhow::Result<Vec<(ArcStr, ParamValue)>> {
        let mut acc: BTreeMap<ArcStr, ParamValue> = BTreeMap::new();

        for spec in child {
            if let Some(value) = parent.get(spec.name.as_ref()) {
                acc.insert(spec.name.clone(), value.clone());
            }
        }

        for step in &self.steps {
            match step {
                Step::Set(name, value) => {
                    acc.insert(name.clone(), value.clone());
                }
                Step::Compute(name, derive) => {
                    acc.insert(name.clone(), derive(parent)?);
                }
            }
        }

        Ok(acc.into_iter().collect())
    }
}

impl fmt::Debug for Derive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Derive({} steps)", self.steps.len())
    }
}

/// Identifiers end up in signatures and store paths, so they are restricted
/// to a filesystem-safe alphabet.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// The set of task kinds a pipeline can execute.
///
/// Registration is explicit: a kind exists once [`TaskDef::run`] has been
/// called, and nothing is registered as a side effect of being defined
/// elsewhere. Dependencies may reference kinds registered later; they are
/// resolved when a graph is expanded.
pub struct Registry<G: Send + Sync = ()> {
    kinds: HashMap<ArcStr, Arc<TaskKind<G>>>,
}

impl<G: Send + Sync + 'static> Registry<G> {
    pub fn new() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// Starts the definition of a new task kind.
    ///
    /// # Example
    ///
    /// ```rust
    /// use karakuri::{Artifact, Outputs, ParamKind, Registry};
    ///
    /// let mut registry: Registry<()> = Registry::new();
    /// registry
    ///     .task("prices")
    ///     .param("symbol", ParamKind::Str)
    ///     .output("frame")
    ///     .run(|ctx| {
    ///         let symbol = ctx.params.str("symbol")?;
    ///         Ok(Outputs::one("frame", Artifact::encode(&vec![symbol])?))
    ///     })
    ///     .unwrap();
    /// ```
    pub fn task(&mut self, name: impl Into<ArcStr>) -> TaskDef<'_, G> {
        TaskDef {
            registry: self,
            name: name.into(),
            params: Vec::new(),
            deps: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Binds concrete parameter values to a registered kind.
    ///
    /// Values are validated against the declared specs, defaults fill in
    /// omitted optional parameters, and the canonical signature is computed
    /// eagerly. Fails if the kind is unknown, a required parameter is
    /// missing, a name is not declared, or a value doesn't fit its type.
    pub fn instance<N, I>(&self, kind: &str, params: I) -> Result<TaskInstance, ParameterError>
    where
        N: Into<ArcStr>,
        I: IntoIterator<Item = (N, ParamValue)>,
    {
        let Some(task) = self.kinds.get(kind) else {
            return Err(ParameterError::UnknownKind(kind.to_string()));
        };

        let given = params.into_iter().map(|(name, value)| (name.into(), value));
        let params = param::validate(&task.params, given)?;

        Ok(TaskInstance::new(task.name.clone(), params))
    }

    pub(crate) fn kind(&self, name: &str) -> Option<&Arc<TaskKind<G>>> {
        self.kinds.get(name)
    }
}

impl<G: Send + Sync + 'static> Default for Registry<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Send + Sync> fmt::Debug for Registry<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.kinds.keys().map(|name| name.as_ref()).collect();
        names.sort_unstable();
        f.debug_tuple("Registry").field(&names).finish()
    }
}

/// Fluent definition of one task kind; finished by [`TaskDef::run`].
pub struct TaskDef<'a, G: Send + Sync> {
    registry: &'a mut Registry<G>,
    name: ArcStr,
    params: Vec<ParamSpec>,
    deps: Vec<DependencySpec>,
    outputs: Vec<ArcStr>,
}

impl<G: Send + Sync + 'static> TaskDef<'_, G> {
    /// Declares a required parameter.
    pub fn param(mut self, name: &str, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            default: None,
        });
        self
    }

    /// Declares an optional parameter with a default value.
    pub fn param_default(
        mut self,
        name: &str,
        kind: ParamKind,
        default: impl Into<ParamValue>,
    ) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            default: Some(default.into()),
        });
        self
    }

    /// Declares a dependency on another kind, aliased by the kind's name.
    ///
    /// The kind does not need to be registered yet; it is looked up when a
    /// graph is expanded.
    pub fn requires(self, kind: &str, derive: Derive) -> Self {
        let alias = kind.to_string();
        self.requires_as(&alias, kind, derive)
    }

    /// Declares a dependency under an explicit alias, so one kind can be
    /// required twice with different derived parameters.
    pub fn requires_as(mut self, alias: &str, kind: &str, derive: Derive) -> Self {
        self.deps.push(DependencySpec {
            alias: alias.into(),
            kind: kind.into(),
            derive,
        });
        self
    }

    /// Declares a named output the run contract must produce.
    pub fn output(mut self, name: &str) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Validates the definition and registers it with its run contract.
    pub fn run<F>(self, callback: F) -> Result<(), RegistryError>
    where
        F: Fn(&TaskContext<'_, G>) -> anyhow::Result<Outputs> + Send + Sync + 'static,
    {
        let kind = self.name.to_string();

        if !valid_name(&self.name) {
            return Err(RegistryError::InvalidName(kind));
        }
        if self.registry.kinds.contains_key(&self.name) {
            return Err(RegistryError::DuplicateKind(kind));
        }
        if self.outputs.is_empty() {
            return Err(RegistryError::NoOutputs { kind });
        }

        let mut params = Vec::with_capacity(self.params.len());
        for spec in self.params {
            if !valid_name(&spec.name) {
                return Err(RegistryError::InvalidName(spec.name.to_string()));
            }
            if params.iter().any(|p: &ParamSpec| p.name == spec.name) {
                return Err(RegistryError::DuplicateParam {
                    kind,
                    param: spec.name.to_string(),
                });
            }
            let default = match spec.default {
                Some(value) => match param::coerce(&spec.kind, value, &spec.name) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        return Err(RegistryError::BadDefault {
                            kind,
                            param: spec.name.to_string(),
                        });
                    }
                },
                None => None,
            };
            params.push(ParamSpec {
                default,
                ..spec
            });
        }

        for (i, dep) in self.deps.iter().enumerate() {
            if !valid_name(&dep.alias) {
                return Err(RegistryError::InvalidName(dep.alias.to_string()));
            }
            if self.deps[..i].iter().any(|d| d.alias == dep.alias) {
                return Err(RegistryError::DuplicateAlias {
                    kind,
                    alias: dep.alias.to_string(),
                });
            }
        }

        for (i, output) in self.outputs.iter().enumerate() {
            if !valid_name(output) {
                return Err(RegistryError::InvalidName(output.to_string()));
            }
            if self.outputs[..i].contains(output) {
                return Err(RegistryError::DuplicateOutput {
                    kind,
                    output: output.to_string(),
                });
            }
        }

        self.registry.kinds.insert(
            self.name.clone(),
            Arc::new(TaskKind {
                name: self.name,
                params,
                deps: self.deps,
                outputs: self.outputs,
                run: Arc::new(callback),
            }),
        );

        Ok(())
    }
}

/// A task kind bound to concrete parameter values; the unit of caching and
/// scheduling.
///
/// Equality and hashing are defined over (kind name, canonical signature),
/// so two instances built from value-equal assignments are the same node
/// for deduplication and the same key for the store.
#[derive(Clone)]
pub struct TaskInstance {
    kind: ArcStr,
    params: Arc<Params>,
    signature: Signature,
}

impl TaskInstance {
    pub(crate) fn new(kind: ArcStr, params: Params) -> Self {
        let signature = params.signature();
        Self {
            kind,
            params: Arc::new(params),
            signature,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub(crate) fn gate_key(&self) -> (ArcStr, Signature) {
        (self.kind.clone(), self.signature.clone())
    }
}

impl PartialEq for TaskInstance {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.signature == other.signature
    }
}

impl Eq for TaskInstance {}

impl std::hash::Hash for TaskInstance {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.signature.hash(state);
    }
}

impl fmt::Display for TaskInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.signature)
    }
}

impl fmt::Debug for TaskInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// The named payloads a run contract returns.
#[derive(Default)]
pub struct Outputs {
    pub(crate) map: BTreeMap<ArcStr, Artifact>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for the common single-output case.
    pub fn one(name: &str, artifact: Artifact) -> Self {
        let mut outputs = Self::new();
        outputs.insert(name, artifact);
        outputs
    }

    pub fn insert(&mut self, name: &str, artifact: Artifact) {
        self.map.insert(name.into(), artifact);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A resolved direct dependency visible to a run contract.
pub(crate) struct DepHandle {
    pub(crate) instance: TaskInstance,
    pub(crate) outputs: Vec<ArcStr>,
}

/// The context passed to every run contract.
///
/// Provides the instance's validated parameters, the shared user data and
/// access to the persisted outputs of the direct dependencies. Dependencies
/// are guaranteed complete by the time a contract runs.
pub struct TaskContext<'a, G: Send + Sync = ()> {
    /// Validated parameter values of the executing instance.
    pub params: &'a Params,
    /// User-defined data shared by every task in the pipeline.
    pub data: &'a G,
    store: &'a dyn Store,
    deps: &'a HashMap<ArcStr, DepHandle>,
}

impl<'a, G: Send + Sync> TaskContext<'a, G> {
    pub(crate) fn new(
        params: &'a Params,
        data: &'a G,
        store: &'a dyn Store,
        deps: &'a HashMap<ArcStr, DepHandle>,
    ) -> Self {
        Self {
            params,
            data,
            store,
            deps,
        }
    }

    /// Loads one output of a direct dependency, as raw bytes.
    pub fn load(&self, alias: &str, output: &str) -> Result<Artifact, ContextError> {
        let Some(dep) = self.deps.get(alias) else {
            return Err(ContextError::UnknownDependency(alias.to_string()));
        };
        if !dep.outputs.iter().any(|name| name.as_ref() == output) {
            return Err(ContextError::UnknownOutput {
                alias: alias.to_string(),
                output: output.to_string(),
            });
        }
        Ok(self.store.load(&StoreKey::new(&dep.instance, output))?)
    }

    /// Loads and decodes one output of a direct dependency.
    pub fn decode<T: DeserializeOwned>(&self, alias: &str, output: &str) -> Result<T, ContextError> {
        Ok(self.load(alias, output)?.decode()?)
    }

    /// The resolved instance behind a dependency alias.
    pub fn dependency(&self, alias: &str) -> Result<&TaskInstance, ContextError> {
        match self.deps.get(alias) {
            Some(dep) => Ok(&dep.instance),
            None => Err(ContextError::UnknownDependency(alias.to_string())),
        }
    }
}
