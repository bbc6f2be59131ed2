//! Module registry and dependency resolution.

use crate::error::{CoreError, HookError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub type HookResult = Result<(), HookError>;
pub type Hook = Arc<dyn Fn() -> BoxFuture<'static, HookResult> + Send + Sync>;
pub type HealthProbe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Capability trait for modules that manage their own lifecycle.
///
/// Register with [`ModuleDescriptor::for_module`]; the orchestrator calls
/// `start` and `stop` as the start and stop hooks.
#[async_trait]
pub trait Module: Send + Sync + 'static {
	async fn start(&self) -> Result<(), HookError>;

	async fn stop(&self) -> Result<(), HookError> {
		Ok(())
	}

	async fn health_check(&self) -> bool {
		true
	}
}

/// Everything the orchestrator knows about one module.
///
/// The instance handle is opaque to the orchestrator; it is only handed
/// back through [`crate::Orchestrator::instance`].
pub struct ModuleDescriptor {
	pub(crate) name: String,
	pub(crate) instance: Arc<dyn Any + Send + Sync>,
	pub(crate) dependencies: Vec<String>,
	pub(crate) start_hook: Option<Hook>,
	pub(crate) stop_hook: Option<Hook>,
	pub(crate) health_probe: Option<HealthProbe>,
	pub(crate) start_timeout: Option<Duration>,
}

impl ModuleDescriptor {
	pub fn new(name: impl Into<String>, instance: Arc<dyn Any + Send + Sync>) -> Self {
		Self {
			name: name.into(),
			instance,
			dependencies: Vec::new(),
			start_hook: None,
			stop_hook: None,
			health_probe: None,
			start_timeout: None,
		}
	}

	/// Descriptor whose hooks and health probe delegate to `module`.
	pub fn for_module<M: Module>(name: impl Into<String>, module: Arc<M>) -> Self {
		let start = module.clone();
		let stop = module.clone();
		let health = module.clone();

		let mut descriptor = Self::new(name, module);
		descriptor.start_hook = Some(Arc::new(move || {
			let module = start.clone();
			async move { module.start().await }.boxed()
		}));
		descriptor.stop_hook = Some(Arc::new(move || {
			let module = stop.clone();
			async move { module.stop().await }.boxed()
		}));
		descriptor.health_probe = Some(Arc::new(move || {
			let module = health.clone();
			async move { module.health_check().await }.boxed()
		}));
		descriptor
	}

	pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.dependencies
			.extend(dependencies.into_iter().map(Into::into));
		self
	}

	pub fn on_start<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HookResult> + Send + 'static,
	{
		self.start_hook = Some(Arc::new(move || hook().boxed()));
		self
	}

	/// Start hook that blocks the calling thread; it runs on the blocking
	/// pool so the timeout still applies. A hook that outlives its timeout
	/// keeps its thread until it returns.
	pub fn on_start_blocking<F>(mut self, hook: F) -> Self
	where
		F: Fn() -> HookResult + Send + Sync + 'static,
	{
		let hook = Arc::new(hook);
		self.start_hook = Some(Arc::new(move || {
			let hook = hook.clone();
			async move {
				tokio::task::spawn_blocking(move || hook())
					.await
					.map_err(|e| HookError::new(format!("blocking start hook failed: {}", e)))?
			}
			.boxed()
		}));
		self
	}

	pub fn on_stop<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HookResult> + Send + 'static,
	{
		self.stop_hook = Some(Arc::new(move || hook().boxed()));
		self
	}

	pub fn health<F, Fut>(mut self, probe: F) -> Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = bool> + Send + 'static,
	{
		self.health_probe = Some(Arc::new(move || probe().boxed()));
		self
	}

	/// Overrides the configured start timeout for this module only.
	pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
		self.start_timeout = Some(timeout);
		self
	}
}

impl fmt::Debug for ModuleDescriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ModuleDescriptor")
			.field("name", &self.name)
			.field("dependencies", &self.dependencies)
			.field("start_hook", &self.start_hook.is_some())
			.field("stop_hook", &self.stop_hook.is_some())
			.field("start_timeout", &self.start_timeout)
			.finish()
	}
}

/// Registered modules, in registration order.
#[derive(Default)]
pub struct ModuleRegistry {
	modules: Vec<Arc<ModuleDescriptor>>,
	index: HashMap<String, usize>,
}

impl ModuleRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Dependencies must already be registered.
	pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<(), CoreError> {
		if self.index.contains_key(&descriptor.name) {
			return Err(CoreError::DuplicateModule(descriptor.name));
		}
		if let Some(missing) = descriptor
			.dependencies
			.iter()
			.find(|dep| !self.index.contains_key(dep.as_str()))
		{
			return Err(CoreError::UnknownDependency {
				module: descriptor.name.clone(),
				dependency: missing.clone(),
			});
		}

		self.index
			.insert(descriptor.name.clone(), self.modules.len());
		self.modules.push(Arc::new(descriptor));
		Ok(())
	}

	pub fn get(&self, name: &str) -> Option<Arc<ModuleDescriptor>> {
		self.index.get(name).map(|&i| self.modules[i].clone())
	}

	pub fn descriptors(&self) -> impl Iterator<Item = &Arc<ModuleDescriptor>> {
		self.modules.iter()
	}

	pub fn len(&self) -> usize {
		self.modules.len()
	}

	pub fn is_empty(&self) -> bool {
		self.modules.is_empty()
	}

	/// Start order of the registered modules.
	pub fn resolve_order(&self) -> Result<Vec<String>, CoreError> {
		let graph: Vec<(&str, &[String])> = self
			.modules
			.iter()
			.map(|m| (m.name.as_str(), m.dependencies.as_slice()))
			.collect();
		resolve_order(&graph)
	}
}

/// Orders `graph` so every node follows its dependencies.
///
/// Nodes are taken as `(name, dependencies)` in registration order. Each
/// round picks the earliest node whose dependencies are all placed, so
/// unconstrained nodes keep their relative order. Nodes that can never be
/// placed form the cycle error; pure dependents of a cycle are left out of
/// it.
pub fn resolve_order<S: AsRef<str>>(graph: &[(&str, &[S])]) -> Result<Vec<String>, CoreError> {
	let index: HashMap<&str, usize> = graph
		.iter()
		.enumerate()
		.map(|(i, (name, _))| (*name, i))
		.collect();

	let mut in_degree = vec![0usize; graph.len()];
	let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); graph.len()];

	for (i, (name, deps)) in graph.iter().enumerate() {
		let mut seen = HashSet::new();
		for dep in deps.iter() {
			let dep = dep.as_ref();
			let Some(&d) = index.get(dep) else {
				return Err(CoreError::UnknownDependency {
					module: name.to_string(),
					dependency: dep.to_string(),
				});
			};
			if seen.insert(d) {
				in_degree[i] += 1;
				dependents[d].push(i);
			}
		}
	}

	let mut placed = vec![false; graph.len()];
	let mut order = Vec::with_capacity(graph.len());

	while let Some(next) = (0..graph.len()).find(|&i| !placed[i] && in_degree[i] == 0) {
		placed[next] = true;
		order.push(graph[next].0.to_string());
		for &dependent in &dependents[next] {
			in_degree[dependent] -= 1;
		}
	}

	if order.len() == graph.len() {
		return Ok(order);
	}

	// Peel nodes nothing unplaced depends on; what remains lies on a cycle.
	let mut remaining: Vec<bool> = placed.iter().map(|p| !p).collect();
	loop {
		let peel: Vec<usize> = (0..graph.len())
			.filter(|&i| remaining[i] && !dependents[i].iter().any(|&d| remaining[d]))
			.collect();
		if peel.is_empty() {
			break;
		}
		for i in peel {
			remaining[i] = false;
		}
	}

	Err(CoreError::CyclicDependency(
		(0..graph.len())
			.filter(|&i| remaining[i])
			.map(|i| graph[i].0.to_string())
			.collect(),
	))
}
