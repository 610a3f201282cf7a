//! Service registry.
//!
//! Services are descriptor tables built with [`Module`]: named async
//! closures for methods and subscription openers. The dispatcher treats
//! descriptors uniformly and never inspects concrete types, which keeps the
//! framework domain-agnostic. Registrations happen before any transport is
//! bound; afterwards the registry is effectively immutable.

use std::{
	collections::{BTreeMap, HashMap},
	future::Future,
	sync::{Arc, RwLock},
};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
	error::{RegistryError, RpcError},
	notifier::SubscriptionSink,
};

/// Version reported for every registered service by `rpc_modules`.
pub const MODULE_VERSION: &str = "1.0";

/// Context bound to every method invocation.
#[derive(Debug, Clone)]
pub struct CallCtx {
	/// Cancelled when the server drains or the connection goes away;
	/// long-running callables are expected to observe it.
	pub cancel: CancellationToken,
	/// Peer label of the originating connection.
	pub remote: String,
}

pub type MethodFuture = BoxFuture<'static, Result<Value, RpcError>>;
pub type MethodFn = Arc<dyn Fn(CallCtx, Vec<Value>) -> MethodFuture + Send + Sync>;
pub type SubscribeFuture = BoxFuture<'static, Result<(), RpcError>>;
pub type SubscribeFn = Arc<dyn Fn(SubscriptionSink, Vec<Value>) -> SubscribeFuture + Send + Sync>;

/// Declared parameter count of a callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
	min: usize,
	max: usize,
}

impl Arity {
	pub fn exact(count: usize) -> Self {
		Arity {
			min: count,
			max: count,
		}
	}

	pub fn between(min: usize, max: usize) -> Self {
		Arity { min, max }
	}

	pub fn any() -> Self {
		Arity {
			min: 0,
			max: usize::MAX,
		}
	}

	pub fn check(&self, got: usize) -> Result<(), RpcError> {
		if got < self.min {
			return Err(RpcError::InvalidParams(format!(
				"missing value for required argument {got}"
			)));
		}
		if got > self.max {
			return Err(RpcError::InvalidParams(format!(
				"too many arguments, want at most {}",
				self.max
			)));
		}
		Ok(())
	}
}

/// One registered method.
pub struct MethodDescriptor {
	pub name: String,
	pub arity: Arity,
	pub handler: MethodFn,
}

/// One registered subscription opener. `arity` constrains the parameters
/// after the topic.
pub struct SubscriptionDescriptor {
	pub topic: String,
	pub arity: Arity,
	pub handler: SubscribeFn,
}

/// A named collection of callables, assembled by the service author.
#[derive(Clone, Default)]
pub struct Module {
	methods: HashMap<String, Arc<MethodDescriptor>>,
	subscriptions: HashMap<String, Arc<SubscriptionDescriptor>>,
}

impl Module {
	pub fn new() -> Self {
		Module::default()
	}

	/// Registers a method callable. Re-registering a name overwrites.
	pub fn method<F, Fut>(mut self, name: &str, arity: Arity, handler: F) -> Self
	where
		F: Fn(CallCtx, Vec<Value>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
	{
		let handler: MethodFn =
			Arc::new(move |ctx, params| -> MethodFuture { Box::pin(handler(ctx, params)) });
		self.methods.insert(
			name.to_string(),
			Arc::new(MethodDescriptor {
				name: name.to_string(),
				arity,
				handler,
			}),
		);
		self
	}

	/// Registers a subscription opener for one topic.
	pub fn subscription<F, Fut>(mut self, topic: &str, arity: Arity, handler: F) -> Self
	where
		F: Fn(SubscriptionSink, Vec<Value>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
	{
		let handler: SubscribeFn =
			Arc::new(move |sink, params| -> SubscribeFuture { Box::pin(handler(sink, params)) });
		self.subscriptions.insert(
			topic.to_string(),
			Arc::new(SubscriptionDescriptor {
				topic: topic.to_string(),
				arity,
				handler,
			}),
		);
		self
	}

	pub fn is_empty(&self) -> bool {
		self.methods.is_empty() && self.subscriptions.is_empty()
	}

	fn merge(&mut self, other: Module) {
		self.methods.extend(other.methods);
		self.subscriptions.extend(other.subscriptions);
	}
}

/// Maps service names to their callables. Lookups are O(1) on namespace
/// plus method name.
pub struct Registry {
	services: RwLock<HashMap<String, Module>>,
}

impl Registry {
	/// An empty registry carrying only the built-in `rpc` service.
	pub fn new() -> Arc<Self> {
		let registry = Arc::new(Registry {
			services: RwLock::new(HashMap::new()),
		});
		registry.install_builtin();
		registry
	}

	fn install_builtin(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let module = Module::new().method("modules", Arity::exact(0), move |_ctx, _params| {
			let weak = weak.clone();
			async move {
				let registry = weak
					.upgrade()
					.ok_or_else(|| RpcError::Internal("registry dropped".to_string()))?;
				serde_json::to_value(registry.modules())
					.map_err(|e| RpcError::Internal(e.to_string()))
			}
		});
		self.register("rpc", module)
			.expect("builtin rpc service registration cannot fail");
	}

	/// Registers a service under `name`. A module without callables is
	/// refused; re-registering an existing name merges, with duplicates
	/// overwriting silently.
	pub fn register(&self, name: &str, module: Module) -> Result<(), RegistryError> {
		if name.is_empty() {
			return Err(RegistryError::EmptyName);
		}
		if module.is_empty() {
			return Err(RegistryError::NoCallables(name.to_string()));
		}
		let mut services = self.services.write().expect("registry lock poisoned");
		match services.get_mut(name) {
			Some(existing) => existing.merge(module),
			None => {
				services.insert(name.to_string(), module);
			},
		}
		Ok(())
	}

	pub fn lookup(&self, namespace: &str, method: &str) -> Option<Arc<MethodDescriptor>> {
		let services = self.services.read().expect("registry lock poisoned");
		services.get(namespace)?.methods.get(method).cloned()
	}

	pub fn lookup_subscription(
		&self,
		namespace: &str,
		topic: &str,
	) -> Option<Arc<SubscriptionDescriptor>> {
		let services = self.services.read().expect("registry lock poisoned");
		services.get(namespace)?.subscriptions.get(topic).cloned()
	}

	/// Registered service names mapped to their nominal version.
	pub fn modules(&self) -> BTreeMap<String, String> {
		let services = self.services.read().expect("registry lock poisoned");
		services
			.keys()
			.map(|name| (name.clone(), MODULE_VERSION.to_string()))
			.collect()
	}

	/// A new registry restricted to the allow-listed namespaces. An empty
	/// allow-list keeps every service. The built-in `rpc` service is always
	/// present and reflects the restricted view.
	pub fn filtered(&self, allow: &[String]) -> Arc<Registry> {
		let restricted = Registry::new();
		let services = self.services.read().expect("registry lock poisoned");
		for (name, module) in services.iter() {
			if name == "rpc" {
				continue;
			}
			if allow.is_empty() || allow.iter().any(|a| a == name) {
				restricted
					.register(name, module.clone())
					.expect("copying a registered service cannot fail");
			}
		}
		restricted
	}
}
