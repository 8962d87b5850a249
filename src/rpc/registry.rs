//! Method registry.
//!
//! Receivers publish their invokable methods through an explicit registration
//! table (see [`ReceiverType`]). The registry is built once at server startup
//! and is read-only afterwards, so it is shared across connections behind an
//! `Arc` without locking.
//!
//! Wire names are globally unique. Registering a second method with a name
//! that is already known fails the whole registration; overloads are not
//! supported.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::error::RegistryError;
use super::params::{Args, ParamSpec, ParamType};
use super::receiver::{ReceiverHandle, ReceiverType};

/// Future returned by a type-erased method body.
pub type MethodFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

pub(crate) type MethodHandler = Arc<dyn Fn(ReceiverHandle, Args) -> MethodFuture + Send + Sync>;

/// Deprecation notice rendered into a method's help text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deprecation {
    pub replaced_by: String,
    pub release: String,
}

/// Registration-time signature of a method.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    name: String,
    params: Vec<ParamSpec>,
    returns: Option<ParamType>,
    returns_doc: Option<String>,
    description: String,
    deprecated: Option<Deprecation>,
    start_event: Option<String>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: None,
            returns_doc: None,
            description: String::new(),
            deprecated: None,
            start_event: None,
        }
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn returns(mut self, ty: ParamType, doc: impl Into<String>) -> Self {
        self.returns = Some(ty);
        let doc = doc.into();
        self.returns_doc = (!doc.is_empty()).then_some(doc);
        self
    }

    pub fn deprecated(
        mut self,
        replaced_by: impl Into<String>,
        release: impl Into<String>,
    ) -> Self {
        self.deprecated = Some(Deprecation {
            replaced_by: replaced_by.into(),
            release: release.into(),
        });
        self
    }

    /// Name of the event stream this method starts producing.
    pub fn starts_event(mut self, event: impl Into<String>) -> Self {
        self.start_event = Some(event.into());
        self
    }
}

/// One invokable operation, bound to the receiver type that owns it.
pub struct MethodDescriptor {
    receiver: String,
    spec: MethodSpec,
    handler: MethodHandler,
}

impl MethodDescriptor {
    pub(crate) fn new(receiver: String, spec: MethodSpec, handler: MethodHandler) -> Self {
        Self {
            receiver,
            spec,
            handler,
        }
    }

    /// Wire name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Name of the receiver type that owns this method.
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.receiver, self.spec.name)
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.spec.params
    }

    /// Declared return type; `None` for void methods.
    pub fn returns(&self) -> Option<&ParamType> {
        self.spec.returns.as_ref()
    }

    pub fn description(&self) -> &str {
        &self.spec.description
    }

    pub fn deprecation(&self) -> Option<&Deprecation> {
        self.spec.deprecated.as_ref()
    }

    pub(crate) fn invoke(&self, receiver: ReceiverHandle, args: Args) -> MethodFuture {
        (self.handler)(receiver, args)
    }

    /// Human-readable help text.
    pub fn help(&self) -> String {
        let mut help = format!("{}(", self.spec.name);
        for (i, param) in self.spec.params.iter().enumerate() {
            help.push_str(if i == 0 { "\n  " } else { ",\n  " });
            help.push_str(&param.help());
        }
        help.push_str(")\n\n");
        help.push_str(&self.spec.description);

        if let Some(returns) = &self.spec.returns_doc {
            help.push_str("\n\nReturns:\n  ");
            help.push_str(returns);
        }
        if let Some(event) = &self.spec.start_event {
            help.push_str(&format!("\n\nGenerates \"{}\" events.", event));
        }
        if let Some(deprecation) = &self.spec.deprecated {
            help.push_str(&format!(
                "\n\nDeprecated in {}! Please use {} instead.",
                deprecation.release, deprecation.replaced_by
            ));
        }
        help
    }

    fn validate(&self) -> Result<(), RegistryError> {
        for param in &self.spec.params {
            param
                .resolve_default()
                .map_err(|e| RegistryError::InvalidDefault {
                    method: self.qualified_name(),
                    param: param.name.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("receiver", &self.receiver)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Name-indexed table of every method the server exposes.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    by_name: HashMap<String, Arc<MethodDescriptor>>,
    ordered: Vec<Arc<MethodDescriptor>>,
    receivers: Vec<String>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a full set of receiver types.
    pub fn from_types(types: &[ReceiverType]) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for receiver in types {
            registry.register(receiver)?;
        }
        Ok(registry)
    }

    /// Add every method of `receiver`. Either all of them are added or, on
    /// error, none are. Returns the number of methods added.
    pub fn register(&mut self, receiver: &ReceiverType) -> Result<usize, RegistryError> {
        if self.receivers.iter().any(|name| name == receiver.name()) {
            return Err(RegistryError::DuplicateReceiver(receiver.name().to_string()));
        }

        let mut incoming: HashMap<&str, &Arc<MethodDescriptor>> = HashMap::new();
        for method in receiver.methods() {
            method.validate()?;
            let clash = self
                .by_name
                .get(method.name())
                .map(|existing| existing.qualified_name())
                .or_else(|| {
                    incoming
                        .get(method.name())
                        .map(|existing| existing.qualified_name())
                });
            if let Some(existing) = clash {
                return Err(RegistryError::DuplicateMethod {
                    name: method.name().to_string(),
                    existing,
                });
            }
            incoming.insert(method.name(), method);
        }

        for method in receiver.methods() {
            self.by_name
                .insert(method.name().to_string(), Arc::clone(method));
            self.ordered.push(Arc::clone(method));
        }
        self.receivers.push(receiver.name().to_string());

        Ok(receiver.methods().len())
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.by_name.get(name).cloned()
    }

    /// All methods in registration order.
    pub fn list(&self) -> &[Arc<MethodDescriptor>] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::receiver::Receiver;

    struct Dummy;

    impl Receiver for Dummy {}

    fn dummy_type(name: &str, methods: &[&str]) -> ReceiverType {
        let mut builder = ReceiverType::builder(name, |_| Ok(Dummy));
        for method in methods {
            builder = builder.method(
                MethodSpec::new(*method).param(ParamSpec::new("x", ParamType::Int)),
                |_dummy: Arc<Dummy>, args: Args| async move { anyhow::Ok(args.int(0)?) },
            );
        }
        builder.build()
    }

    #[test]
    fn resolve_returns_registered_signature() {
        let types = vec![dummy_type("First", &["one", "two"]), dummy_type("Second", &["three"])];
        let registry = MethodRegistry::from_types(&types).unwrap();

        assert_eq!(registry.len(), 3);
        for method in registry.list() {
            let resolved = registry.resolve(method.name()).unwrap();
            assert_eq!(resolved.params().len(), 1);
        }
        assert_eq!(registry.resolve("three").unwrap().receiver(), "Second");
        assert_eq!(
            registry.resolve("one").unwrap().qualified_name(),
            "First.one"
        );
        assert!(registry.resolve("four").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected_atomically() {
        let mut registry = MethodRegistry::new();
        registry.register(&dummy_type("First", &["shared"])).unwrap();

        let err = registry
            .register(&dummy_type("Second", &["fresh", "shared"]))
            .unwrap_err();
        match err {
            RegistryError::DuplicateMethod { name, existing } => {
                assert_eq!(name, "shared");
                assert_eq!(existing, "First.shared");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(registry.resolve("fresh").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_within_one_type_is_rejected() {
        let err =
            MethodRegistry::from_types(&[dummy_type("Only", &["twice", "twice"])]).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateMethod { .. }));
    }

    #[test]
    fn duplicate_receiver_is_rejected() {
        let err = MethodRegistry::from_types(&[
            dummy_type("Same", &["a"]),
            dummy_type("Same", &["b"]),
        ])
        .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateReceiver(name) if name == "Same"));
    }

    #[test]
    fn invalid_default_fails_registration() {
        let receiver = ReceiverType::builder("Bad", |_| Ok(Dummy))
            .method(
                MethodSpec::new("broken")
                    .param(ParamSpec::new("n", ParamType::Int).default_value("many")),
                |_dummy: Arc<Dummy>, _args: Args| async move { anyhow::Ok(()) },
            )
            .build();
        let err = MethodRegistry::from_types(&[receiver]).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDefault { param, .. } if param == "n"));
    }

    #[test]
    fn help_text_layout() {
        let receiver = ReceiverType::builder("Events", |_| Ok(Dummy))
            .method(
                MethodSpec::new("eventPoll")
                    .param(
                        ParamSpec::new("number_of_events", ParamType::Int)
                            .default_value("1"),
                    )
                    .param(
                        ParamSpec::new("filter", ParamType::String)
                            .optional()
                            .describe("event name"),
                    )
                    .describe("Returns and removes the oldest n events.")
                    .returns(ParamType::List, "A list of events.")
                    .starts_event("poll")
                    .deprecated("eventWait", "r4"),
                |_dummy: Arc<Dummy>, _args: Args| async move { anyhow::Ok(Vec::<Value>::new()) },
            )
            .build();
        let registry = MethodRegistry::from_types(&[receiver]).unwrap();
        let help = registry.resolve("eventPoll").unwrap().help();

        assert_eq!(
            help,
            "eventPoll(\n  Integer number_of_events[optional, default 1],\n  \
             String filter[optional]: event name)\n\n\
             Returns and removes the oldest n events.\n\nReturns:\n  A list of events.\n\n\
             Generates \"poll\" events.\n\nDeprecated in r4! Please use eventWait instead."
        );
    }

    #[test]
    fn help_for_no_arg_method() {
        let receiver = ReceiverType::builder("Sys", |_| Ok(Dummy))
            .method(
                MethodSpec::new("ping").describe("Replies pong."),
                |_dummy: Arc<Dummy>, _args: Args| async move { anyhow::Ok("pong") },
            )
            .build();
        let registry = MethodRegistry::from_types(&[receiver]).unwrap();
        assert_eq!(registry.resolve("ping").unwrap().help(), "ping()\n\nReplies pong.");
    }
}
