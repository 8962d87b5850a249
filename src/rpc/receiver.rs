//! Receivers and the per-session receiver manager.
//!
//! A receiver groups related remotely invokable operations and may hold
//! external resources. The manager constructs each receiver type lazily on
//! first use, at most once per session, and shuts every constructed receiver
//! down exactly once when the session ends.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use super::error::{ReceiverError, RegistryError};
use super::events::EventQueue;
use super::params::Args;
use super::registry::{MethodDescriptor, MethodFuture, MethodHandler, MethodSpec};

/// Type-erased receiver instance handed to method bodies.
pub type ReceiverHandle = Arc<dyn Any + Send + Sync>;

/// A stateful object grouping related remotely invokable operations.
#[async_trait]
pub trait Receiver: Send + Sync + 'static {
    /// Release whatever the receiver acquired. Called once at session end.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a receiver constructor gets to see of its session.
#[derive(Clone)]
pub struct SessionContext {
    events: EventQueue,
}

impl SessionContext {
    pub fn new(events: EventQueue) -> Self {
        Self { events }
    }

    /// Session-wide event queue. Callback-driven receivers post here.
    pub fn events(&self) -> &EventQueue {
        &self.events
    }
}

#[derive(Clone)]
struct Instance {
    handle: ReceiverHandle,
    hooks: Arc<dyn Receiver>,
}

type Factory = Arc<dyn Fn(&SessionContext) -> anyhow::Result<Instance> + Send + Sync>;

/// Descriptor of a receiver type: its name, how to construct it, and the
/// methods it exposes.
#[derive(Clone)]
pub struct ReceiverType {
    name: String,
    factory: Factory,
    methods: Vec<Arc<MethodDescriptor>>,
}

impl ReceiverType {
    pub fn builder<R, F>(name: impl Into<String>, construct: F) -> ReceiverTypeBuilder<R>
    where
        R: Receiver,
        F: Fn(&SessionContext) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |ctx: &SessionContext| -> anyhow::Result<Instance> {
            let receiver = Arc::new(construct(ctx)?);
            let handle: ReceiverHandle = receiver.clone();
            Ok(Instance {
                handle,
                hooks: receiver,
            })
        });

        ReceiverTypeBuilder {
            name: name.into(),
            factory,
            methods: Vec::new(),
            _receiver: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[Arc<MethodDescriptor>] {
        &self.methods
    }
}

impl std::fmt::Debug for ReceiverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverType")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .finish_non_exhaustive()
    }
}

/// Registration table for one receiver type.
pub struct ReceiverTypeBuilder<R> {
    name: String,
    factory: Factory,
    methods: Vec<Arc<MethodDescriptor>>,
    _receiver: PhantomData<fn() -> R>,
}

impl<R: Receiver> ReceiverTypeBuilder<R> {
    /// Register a method. The body receives the receiver instance and the
    /// converted arguments; its output is serialized as the result, with
    /// `()` becoming `null`.
    pub fn method<F, Fut, T>(mut self, spec: MethodSpec, body: F) -> Self
    where
        F: Fn(Arc<R>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let receiver_name = self.name.clone();
        let body = Arc::new(body);
        let handler: MethodHandler =
            Arc::new(move |handle: ReceiverHandle, args: Args| -> MethodFuture {
                let body = Arc::clone(&body);
                let receiver_name = receiver_name.clone();
                Box::pin(async move {
                    let receiver = handle
                        .downcast::<R>()
                        .map_err(|_| anyhow!("receiver {} has an unexpected type", receiver_name))?;
                    let output = body(receiver, args).await?;
                    let value = serde_json::to_value(output)?;
                    anyhow::Ok(value)
                })
            });

        self.methods.push(Arc::new(MethodDescriptor::new(
            self.name.clone(),
            spec,
            handler,
        )));
        self
    }

    pub fn build(self) -> ReceiverType {
        ReceiverType {
            name: self.name,
            factory: self.factory,
            methods: self.methods,
        }
    }
}

/// Lifecycle of one receiver type within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Uninitialized,
    Active,
    ShutDown,
}

/// A receiver whose shutdown hook failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownFailure {
    pub receiver: String,
    pub error: String,
}

/// Outcome of [`ReceiverManager::shutdown_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub shut_down: Vec<String>,
    pub failures: Vec<ShutdownFailure>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Slot {
    name: String,
    factory: Factory,
    instance: OnceCell<Instance>,
    shut_down: AtomicBool,
}

/// Owns the receiver instances of one session.
pub struct ReceiverManager {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    context: SessionContext,
    // Held shared while constructing, exclusively while closing, so nothing
    // gets constructed behind shutdown_all's back.
    gate: RwLock<()>,
    closed: AtomicBool,
}

impl ReceiverManager {
    pub fn new(types: &[ReceiverType], context: SessionContext) -> Result<Self, RegistryError> {
        let mut slots = Vec::with_capacity(types.len());
        let mut index = HashMap::with_capacity(types.len());

        for receiver in types {
            if index.insert(receiver.name.clone(), slots.len()).is_some() {
                return Err(RegistryError::DuplicateReceiver(receiver.name.clone()));
            }
            slots.push(Slot {
                name: receiver.name.clone(),
                factory: Arc::clone(&receiver.factory),
                instance: OnceCell::new(),
                shut_down: AtomicBool::new(false),
            });
        }

        Ok(Self {
            slots,
            index,
            context,
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Return the session's instance of `name`, constructing it on first use.
    /// Concurrent first uses construct once.
    pub async fn get_or_create(&self, name: &str) -> Result<ReceiverHandle, ReceiverError> {
        let slot = self.slot(name)?;

        let _open = self.gate.read().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(ReceiverError::SessionClosed(name.to_string()));
        }

        let instance = slot
            .instance
            .get_or_try_init(|| async {
                debug!(receiver = %slot.name, "Constructing receiver");
                (slot.factory)(&self.context).map_err(|e| ReceiverError::Construction {
                    name: slot.name.clone(),
                    reason: format!("{:#}", e),
                })
            })
            .await?;

        Ok(Arc::clone(&instance.handle))
    }

    /// Typed variant of [`get_or_create`](Self::get_or_create).
    pub async fn get<R: Receiver>(&self, name: &str) -> Result<Arc<R>, ReceiverError> {
        self.get_or_create(name)
            .await?
            .downcast::<R>()
            .map_err(|_| ReceiverError::Construction {
                name: name.to_string(),
                reason: "receiver has a different type".to_string(),
            })
    }

    pub fn state(&self, name: &str) -> Option<ReceiverState> {
        let slot = self.slot(name).ok()?;
        Some(if slot.shut_down.load(Ordering::Acquire) {
            ReceiverState::ShutDown
        } else if slot.instance.initialized() {
            ReceiverState::Active
        } else {
            ReceiverState::Uninitialized
        })
    }

    /// Names of receivers constructed so far, in registration order.
    pub fn constructed(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|slot| slot.instance.initialized())
            .map(|slot| slot.name.clone())
            .collect()
    }

    /// Shut down every constructed receiver. Runs once; later calls return an
    /// empty report. Hook failures are logged and reported, never propagated.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        {
            let _closing = self.gate.write().await;
            if self.closed.swap(true, Ordering::AcqRel) {
                return ShutdownReport::default();
            }
        }

        let mut report = ShutdownReport::default();

        for slot in &self.slots {
            let Some(instance) = slot.instance.get() else {
                continue;
            };

            let hooks = Arc::clone(&instance.hooks);
            let outcome = tokio::spawn(async move { hooks.shutdown().await }).await;
            slot.shut_down.store(true, Ordering::Release);

            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(e) => Some(format!("shutdown hook panicked: {}", e)),
            };

            match error {
                None => {
                    debug!(receiver = %slot.name, "Receiver shut down");
                    report.shut_down.push(slot.name.clone());
                }
                Some(error) => {
                    warn!(receiver = %slot.name, error = %error, "Receiver shutdown failed");
                    report.failures.push(ShutdownFailure {
                        receiver: slot.name.clone(),
                        error,
                    });
                }
            }
        }

        info!(
            shut_down = report.shut_down.len(),
            failures = report.failures.len(),
            "Receivers shut down"
        );
        report
    }

    fn slot(&self, name: &str) -> Result<&Slot, ReceiverError> {
        self.index
            .get(name)
            .map(|&i| &self.slots[i])
            .ok_or_else(|| ReceiverError::Unknown(name.to_string()))
    }
}
