//! In-process Durable Objects.
//!
//! A [`DurableObjectNamespace`] owns one actor task per object name. Calls
//! reach the actor through a [`DurableObjectStub`] and are processed one at a
//! time, so an object never runs two methods concurrently. Arguments and
//! results cross the boundary as JSON.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::background::{BackgroundTask, BackgroundTasks, WaitUntil};
use crate::envelope::Traced;
use crate::error::{Result, RpcError};
use crate::relay;

const MAILBOX_CAPACITY: usize = 32;

/// An object addressed by name that handles RPC calls.
#[async_trait]
pub trait DurableObject: Send + 'static {
    /// Handle `method` with JSON `args`.
    async fn call(&mut self, method: &str, args: Value, ctx: &ObjectContext) -> Result<Value>;
}

/// What an object knows about its own runtime.
#[derive(Debug, Clone)]
pub struct ObjectContext {
    name: String,
    tasks: WaitUntil,
}

impl ObjectContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Background registrar that outlives individual calls.
    pub fn tasks(&self) -> &WaitUntil {
        &self.tasks
    }

    pub fn wait_until(&self, task: BackgroundTask) {
        self.tasks.wait_until(task);
    }
}

/// Deserialize call arguments into a traced envelope.
pub fn decode<A: DeserializeOwned>(args: Value) -> Result<Traced<A>> {
    Ok(serde_json::from_value(args)?)
}

/// Serialize a call result.
pub fn encode<R: Serialize>(value: &R) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

struct Call {
    method: String,
    args: Value,
    reply: oneshot::Sender<Result<Value>>,
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call").field("method", &self.method).finish()
    }
}

struct ObjectHandle {
    sender: mpsc::Sender<Call>,
    stop: oneshot::Sender<()>,
    tasks: WaitUntil,
    actor: JoinHandle<()>,
}

type Factory<O> = dyn Fn(&ObjectContext) -> O + Send + Sync;

/// Lazily created, named instances of one object type.
pub struct DurableObjectNamespace<O> {
    factory: Arc<Factory<O>>,
    objects: Arc<Mutex<HashMap<String, ObjectHandle>>>,
}

impl<O> Clone for DurableObjectNamespace<O> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            objects: Arc::clone(&self.objects),
        }
    }
}

impl<O> fmt::Debug for DurableObjectNamespace<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableObjectNamespace")
            .field("objects", &self.lock().len())
            .finish()
    }
}

impl<O> DurableObjectNamespace<O> {
    /// Number of objects started so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ObjectHandle>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<O: DurableObject> DurableObjectNamespace<O> {
    /// Create a namespace building each object with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&ObjectContext) -> O + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            objects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Stub for the object called `name`, starting it on first use.
    ///
    /// An object whose actor has died is restarted. The replacement keeps the
    /// old registrar, so background work the dead actor registered still runs
    /// and is drained by [`shutdown`](Self::shutdown).
    ///
    /// Must be called from within a tokio runtime.
    pub fn get_by_name(&self, name: &str) -> DurableObjectStub {
        let mut objects = self.lock();
        if let Some(handle) = objects.get(name).filter(|h| !h.sender.is_closed()) {
            return DurableObjectStub {
                name: name.to_string(),
                sender: handle.sender.clone(),
            };
        }

        let tasks = match objects.remove(name) {
            Some(dead) => {
                tracing::warn!(object = %name, pending = dead.tasks.pending(), "Restarting Durable Object");
                dead.tasks
            }
            None => WaitUntil::new(),
        };
        let handle = self.start(name, tasks);
        let stub = DurableObjectStub {
            name: name.to_string(),
            sender: handle.sender.clone(),
        };
        objects.insert(name.to_string(), handle);
        stub
    }

    /// Stop every object and wait for their background work.
    ///
    /// A call already running finishes first; queued calls and later calls
    /// through existing stubs fail with [`RpcError::Unavailable`]. Returns
    /// how many background tasks completed.
    pub async fn shutdown(&self) -> usize {
        let handles: Vec<ObjectHandle> = self.lock().drain().map(|(_, h)| h).collect();
        let mut completed = 0;
        for handle in handles {
            let _ = handle.stop.send(());
            if let Err(e) = handle.actor.await {
                tracing::warn!(error = %e, "Durable Object actor failed");
            }
            completed += handle.tasks.drain().await;
        }
        completed
    }

    fn start(&self, name: &str, tasks: WaitUntil) -> ObjectHandle {
        let ctx = ObjectContext {
            name: name.to_string(),
            tasks,
        };
        let mut object = (self.factory)(&ctx);
        let tasks = ctx.tasks.clone();
        let (sender, mut receiver) = mpsc::channel::<Call>(MAILBOX_CAPACITY);
        let (stop, mut stopped) = oneshot::channel::<()>();

        tracing::debug!(object = %name, "Starting Durable Object");
        let actor = tokio::spawn(async move {
            loop {
                let call = tokio::select! {
                    call = receiver.recv() => call,
                    _ = &mut stopped => None,
                };
                let Some(call) = call else {
                    break;
                };
                let result = object.call(&call.method, call.args, &ctx).await;
                if call.reply.send(result).is_err() {
                    tracing::debug!(object = %ctx.name, method = %call.method, "Caller went away");
                }
            }
            tracing::debug!(object = %ctx.name, "Durable Object stopped");
        });

        ObjectHandle {
            sender,
            stop,
            tasks,
            actor,
        }
    }
}

/// Client handle to one Durable Object.
#[derive(Debug, Clone)]
pub struct DurableObjectStub {
    name: String,
    sender: mpsc::Sender<Call>,
}

impl DurableObjectStub {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call `method` with an explicit envelope.
    pub async fn call<A, R>(&self, method: &str, args: Traced<A>) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(&args)?;
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Call {
                method: method.to_string(),
                args,
                reply,
            })
            .await
            .map_err(|_| RpcError::Unavailable(self.name.clone()))?;

        let value = response
            .await
            .map_err(|_| RpcError::Unavailable(self.name.clone()))??;
        Ok(serde_json::from_value(value)?)
    }

    /// Call `method`, attaching the active trace to `args`.
    pub async fn call_traced<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        relay::call_traced(|traced| self.call(method, traced), args).await
    }
}
