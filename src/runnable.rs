use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RunnableConfig;
use crate::error::AgentError;
use crate::types::{TaskInput, TaskOutput};

/// Default worker-pool width for [`Runnable::batch`].
pub const DEFAULT_BATCH_CONCURRENCY: usize = 8;

/// One record of a lazy output stream.
///
/// Intermediate chunks carry partial `data` (a token, a stream event); the
/// final chunk has `done = true` and, on success, the fully-assembled
/// `output`.
#[derive(Debug)]
pub struct StreamChunk<T> {
    pub data:   Option<Value>,
    pub output: Option<T>,
    pub error:  Option<String>,
    pub done:   bool,
}

impl<T> StreamChunk<T> {
    pub fn data(data: Value) -> Self {
        Self { data: Some(data), output: None, error: None, done: false }
    }

    pub fn finished(output: T) -> Self {
        Self { data: None, output: Some(output), error: None, done: true }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { data: None, output: None, error: Some(error.into()), done: true }
    }
}

/// The uniform execution contract.
///
/// Everything the engine runs (agents, chains, supervisors, middleware
/// wrappers) implements this one trait. `ctx` is the cancellation token
/// threaded through every suspension point; callers cancel it to stop
/// in-flight work.
#[async_trait]
pub trait Runnable: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Single synchronous execution. Errors use the engine taxonomy and may
    /// carry the partial output accumulated before the failure.
    async fn invoke(
        &self,
        ctx: &CancellationToken,
        input: Self::Input,
    ) -> Result<Self::Output, AgentError>;

    /// Lazy, finite, non-restartable chunk sequence. The default wraps
    /// `invoke` into a single terminal chunk; components that truly stream
    /// override it.
    fn stream<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        input: Self::Input,
    ) -> BoxStream<'a, StreamChunk<Self::Output>> {
        Box::pin(futures::stream::once(async move {
            match self.invoke(ctx, input).await {
                Ok(output) => StreamChunk::finished(output),
                Err(err) => StreamChunk::failed(err.to_string()),
            }
        }))
    }

    /// Ordered map of `invoke` over `inputs`, parallelized on a bounded
    /// worker pool. The result order always matches the input order.
    async fn batch(
        &self,
        ctx: &CancellationToken,
        inputs: Vec<Self::Input>,
    ) -> Vec<Result<Self::Output, AgentError>> {
        futures::stream::iter(inputs.into_iter().map(|input| self.invoke(ctx, input)))
            .buffered(DEFAULT_BATCH_CONCURRENCY)
            .collect()
            .await
    }

    /// This runnable's configuration (callbacks, metadata, tags,
    /// cancellation).
    fn config(&self) -> &RunnableConfig;

    /// Capability probe for the fast path. Components that implement
    /// [`FastInvoker`] override this to return themselves; composition
    /// parents use it through [`try_invoke_fast`].
    fn as_fast(&self) -> Option<&dyn FastInvoker<Input = Self::Input, Output = Self::Output>> {
        None
    }
}

/// Callback-elided invocation capability.
///
/// `invoke_fast` must produce the same successful outputs and the same error
/// taxonomy as `invoke`; the only difference is that no callbacks fire and
/// no middleware wrappers are traversed. Restricted to components whose
/// callback overhead is measurable; compositional parents propagate it to
/// children automatically.
#[async_trait]
pub trait FastInvoker: Runnable {
    async fn invoke_fast(
        &self,
        ctx: &CancellationToken,
        input: Self::Input,
    ) -> Result<Self::Output, AgentError>;
}

/// Invoke `runnable` via its fast path when it has one, falling back to the
/// regular `invoke` otherwise. Capability detection happens at runtime.
pub async fn try_invoke_fast<I, O>(
    runnable: &dyn Runnable<Input = I, Output = O>,
    ctx: &CancellationToken,
    input: I,
) -> Result<O, AgentError>
where
    I: Send + 'static,
    O: Send + 'static,
{
    match runnable.as_fast() {
        Some(fast) => fast.invoke_fast(ctx, input).await,
        None => runnable.invoke(ctx, input).await,
    }
}

/// A type-erased agent: the common currency of chains and supervisors.
pub type BoxAgent = Arc<dyn Runnable<Input = TaskInput, Output = TaskOutput>>;

/// Sequential composition of two runnables: `first`'s output feeds
/// `second`'s input. Built with [`RunnableExt::pipe`].
pub struct Piped<A, B> {
    first:  A,
    second: B,
    config: RunnableConfig,
}

impl<A, B> Piped<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second, config: RunnableConfig::new() }
    }
}

#[async_trait]
impl<A, B> Runnable for Piped<A, B>
where
    A: Runnable,
    B: Runnable<Input = A::Output>,
{
    type Input = A::Input;
    type Output = B::Output;

    /// The first component's error short-circuits; the second is never
    /// invoked.
    async fn invoke(
        &self,
        ctx: &CancellationToken,
        input: Self::Input,
    ) -> Result<Self::Output, AgentError> {
        let mid = self.first.invoke(ctx, input).await?;
        self.second.invoke(ctx, mid).await
    }

    fn config(&self) -> &RunnableConfig {
        &self.config
    }
}

/// Blanket composition helpers for sized runnables.
pub trait RunnableExt: Runnable + Sized {
    /// Feed this component's output into `next`.
    fn pipe<B>(self, next: B) -> Piped<Self, B>
    where
        B: Runnable<Input = Self::Output>,
    {
        Piped::new(self, next)
    }
}

impl<T: Runnable + Sized> RunnableExt for T {}

/// A runnable built from a plain async-free function. The workhorse of unit
/// tests and small adapters.
pub struct FnRunnable<I, O> {
    f:      Arc<dyn Fn(I) -> Result<O, AgentError> + Send + Sync>,
    config: RunnableConfig,
}

impl<I, O> FnRunnable<I, O> {
    pub fn new(f: impl Fn(I) -> Result<O, AgentError> + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f), config: RunnableConfig::new() }
    }
}

#[async_trait]
impl<I, O> Runnable for FnRunnable<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn invoke(&self, ctx: &CancellationToken, input: I) -> Result<O, AgentError> {
        if ctx.is_cancelled() {
            return Err(AgentError::canceled("fn_runnable", "invoke"));
        }
        (self.f)(input)
    }

    fn config(&self) -> &RunnableConfig {
        &self.config
    }
}
