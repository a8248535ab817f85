use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug_span, trace, Instrument};

use super::Shutdown;
use crate::options::OptionSet;

/// Receiving half of a stage sequence.
#[derive(Debug)]
pub struct Inbox<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

/// Sending half of a stage sequence. The sequence closes when every clone is dropped.
#[derive(Debug)]
pub struct Outbox<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

pub fn channel<T>() -> (Outbox<T>, Inbox<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Outbox { tx }, Inbox { rx })
}

impl<T> Outbox<T> {
    /// Appends an item. Returns `false` once the consumer has gone away, at
    /// which point producers should stop.
    pub fn send(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Inbox<T> {
    /// A closed sequence holding `items`.
    pub fn from_items(items: impl IntoIterator<Item = T>) -> Self {
        let (outbox, inbox) = channel();
        for item in items {
            outbox.send(item);
        }
        inbox
    }

    /// A sequence that is already closed.
    pub fn closed() -> Self {
        Self::from_items(std::iter::empty())
    }

    /// Next item, or `None` once the sequence is closed or the pipeline is cancelled.
    pub async fn recv(&mut self, ctx: &StageContext) -> Option<T> {
        if ctx.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Next item regardless of cancellation.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Drains the sequence to completion.
    pub async fn collect(mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.rx.recv().await {
            items.push(item);
        }
        items
    }

    /// Drains the sequence, discarding items. Returns how many were seen.
    pub async fn drain(mut self) -> usize {
        let mut n = 0;
        while self.rx.recv().await.is_some() {
            n += 1;
        }
        n
    }
}

/// Decrements the live-task counter when a tracked task ends, however it ends.
struct TaskGuard(Arc<AtomicUsize>);

impl TaskGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a running stage may consult: the cancellation token, the
/// read-only option registry and the live-task counter.
#[derive(Clone, Debug)]
pub struct StageContext {
    shutdown: Shutdown,
    options: Arc<OptionSet>,
    tasks: Arc<AtomicUsize>,
}

impl StageContext {
    pub fn new(options: OptionSet) -> Self {
        Self::with_shutdown(Arc::new(options), Shutdown::new())
    }

    pub fn with_shutdown(options: Arc<OptionSet>, shutdown: Shutdown) -> Self {
        Self { shutdown, options, tasks: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    pub fn option(&self, name: &str) -> String {
        self.options.value(name)
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await
    }

    /// Number of stage and worker tasks spawned through this context that
    /// have not yet finished.
    pub fn live_tasks(&self) -> usize {
        self.tasks.load(Ordering::SeqCst)
    }

    /// Spawns a task counted by [`StageContext::live_tasks`].
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = TaskGuard::new(self.tasks.clone());
        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }
}

/// A unit of pipeline work consuming one typed sequence and producing another.
///
/// `apply` owns its `outbox`; the output sequence closes when `apply` returns
/// and every worker holding a clone of the outbox has finished. Errors are
/// logged inside the stage, never surfaced through the sequence.
#[async_trait]
pub trait Stage<I, O>: Send + Sync
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &'static str;

    async fn apply(&self, ctx: StageContext, inbox: Inbox<I>, outbox: Outbox<O>);
}

pub type BoxStage<I, O> = Arc<dyn Stage<I, O>>;

#[async_trait]
impl<I, O> Stage<I, O> for BoxStage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &'static str {
        self.as_ref().name()
    }

    async fn apply(&self, ctx: StageContext, inbox: Inbox<I>, outbox: Outbox<O>) {
        self.as_ref().apply(ctx, inbox, outbox).await
    }
}

/// Starts `stage` on its own task and returns its output sequence.
pub fn launch<I, O>(
    stage: BoxStage<I, O>,
    ctx: &StageContext,
    inbox: Inbox<I>,
) -> (Inbox<O>, JoinHandle<()>)
where
    I: Send + 'static,
    O: Send + 'static,
{
    let (outbox, output) = channel();
    let name = stage.name();
    let task_ctx = ctx.clone();
    let handle = ctx.spawn(
        async move {
            trace!("started");
            stage.apply(task_ctx, inbox, outbox).await;
            trace!("closed");
        }
        .instrument(debug_span!("stage", stage = name)),
    );
    (output, handle)
}

/// Starts a source stage, one that ignores its input.
pub fn launch_source<O>(stage: BoxStage<(), O>, ctx: &StageContext) -> (Inbox<O>, JoinHandle<()>)
where
    O: Send + 'static,
{
    launch(stage, ctx, Inbox::closed())
}
