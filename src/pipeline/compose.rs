use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug_span, Instrument};

use super::{channel, launch, BoxStage, Inbox, Outbox, Stage, StageContext};

/// `first` followed by `second`. Built with [`StageExt::then`].
pub struct Chain<I, M, O> {
    first: BoxStage<I, M>,
    second: BoxStage<M, O>,
}

impl<I, M, O> Chain<I, M, O> {
    pub fn new(first: BoxStage<I, M>, second: BoxStage<M, O>) -> Self {
        Self { first, second }
    }
}

#[async_trait]
impl<I, M, O> Stage<I, O> for Chain<I, M, O>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &'static str {
        "chain"
    }

    async fn apply(&self, ctx: StageContext, inbox: Inbox<I>, outbox: Outbox<O>) {
        let (mid, first) = launch(self.first.clone(), &ctx, inbox);
        let name = self.second.name();
        self.second.apply(ctx, mid, outbox).instrument(debug_span!("stage", stage = name)).await;
        // `second` dropped its inbox, so `first` stops at its next send.
        let _ = first.await;
    }
}

pub trait StageExt<I, O>: Stage<I, O> + Sized + 'static
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Composes `self: I → O` with `next: O → P`.
    fn then<P, S>(self, next: S) -> Chain<I, O, P>
    where
        P: Send + 'static,
        S: Stage<O, P> + 'static,
    {
        Chain::new(Arc::new(self), Arc::new(next))
    }

    fn boxed(self) -> BoxStage<I, O> {
        Arc::new(self)
    }
}

impl<I, O, T> StageExt<I, O> for T
where
    I: Send + 'static,
    O: Send + 'static,
    T: Stage<I, O> + 'static,
{
}

/// Fans several sequences into one. The result closes after every input closes.
pub fn merge<T>(ctx: &StageContext, inboxes: Vec<Inbox<T>>) -> Inbox<T>
where
    T: Send + 'static,
{
    let (outbox, merged) = channel();
    for mut inbox in inboxes {
        let outbox = outbox.clone();
        let task_ctx = ctx.clone();
        ctx.spawn(async move {
            while let Some(item) = inbox.recv(&task_ctx).await {
                if !outbox.send(item) {
                    break;
                }
            }
        });
    }
    merged
}

/// Sends every input to each branch and merges the branch outputs.
pub struct Tee<I, O> {
    branches: Vec<BoxStage<I, O>>,
}

impl<I, O> Tee<I, O> {
    pub fn new(branches: Vec<BoxStage<I, O>>) -> Self {
        Self { branches }
    }
}

#[async_trait]
impl<I, O> Stage<I, O> for Tee<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &'static str {
        "tee"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<I>, outbox: Outbox<O>) {
        let mut feeds = Vec::with_capacity(self.branches.len());
        let mut outputs = Vec::with_capacity(self.branches.len());
        let mut handles = Vec::with_capacity(self.branches.len());
        for branch in &self.branches {
            let (feed, branch_inbox) = channel();
            let (output, handle) = launch(branch.clone(), &ctx, branch_inbox);
            feeds.push(feed);
            outputs.push(output);
            handles.push(handle);
        }

        let feeder_ctx = ctx.clone();
        let feeder = ctx.spawn(async move {
            while let Some(item) = inbox.recv(&feeder_ctx).await {
                for feed in &feeds {
                    feed.send(item.clone());
                }
            }
        });

        let mut merged = merge(&ctx, outputs);
        while let Some(item) = merged.next().await {
            if !outbox.send(item) {
                break;
            }
        }
        let _ = feeder.await;
        for handle in handles {
            let _ = handle.await;
        }
    }
}

type Selector<I> = Box<dyn Fn(&I) -> Option<usize> + Send + Sync>;

/// Routes each input to the branch picked by a selector and merges the
/// branch outputs. Inputs the selector rejects are dropped.
pub struct Switch<I, O> {
    select: Selector<I>,
    branches: Vec<BoxStage<I, O>>,
}

impl<I, O> Switch<I, O> {
    pub fn new(
        select: impl Fn(&I) -> Option<usize> + Send + Sync + 'static,
        branches: Vec<BoxStage<I, O>>,
    ) -> Self {
        Self { select: Box::new(select), branches }
    }
}

#[async_trait]
impl<I, O> Stage<I, O> for Switch<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &'static str {
        "switch"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<I>, outbox: Outbox<O>) {
        let mut feeds = Vec::with_capacity(self.branches.len());
        let mut outputs = Vec::with_capacity(self.branches.len());
        let mut handles = Vec::with_capacity(self.branches.len());
        for branch in &self.branches {
            let (feed, branch_inbox) = channel();
            let (output, handle) = launch(branch.clone(), &ctx, branch_inbox);
            feeds.push(feed);
            outputs.push(output);
            handles.push(handle);
        }
        let mut merged = merge(&ctx, outputs);

        loop {
            tokio::select! {
                item = inbox.recv(&ctx), if !feeds.is_empty() => match item {
                    Some(item) => match (self.select)(&item).and_then(|i| feeds.get(i)) {
                        Some(feed) => {
                            feed.send(item);
                        }
                        None => tracing::trace!("no branch for item"),
                    },
                    // Closing the feeds lets every branch drain and finish.
                    None => feeds.clear(),
                },
                out = merged.next() => match out {
                    Some(out) => {
                        if !outbox.send(out) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        drop(feeds);
        for handle in handles {
            let _ = handle.await;
        }
    }
}
