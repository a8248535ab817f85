use std::{collections::HashSet, fmt::Display, hash::Hash, marker::PhantomData};

use async_trait::async_trait;
use tracing::debug;

use super::{Inbox, Outbox, Stage, StageContext};

/// Source stage emitting a fixed list of items.
pub struct Generator<T> {
    items: Vec<T>,
}

impl<T> Generator<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self { items: items.into_iter().collect() }
    }
}

#[async_trait]
impl<T> Stage<(), T> for Generator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "generator"
    }

    async fn apply(&self, ctx: StageContext, _inbox: Inbox<()>, outbox: Outbox<T>) {
        for item in &self.items {
            if ctx.is_cancelled() || !outbox.send(item.clone()) {
                break;
            }
        }
    }
}

/// Prints every item to stdout and passes it on.
pub struct Echo<T>(PhantomData<fn(T)>);

impl<T> Default for Echo<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<T> Stage<T, T> for Echo<T>
where
    T: Display + Send + 'static,
{
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<T>, outbox: Outbox<T>) {
        while let Some(item) = inbox.recv(&ctx).await {
            println!("{item}");
            if !outbox.send(item) {
                break;
            }
        }
    }
}

/// Applies a function to each item.
pub struct Map<I, O, F> {
    name: &'static str,
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> Map<I, O, F>
where
    F: Fn(I) -> O + Send + Sync,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f, _types: PhantomData }
    }
}

#[async_trait]
impl<I, O, F> Stage<I, O> for Map<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<I>, outbox: Outbox<O>) {
        while let Some(item) = inbox.recv(&ctx).await {
            if !outbox.send((self.f)(item)) {
                break;
            }
        }
    }
}

/// Drops items that were already seen in this run.
pub struct Unique<T>(PhantomData<fn(T)>);

impl<T> Default for Unique<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<T> Stage<T, T> for Unique<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    fn name(&self) -> &'static str {
        "unique"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<T>, outbox: Outbox<T>) {
        let mut seen = HashSet::new();
        while let Some(item) = inbox.recv(&ctx).await {
            if !seen.insert(item.clone()) {
                debug!("dropping duplicate item");
                continue;
            }
            if !outbox.send(item) {
                break;
            }
        }
    }
}

/// Splits comma-separated strings into trimmed, non-empty parts.
#[derive(Default)]
pub struct SplitByComma;

#[async_trait]
impl Stage<String, String> for SplitByComma {
    fn name(&self) -> &'static str {
        "split-by-comma"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<String>, outbox: Outbox<String>) {
        while let Some(item) = inbox.recv(&ctx).await {
            for part in split_list(&item) {
                if !outbox.send(part) {
                    return;
                }
            }
        }
    }
}

/// Collects the whole input and emits it as one batch.
pub struct Aggregate<T>(PhantomData<fn(T)>);

impl<T> Default for Aggregate<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<T> Stage<T, Vec<T>> for Aggregate<T>
where
    T: Send + 'static,
{
    fn name(&self) -> &'static str {
        "aggregate"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<T>, outbox: Outbox<Vec<T>>) {
        let mut items = Vec::new();
        while let Some(item) = inbox.recv(&ctx).await {
            items.push(item);
        }
        if !items.is_empty() {
            outbox.send(items);
        }
    }
}

/// Splits a comma-separated option value into trimmed, non-empty parts.
pub fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}
