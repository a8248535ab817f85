//! The stage-composition fabric.
//!
//! A [`Stage`] consumes one typed [`Inbox`] and produces into one typed
//! [`Outbox`]. Stages start eagerly on their own task (see [`launch`]), honour
//! the shared [`Shutdown`] token carried by the [`StageContext`], and close
//! their output by returning. Stages compose with [`StageExt::then`]; the
//! composer is typed, so mismatched pairs do not compile.

mod compose;
mod generic;
mod shutdown;
mod stage;

pub use compose::{merge, Chain, StageExt, Switch, Tee};
pub use generic::{split_list, Aggregate, Echo, Generator, Map, SplitByComma, Unique};
pub use shutdown::Shutdown;
pub use stage::{channel, launch, launch_source, BoxStage, Inbox, Outbox, Stage, StageContext};

/// Runs a source-rooted pipeline to completion and returns everything it produced.
pub async fn run_to_end<O>(stage: BoxStage<(), O>, ctx: &StageContext) -> Vec<O>
where
    O: Send + 'static,
{
    let (output, handle) = launch_source(stage, ctx);
    let items = output.collect().await;
    let _ = handle.await;
    items
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::options::OptionSet;

    struct AddOne;

    #[async_trait]
    impl Stage<u32, u32> for AddOne {
        fn name(&self) -> &'static str {
            "add-one"
        }

        async fn apply(&self, ctx: StageContext, mut inbox: Inbox<u32>, outbox: Outbox<u32>) {
            while let Some(n) = inbox.recv(&ctx).await {
                outbox.send(n + 1);
            }
        }
    }

    struct Stringify;

    #[async_trait]
    impl Stage<u32, String> for Stringify {
        fn name(&self) -> &'static str {
            "stringify"
        }

        async fn apply(&self, ctx: StageContext, mut inbox: Inbox<u32>, outbox: Outbox<String>) {
            while let Some(n) = inbox.recv(&ctx).await {
                outbox.send(n.to_string());
            }
        }
    }

    fn ctx() -> StageContext {
        StageContext::new(OptionSet::new())
    }

    #[tokio::test]
    async fn chain_preserves_order() {
        let ctx = ctx();
        let pipeline = Generator::new(vec![1u32, 2, 3]).then(AddOne).then(Stringify);
        let out = run_to_end(pipeline.boxed(), &ctx).await;
        assert_eq!(out, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn chain_is_associative() {
        let ctx = ctx();
        let left = Generator::new(vec![1u32, 5]).then(AddOne).then(AddOne.then(Stringify));
        let right = Generator::new(vec![1u32, 5]).then(AddOne).then(AddOne).then(Stringify);
        assert_eq!(run_to_end(left.boxed(), &ctx).await, run_to_end(right.boxed(), &ctx).await);
    }

    #[tokio::test]
    async fn tee_feeds_every_branch() {
        let ctx = ctx();
        let tee = Tee::new(vec![AddOne.boxed(), AddOne.then(AddOne).boxed()]);
        let mut out = run_to_end(Generator::new(vec![10u32]).then(tee).boxed(), &ctx).await;
        out.sort();
        assert_eq!(out, vec![11, 12]);
    }

    #[tokio::test]
    async fn switch_routes_by_selector() {
        let ctx = ctx();
        let switch = Switch::new(
            |n: &u32| match n % 3 {
                0 => None,
                1 => Some(0),
                _ => Some(1),
            },
            vec![AddOne.boxed(), AddOne.then(AddOne).then(AddOne).boxed()],
        );
        let mut out = run_to_end(Generator::new(vec![1u32, 2, 3]).then(switch).boxed(), &ctx).await;
        out.sort();
        assert_eq!(out, vec![2, 5]);
    }

    #[tokio::test]
    async fn merge_closes_after_all_inputs() {
        let ctx = ctx();
        let merged = merge(&ctx, vec![Inbox::from_items(vec![1, 2]), Inbox::from_items(vec![3])]);
        let mut items = merged.collect().await;
        items.sort();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn generic_stages() {
        let ctx = ctx();
        let split = Generator::new(vec!["a, b,,c".to_string(), "a".to_string()])
            .then(SplitByComma)
            .then(Unique::default());
        assert_eq!(run_to_end(split.boxed(), &ctx).await, vec!["a", "b", "c"]);

        let batches = Generator::new(vec![1u32, 2]).then(Aggregate::default());
        assert_eq!(run_to_end(batches.boxed(), &ctx).await, vec![vec![1, 2]]);

        let nothing = Generator::new(Vec::<u32>::new()).then(Aggregate::default());
        assert!(run_to_end(nothing.boxed(), &ctx).await.is_empty());

        let doubled = Generator::new(vec![1u32, 2]).then(Map::new("double", |n: u32| n * 2));
        assert_eq!(run_to_end(doubled.boxed(), &ctx).await, vec![2, 4]);
    }

    #[tokio::test]
    async fn cancelled_stage_closes_output() {
        let ctx = ctx();
        let (feed, inbox) = channel::<u32>();
        let (output, handle) = launch(AddOne.boxed(), &ctx, inbox);
        feed.send(1);
        ctx.cancel();
        let _held_open = feed;
        let items = tokio::time::timeout(Duration::from_secs(1), output.collect()).await.unwrap();
        assert!(items.len() <= 1);
        handle.await.unwrap();
        assert_eq!(ctx.live_tasks(), 0);
    }
}
