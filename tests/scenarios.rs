// tests/scenarios.rs
mod common;

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cloudsweep::{
    aws::{CloudControlList, LaunchPermissions},
    docker::ImageExtract,
    enrich::{Enrich, Enrichment},
    options::{OptionSet, NP_FILTER, NP_OUTPUT, NP_PATH, OUTPUT, REGIONS},
    payload::{PayloadContent, Platform, Provenance, ScannerPayload},
    pipeline::{channel, launch, launch_source, merge, run_to_end, Generator, StageContext, StageExt},
    provider::ProviderError,
    resource::EnrichedResource,
    scanner::ScannerBridge,
};
use common::{image_tar, image_tar_with_root_files, StubAws};
use serde_json::Value;

#[tokio::test]
async fn empty_region_scope_lists_nothing() -> Result<()> {
    let api = Arc::new(StubAws::default().with_page("r", "X::Y", &["a"]));
    let ctx = StageContext::new(OptionSet::new().with(REGIONS, ""));
    let listing = Generator::new(vec!["X::Y".to_string()]).then(CloudControlList::new(api.clone()));
    let out = tokio::time::timeout(Duration::from_secs(1), run_to_end(listing.boxed(), &ctx)).await?;
    assert!(out.is_empty());
    assert!(api.listed.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn single_page_yields_one_record_per_item() -> Result<()> {
    let api = Arc::new(StubAws::default().with_page("r", "X::Y", &["a", "b"]));
    let ctx = StageContext::new(OptionSet::new().with(REGIONS, "r"));
    let listing = Generator::new(vec!["X::Y".to_string()]).then(CloudControlList::new(api));
    let out = run_to_end(listing.boxed(), &ctx).await;

    assert_eq!(out.len(), 2);
    let ids: HashSet<_> = out.iter().map(|r| r.identifier.as_str()).collect();
    assert_eq!(ids, HashSet::from(["a", "b"]));
    for record in &out {
        assert_eq!(record.region, "r");
        assert_eq!(record.type_name, "X::Y");
    }
    Ok(())
}

#[tokio::test]
async fn failed_enrichment_passes_the_record_through() {
    let ctx = StageContext::new(OptionSet::new());
    let input = EnrichedResource::new("ami-1", "AWS::EC2::Image", "us-east-1", "123", r#"{"k":1}"#);
    // The stub does not implement launch permissions, so every fetch fails.
    let stage = Generator::new(vec![input.clone()])
        .then(Enrich::new(LaunchPermissions::new(Arc::new(StubAws::default()))));
    assert_eq!(run_to_end(stage.boxed(), &ctx).await, vec![input]);
}

#[cfg(unix)]
#[tokio::test]
async fn scanner_receives_whole_lines_from_concurrent_feeders() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let scanner = common::stub_scanner(dir.path())?;
    let ctx = StageContext::new(
        OptionSet::new()
            .with(OUTPUT, dir.path().to_string_lossy())
            .with(NP_OUTPUT, "datastore.np")
            .with(NP_PATH, scanner.to_string_lossy())
            .with(NP_FILTER, "Scanned"),
    );

    let mut inboxes = Vec::new();
    for feeder in 0..3 {
        let (outbox, inbox) = channel();
        inboxes.push(inbox);
        tokio::spawn(async move {
            for item in 0..100 {
                let provenance = Provenance::new(
                    Platform::Aws,
                    "AWS::Lambda::Function",
                    format!("{feeder}-{item}"),
                    "us-east-1",
                    "123",
                );
                outbox.send(ScannerPayload::text(format!("feeder {feeder} line {item} {}", "x".repeat(512)), provenance));
                tokio::task::yield_now().await;
            }
        });
    }
    let (output, handle) = launch(ScannerBridge.boxed(), &ctx, merge(&ctx, inboxes));
    let lines = output.collect().await;
    handle.await?;
    assert_eq!(lines, vec!["Scanned 300 inputs"]);

    let received = std::fs::read_to_string(dir.path().join("datastore.np").join("input.jsonl"))?;
    let mut ids = HashSet::new();
    for line in received.lines() {
        let payload: ScannerPayload = serde_json::from_str(line)?;
        ids.insert(payload.provenance.resource_id);
    }
    assert_eq!(received.lines().count(), 300);
    assert_eq!(ids.len(), 300);
    Ok(())
}

struct SlowEnrichment;

#[async_trait]
impl Enrichment for SlowEnrichment {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn key(&self) -> &'static str {
        "Slow"
    }

    async fn fetch(&self, _resource: &EnrichedResource) -> Result<Option<Value>, ProviderError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Some(Value::Bool(true)))
    }
}

#[tokio::test]
async fn cancellation_closes_every_stage() -> Result<()> {
    let ctx = StageContext::new(OptionSet::new());
    let resources: Vec<_> = (0..1000)
        .map(|i| EnrichedResource::new(format!("r-{i}"), "AWS::S3::Bucket", "us-east-1", "123", "{}"))
        .collect();
    let pipeline = Generator::new(resources).then(Enrich::new(SlowEnrichment)).then(Enrich::new(SlowEnrichment));
    let (output, handle) = launch_source(pipeline.boxed(), &ctx);

    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.cancel();
    let produced = tokio::time::timeout(Duration::from_secs(1), output.collect()).await?;
    tokio::time::timeout(Duration::from_secs(1), handle).await??;

    assert!(produced.len() < 1000);
    assert_eq!(ctx.live_tasks(), 0);
    Ok(())
}

#[tokio::test]
async fn image_layers_become_payloads() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let archive = dir.path().join("app.tar");
    image_tar(&archive, "repo/app:1.0", "abc123/layer.tar", &[("a.txt", b"secret"), ("b.bin", b"")])?;

    let ctx = StageContext::new(OptionSet::new());
    let payloads = run_to_end(Generator::new(vec![archive]).then(ImageExtract).boxed(), &ctx).await;

    assert_eq!(payloads.len(), 1);
    let payload = &payloads[0];
    assert_eq!(payload.content, PayloadContent::ContentBase64(STANDARD.encode("secret")));
    assert_eq!(payload.provenance.platform, "docker");
    assert_eq!(payload.provenance.resource_type, "layer");
    let id = &payload.provenance.resource_id;
    assert!(id.contains("repo/app:1.0") && id.contains("abc123/layer.tar") && id.contains("a.txt"));
    Ok(())
}

#[tokio::test]
async fn image_root_files_carry_the_repo_tag_and_file_name() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let archive = dir.path().join("app.tar");
    image_tar_with_root_files(
        &archive,
        "repo/app:1.0",
        "abc123/layer.tar",
        &[("a.txt", b"secret")],
        &[("config.json", br#"{"Env":["TOKEN=abc"]}"#)],
    )?;

    let ctx = StageContext::new(OptionSet::new());
    let payloads = run_to_end(Generator::new(vec![archive]).then(ImageExtract).boxed(), &ctx).await;

    assert_eq!(payloads.len(), 2);
    let root: Vec<_> = payloads.iter().filter(|p| p.provenance.resource_type == "image").collect();
    assert_eq!(root.len(), 1);
    assert_eq!(root[0].provenance.platform, "docker");
    assert_eq!(root[0].provenance.resource_id, "repo/app:1.0");
    assert_eq!(root[0].provenance.region, "file:config.json");
    assert_eq!(root[0].content, PayloadContent::ContentBase64(STANDARD.encode(r#"{"Env":["TOKEN=abc"]}"#)));
    Ok(())
}
