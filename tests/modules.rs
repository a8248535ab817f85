// tests/modules.rs
mod common;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cloudsweep::{
    azure::{AzureApi, Page},
    modules::{run_module, ModuleId, Providers},
    options::{OptionSet, FILENAME, OUTPUT, REGIONS, RESOURCE_ID, RESOURCE_TYPE, RESOURCE_TYPES, SUBSCRIPTIONS},
    pipeline::Shutdown,
    provider::ProviderError,
};
use common::StubAws;
use serde_json::{json, Value};

#[tokio::test]
async fn aws_list_all_writes_both_reports() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let api = Arc::new(
        StubAws { regions: vec!["us-east-1".into()], ..Default::default() }
            .with_page("us-east-1", "AWS::S3::Bucket", &["logs", "assets"]),
    );
    let options = OptionSet::new()
        .with(OUTPUT, dir.path().to_string_lossy())
        .with(FILENAME, "run")
        .with(RESOURCE_TYPES, "AWS::S3::Bucket");

    let providers = Providers::default().with_aws(api);
    let produced = run_module(ModuleId::AwsListAll, options, &providers, Shutdown::new()).await?;
    assert_eq!(produced, 2);

    let json: Value = serde_json::from_str(&std::fs::read_to_string(dir.path().join("run.json"))?)?;
    assert_eq!(json["AWS::S3::Bucket"].as_array().map(Vec::len), Some(2));
    let md = std::fs::read_to_string(dir.path().join("run.md"))?;
    assert!(md.contains("## AWS::S3::Bucket"));
    assert!(md.contains("logs") && md.contains("assets"));
    Ok(())
}

#[tokio::test]
async fn cancelled_runs_finish_quietly() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let shutdown = Shutdown::new();
    shutdown.cancel();
    let options = OptionSet::new().with(OUTPUT, dir.path().to_string_lossy()).with(REGIONS, "us-east-1");
    let providers = Providers::default().with_aws(Arc::new(StubAws::default()));
    let produced = run_module(ModuleId::AwsResourcePolicies, options, &providers, shutdown).await?;
    assert_eq!(produced, 0);
    Ok(())
}

struct StubAzure;

#[async_trait]
impl AzureApi for StubAzure {
    async fn list_subscriptions(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["sub-1".to_string()])
    }

    async fn list_resources(&self, subscription: &str, _next_link: Option<&str>) -> Result<Page<Value>, ProviderError> {
        let resource = |provider: &str, name: &str| {
            json!({
                "id": format!("/subscriptions/{subscription}/resourceGroups/rg/providers/{provider}/{name}"),
                "name": name,
                "type": provider,
                "location": "eastus",
            })
        };
        let items = vec![
            resource("Microsoft.Compute/virtualMachines", "vm1"),
            resource("Microsoft.Storage/storageAccounts", "sa1"),
            resource("Microsoft.Compute/virtualMachines", "vm2"),
        ];
        Ok(Page { items, next: None })
    }

    async fn resource_graph(
        &self,
        subscription: &str,
        _query: &str,
        _skip_token: Option<&str>,
    ) -> Result<Page<Value>, ProviderError> {
        let row = json!({
            "id": format!("/subscriptions/{subscription}/resourceGroups/rg/providers/x/y/res1"),
            "name": "res1",
            "type": "x/y",
            "location": "eastus",
            "sku": "standard",
        });
        Ok(Page { items: vec![row], next: None })
    }

    async fn get_resource(
        &self,
        _resource_id: &str,
        _api_version: &str,
        _expand: Option<&str>,
    ) -> Result<Value, ProviderError> {
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn arg_scan_reports_every_builtin_template() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let options = OptionSet::new().with(OUTPUT, dir.path().to_string_lossy()).with(FILENAME, "arg");
    let providers = Providers::default().with_azure(Arc::new(StubAzure));
    let produced = run_module(ModuleId::AzureArgScan, options, &providers, Shutdown::new()).await?;
    let templates = cloudsweep::templates::builtin_templates()?;
    assert_eq!(produced, templates.len());

    let json: Value = serde_json::from_str(&std::fs::read_to_string(dir.path().join("arg.json"))?)?;
    for template in &templates {
        let group = &json[template.id.as_str()][0];
        assert_eq!(group["subscriptionId"], "sub-1");
        assert_eq!(group["resourceName"], "res1");
        assert_eq!(group["properties"]["sku"], "standard");
    }
    Ok(())
}

#[tokio::test]
async fn azure_summary_counts_each_subscription_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let options = OptionSet::new()
        .with(OUTPUT, dir.path().to_string_lossy())
        .with(FILENAME, "summary")
        .with(SUBSCRIPTIONS, "sub-1,sub-1");
    let providers = Providers::default().with_azure(Arc::new(StubAzure));
    let produced = run_module(ModuleId::AzureSummary, options, &providers, Shutdown::new()).await?;
    assert_eq!(produced, 3);

    let json: Value = serde_json::from_str(&std::fs::read_to_string(dir.path().join("summary.json"))?)?;
    let rows = json["sub-1"].as_array().cloned().unwrap_or_default();
    let counts: Vec<_> = rows.iter().map(|r| (r["ResourceType"].as_str().unwrap(), r["Count"].as_u64().unwrap())).collect();
    assert_eq!(
        counts,
        vec![("Microsoft.Compute/virtualMachines", 2), ("Microsoft.Storage/storageAccounts", 1), ("Total", 3)]
    );
    assert_eq!(rows[0]["Category"], "Compute");
    let md = std::fs::read_to_string(dir.path().join("summary.md"))?;
    assert!(md.contains("## Subscription sub-1"));
    Ok(())
}

#[tokio::test]
async fn aws_get_resource_reports_found_identifiers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let api = Arc::new(StubAws::default().with_page("eu-west-1", "AWS::S3::Bucket", &["logs", "assets"]));
    let options = OptionSet::new()
        .with(OUTPUT, dir.path().to_string_lossy())
        .with(FILENAME, "get")
        .with(REGIONS, "eu-west-1")
        .with(RESOURCE_TYPE, "AWS::S3::Bucket")
        .with(RESOURCE_ID, "logs, missing,logs");

    let providers = Providers::default().with_aws(api);
    let produced = run_module(ModuleId::AwsGetResource, options, &providers, Shutdown::new()).await?;
    assert_eq!(produced, 1);

    let json: Value = serde_json::from_str(&std::fs::read_to_string(dir.path().join("get.json"))?)?;
    let bucket = &json["AWS::S3::Bucket"][0];
    assert_eq!(bucket["Identifier"], "logs");
    assert_eq!(bucket["Region"], "eu-west-1");
    assert_eq!(bucket["AccountId"], "123456789012");
    assert_eq!(bucket["Properties"], r#"{"Name":"logs"}"#);
    Ok(())
}

#[cfg(unix)]
mod scanner_modules {
    use cloudsweep::options::{IMAGE, NP_PATH};

    use super::*;
    use crate::common::{image_tar, stub_scanner, StubRuntime};

    #[tokio::test]
    async fn empty_scope_never_starts_the_scanner() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options = OptionSet::new()
            .with(OUTPUT, dir.path().to_string_lossy())
            .with(FILENAME, "secrets")
            .with(REGIONS, "")
            .with(NP_PATH, stub_scanner(dir.path())?.to_string_lossy());
        let providers = Providers::default()
            .with_aws(Arc::new(StubAws::default()))
            .with_runtime(Arc::new(StubRuntime::new(dir.path().join("unused.tar"))));

        let produced = run_module(ModuleId::AwsFindSecrets, options, &providers, Shutdown::new()).await?;
        assert_eq!(produced, 0);
        assert!(!dir.path().join("datastore.np").exists());
        let md = std::fs::read_to_string(dir.path().join("secrets.md"))?;
        assert!(md.contains("No results."));
        Ok(())
    }

    #[tokio::test]
    async fn docker_find_secrets_scans_image_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fixture = dir.path().join("fixture.tar");
        image_tar(&fixture, "repo/app:1.0", "l1/layer.tar", &[("etc/app.env", b"TOKEN=abc"), ("empty", b"")])?;
        let runtime = Arc::new(StubRuntime::new(fixture));

        let output = dir.path().join("out");
        let options = OptionSet::new()
            .with(OUTPUT, output.to_string_lossy())
            .with(FILENAME, "docker")
            .with(IMAGE, "repo/app:1.0")
            .with(NP_PATH, stub_scanner(dir.path())?.to_string_lossy());
        let providers = Providers::default().with_aws(Arc::new(StubAws::default())).with_runtime(runtime.clone());

        let produced = run_module(ModuleId::DockerFindSecrets, options, &providers, Shutdown::new()).await?;
        assert_eq!(produced, 1);
        assert_eq!(
            *runtime.calls.lock().unwrap(),
            vec!["pull repo/app:1.0", "save repo/app:1.0", "remove repo/app:1.0"]
        );
        assert!(output.join("app_1.0").join("app_1.0.tar").is_file());

        let fed = std::fs::read_to_string(output.join("datastore.np").join("input.jsonl"))?;
        assert_eq!(fed.lines().count(), 1);
        assert!(fed.contains("l1/layer.tar,etc/app.env"));

        let json: Value = serde_json::from_str(&std::fs::read_to_string(output.join("docker.json"))?)?;
        let summary = json["scanner"][0].as_str().unwrap_or_default();
        assert!(summary.starts_with("Findings in "));
        Ok(())
    }
}
