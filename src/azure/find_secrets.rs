use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use super::SharedAzureApi;
use crate::{
    enrich::PropertiesToPayload,
    payload::{Platform, Provenance, ScannerPayload},
    pipeline::{split_list, Inbox, Outbox, Stage, StageContext, StageExt, Switch, Tee},
    resource::EnrichedResource,
};

pub const VIRTUAL_MACHINE_TYPE: &str = "Microsoft.Compute/virtualMachines";
const WEB_SITE_TYPE: &str = "Microsoft.Web/sites";
const COMPUTE_API_VERSION: &str = "2023-03-01";

/// Resource types the Azure secrets pipeline mines by default.
pub const AZURE_FIND_SECRETS_TYPES: &[&str] = &[VIRTUAL_MACHINE_TYPE, WEB_SITE_TYPE];

/// Fetches the `userData` of each virtual machine.
pub struct VirtualMachineUserData {
    api: SharedAzureApi,
}

impl VirtualMachineUserData {
    pub fn new(api: SharedAzureApi) -> Self {
        Self { api }
    }
}

fn user_data(resource: &Value) -> Option<&str> {
    resource.pointer("/properties/userData").and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[async_trait]
impl Stage<EnrichedResource, ScannerPayload> for VirtualMachineUserData {
    fn name(&self) -> &'static str {
        "azure-vm-user-data"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<EnrichedResource>, outbox: Outbox<ScannerPayload>) {
        while let Some(resource) = inbox.recv(&ctx).await {
            if !resource.type_name.eq_ignore_ascii_case(VIRTUAL_MACHINE_TYPE) {
                continue;
            }
            let fetched = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                r = self.api.get_resource(&resource.identifier, COMPUTE_API_VERSION, Some("userData")) => r,
            };
            let vm = match fetched {
                Ok(vm) => vm,
                Err(e) if e.is_benign() => {
                    debug!("No user data for {}: {e}", resource.identifier);
                    continue;
                }
                Err(e) => {
                    error!("Failed to fetch user data for {}: {e}", resource.identifier);
                    continue;
                }
            };
            let Some(encoded) = user_data(&vm) else {
                debug!("{} has no user data", resource.identifier);
                continue;
            };
            let provenance = Provenance {
                resource_type: format!("{VIRTUAL_MACHINE_TYPE}::UserData"),
                ..Provenance::for_resource(Platform::Azure, &resource)
            };
            if !outbox.send(ScannerPayload::base64(encoded, provenance)) {
                break;
            }
        }
    }
}

/// Expands the `resource-types` option for Azure; `ALL` keeps every type.
pub fn azure_find_secrets_types(option: &str) -> Option<Vec<String>> {
    let option = option.trim();
    if option.eq_ignore_ascii_case("all") {
        None
    } else if option.is_empty() {
        Some(AZURE_FIND_SECRETS_TYPES.iter().map(|t| t.to_string()).collect())
    } else {
        Some(split_list(option))
    }
}

const USER_DATA: usize = 0;
const PROPERTIES: usize = 1;

/// Routes listed Azure resources to the extraction for their type.
///
/// Virtual machines contribute their user data and their properties, every
/// other selected type its properties.
pub struct AzureFindSecrets {
    inner: Switch<EnrichedResource, ScannerPayload>,
}

impl AzureFindSecrets {
    /// `types == None` scans every listed resource.
    pub fn new(api: SharedAzureApi, types: Option<Vec<String>>) -> Self {
        let user_data = VirtualMachineUserData::new(api);
        let properties = PropertiesToPayload::new(Platform::Azure);
        let vm = Tee::new(vec![user_data.boxed(), properties.boxed()]);
        let branches = vec![vm.boxed(), PropertiesToPayload::new(Platform::Azure).boxed()];
        let select = move |resource: &EnrichedResource| {
            let selected = types
                .as_ref()
                .map_or(true, |types| types.iter().any(|t| t.eq_ignore_ascii_case(&resource.type_name)));
            if !selected {
                None
            } else if resource.type_name.eq_ignore_ascii_case(VIRTUAL_MACHINE_TYPE) {
                Some(USER_DATA)
            } else {
                Some(PROPERTIES)
            }
        };
        Self { inner: Switch::new(select, branches) }
    }
}

#[async_trait]
impl Stage<EnrichedResource, ScannerPayload> for AzureFindSecrets {
    fn name(&self) -> &'static str {
        "azure-find-secrets"
    }

    async fn apply(&self, ctx: StageContext, inbox: Inbox<EnrichedResource>, outbox: Outbox<ScannerPayload>) {
        self.inner.apply(ctx, inbox, outbox).await
    }
}
