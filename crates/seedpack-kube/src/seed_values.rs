//! Seed-specific values mixed into every extension chart

use kube::ResourceExt;
use seedpack_core::Values;
use serde_json::json;

use crate::crd::{Seed, TAINT_INVISIBLE, TAINT_PROTECTED};
use crate::error::Result;

/// Build the `gardener.*` value tree describing `seed`
///
/// `gardener.garden.identity` is only present when a garden identity is
/// configured.
pub fn seed_values(seed: &Seed, garden_identity: Option<&str>) -> Result<Values> {
    let spec = &seed.spec;

    let volume_providers = spec
        .volume
        .as_ref()
        .map(|v| v.providers.clone())
        .unwrap_or_default();
    let volume_provider = volume_providers
        .first()
        .map(|p| p.name.clone())
        .unwrap_or_default();

    let mut gardener = json!({
        "seed": {
            "identity": seed.name_any(),
            "provider": spec.provider.type_,
            "region": spec.provider.region,
            "volumeProvider": volume_provider,
            "volumeProviders": serde_json::to_value(&volume_providers)?,
            "ingressDomain": spec.dns.ingress_domain.clone().unwrap_or_default(),
            "protected": seed.has_taint(TAINT_PROTECTED),
            "visible": !seed.has_taint(TAINT_INVISIBLE),
            "taints": serde_json::to_value(&spec.taints)?,
            "networks": serde_json::to_value(&spec.networks)?,
            "blockCIDRs": spec.networks.block_cidrs,
            "spec": serde_json::to_value(spec)?,
        }
    });

    if let Some(identity) = garden_identity {
        gardener["garden"] = json!({ "identity": identity });
    }

    Ok(Values::from_mapping(json!({ "gardener": gardener }))?)
}
