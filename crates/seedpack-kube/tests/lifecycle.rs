//! Install and delete lifecycles against the in-memory garden and seed

use seedpack_core::conditions::find;
use seedpack_core::{Condition, ConditionStatus, ConditionType, encode_blob, package_dir};
use seedpack_kube::crd::{
    DeclaredResource, DeploymentSpec, Extension, ExtensionSpec, FINALIZER, NameRef, SeedProvider,
    extension_namespace,
};
use seedpack_kube::reconciler::reason;
use seedpack_kube::{
    ControllerConfig, ControllerError, ExtensionInstallation, ExtensionInstallationSpec,
    ExtensionRegistration, ExtensionRegistrationSpec, MockInstallationWriter, MockRegistry,
    MockSeed, ReconcileOutcome, Reconciler, Seed, SeedOp, SeedSpec, reconcile_key,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const CONFIGMAP: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ release.name }}
  namespace: {{ release.namespace }}
data:
  provider: {{ values.gardener.seed.provider }}
  region: {{ values.gardener.seed.region }}
  a: "{{ values.a }}"
  b: "{{ values.b }}"
"#;

const SECRET_KEY: &str = "provider-local_templates_configmap.yaml";

fn chart_blob(template: &str) -> String {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("Chart.yaml"),
        "name: provider-local\nversion: 0.1.0\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("values.yaml"), "a: 0\nb: 0\n").unwrap();
    std::fs::create_dir_all(dir.path().join("templates")).unwrap();
    std::fs::write(dir.path().join("templates/configmap.yaml"), template).unwrap();

    encode_blob(&package_dir(dir.path()).unwrap())
}

fn registration(name: &str, provider_config: serde_json::Value) -> ExtensionRegistration {
    ExtensionRegistration::new(
        name,
        ExtensionRegistrationSpec {
            resources: vec![DeclaredResource {
                kind: "Extension".into(),
                type_: "shoot-dns".into(),
            }],
            deployment: Some(DeploymentSpec {
                type_: Some("helm".into()),
                provider_config: Some(provider_config),
            }),
        },
    )
}

fn seed(name: &str) -> Seed {
    Seed::new(
        name,
        SeedSpec {
            provider: SeedProvider {
                type_: "aws".into(),
                region: "eu-west-1".into(),
            },
            ..Default::default()
        },
    )
}

fn installation(name: &str, registration: &str, seed: &str) -> ExtensionInstallation {
    ExtensionInstallation::new(
        name,
        ExtensionInstallationSpec {
            registration_ref: NameRef {
                name: registration.into(),
            },
            seed_ref: NameRef { name: seed.into() },
        },
    )
}

fn extension(name: &str, type_: &str) -> Extension {
    Extension::new(
        name,
        ExtensionSpec {
            type_: type_.into(),
            provider_config: None,
        },
    )
}

struct Fixture {
    registry: MockRegistry,
    seed: MockSeed,
    writer: MockInstallationWriter,
    reconciler: Reconciler,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    fn with_config(config: ControllerConfig) -> Self {
        let registry = MockRegistry::new();
        registry.add_registration(registration(
            "r1",
            json!({"chart": chart_blob(CONFIGMAP), "values": {"a": 1}}),
        ));
        registry.add_seed(seed("seed1"));
        registry.add_installation(installation("req1", "r1", "seed1"));

        let seed = MockSeed::new();
        let writer = MockInstallationWriter::new(&registry);
        let reconciler = Reconciler::new(
            Arc::new(registry.clone()),
            Arc::new(seed.clone()),
            Arc::new(writer.clone()),
            config,
        );

        Self {
            registry,
            seed,
            writer,
            reconciler,
        }
    }

    fn current(&self) -> ExtensionInstallation {
        self.registry.installation("req1").unwrap()
    }

    async fn pass(&self) -> seedpack_kube::Result<ReconcileOutcome> {
        self.reconciler.reconcile(&self.current()).await
    }

    fn condition(&self, type_: ConditionType) -> Condition {
        find(self.current().conditions(), type_).cloned().unwrap()
    }

    fn assert_condition(&self, type_: ConditionType, status: ConditionStatus, reason: &str) {
        let condition = self.condition(type_);
        assert_eq!(
            (condition.status, condition.reason.as_str()),
            (status, reason),
            "{} condition: {}",
            type_,
            condition.message
        );
    }

    /// Install, then request deletion
    ///
    /// A foreign finalizer keeps the object around after ours is released,
    /// so its final conditions stay observable.
    async fn installed_then_deleted(&self) {
        let mut inst = self.current();
        inst.metadata.finalizers = Some(vec!["other.io/keep".into()]);
        self.registry.add_installation(inst);

        assert_eq!(self.pass().await.unwrap(), ReconcileOutcome::Installed);
        self.registry.mark_for_deletion("req1");
        self.seed.reset_counts();
    }
}

// Install

#[tokio::test]
async fn test_install_publishes_chart_to_seed() {
    let f = Fixture::new();

    assert_eq!(f.pass().await.unwrap(), ReconcileOutcome::Installed);

    let labels = f.seed.namespace_labels("extension-req1").unwrap();
    assert_eq!(labels["seedpack.io/role"], "extension");
    assert_eq!(labels["seedpack.io/registration-name"], "r1");

    let secret = f.seed.secret("garden", "req1").unwrap();
    let manifest = String::from_utf8(secret[SECRET_KEY].clone()).unwrap();
    assert!(manifest.contains("name: r1"));
    assert!(manifest.contains("namespace: extension-req1"));
    assert!(manifest.contains("provider: aws"));
    assert!(manifest.contains("a: \"1\""));
    assert!(manifest.contains("b: \"0\""));

    let mr = f.seed.managed_resource("garden", "req1").unwrap();
    assert_eq!(mr.spec.class.as_deref(), Some("seed"));
    assert_eq!(mr.spec.secret_refs[0].name, "req1");

    assert!(f.current().has_finalizer());
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::True,
        reason::REGISTRATION_VALID,
    );
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::INSTALLATION_PENDING,
    );
}

#[tokio::test]
async fn test_install_is_idempotent() {
    let f = Fixture::new();
    f.pass().await.unwrap();
    let conditions = f.current().conditions().to_vec();
    let first = f.registry.counts();

    assert_eq!(f.pass().await.unwrap(), ReconcileOutcome::Installed);

    let second = f.registry.counts();
    assert_eq!(second.status_writes, first.status_writes);
    assert_eq!(second.finalizer_adds, 1);
    assert_eq!(second.skipped_status_writes, first.skipped_status_writes + 1);
    assert_eq!(f.current().conditions(), conditions.as_slice());

    // Seed writes are create-or-update confirmations
    assert_eq!(f.seed.counts().secret_applies, 2);
    assert_eq!(f.seed.counts().managed_resource_applies, 2);
}

#[tokio::test]
async fn test_registration_values_win_over_overrides() {
    let config = ControllerConfig::from_yaml(
        r#"
overrideValues:
  r1:
    a: 2
    b: 2
    gardener:
      seed:
        region: override-region
"#,
    )
    .unwrap();
    let f = Fixture::with_config(config);

    f.pass().await.unwrap();

    let secret = f.seed.secret("garden", "req1").unwrap();
    let manifest = String::from_utf8(secret[SECRET_KEY].clone()).unwrap();
    assert!(manifest.contains("a: \"1\""));
    assert!(manifest.contains("b: \"2\""));
    assert!(manifest.contains("region: override-region"));
    assert!(manifest.contains("provider: aws"));
}

#[tokio::test]
async fn test_broken_override_values_are_ignored() {
    let config = ControllerConfig::from_yaml("overrideValues:\n  r1: [1, 2]\n").unwrap();
    let f = Fixture::with_config(config);

    assert_eq!(f.pass().await.unwrap(), ReconcileOutcome::Installed);
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::True,
        reason::REGISTRATION_VALID,
    );
}

#[tokio::test]
async fn test_missing_registration_is_reported() {
    let f = Fixture::new();
    f.registry.remove_registration("r1");

    let err = f.reconciler.install(&f.current()).await.unwrap_err();
    assert!(err.is_not_found());

    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::False,
        reason::REGISTRATION_NOT_FOUND,
    );
    let counts = f.seed.counts();
    assert_eq!(counts.connects, 0);
    assert_eq!(counts.namespace_applies, 0);
    assert_eq!(counts.secret_applies, 0);
}

#[tokio::test]
async fn test_responsibility_gate() {
    let f = Fixture::new();
    f.registry.add_registration(ExtensionRegistration::new(
        "r1",
        ExtensionRegistrationSpec {
            resources: vec![],
            deployment: Some(DeploymentSpec {
                type_: Some("oci".into()),
                provider_config: None,
            }),
        },
    ));

    assert_eq!(f.pass().await.unwrap(), ReconcileOutcome::Skipped);
    assert!(!f.current().has_finalizer());
    assert!(f.current().conditions().is_empty());
    assert_eq!(f.seed.counts().connects, 0);

    // Unreadable registration: error, no writes
    f.registry.fail_registration_reads(Some(500));
    let err = f.pass().await.unwrap_err();
    assert!(!err.is_not_found());

    f.registry.fail_registration_reads(None);
    f.registry.remove_registration("r1");
    assert!(f.pass().await.unwrap_err().is_not_found());
    assert_eq!(f.registry.counts().status_writes, 0);
}

#[tokio::test]
async fn test_seed_lookup_failures() {
    let f = Fixture::new();
    f.registry.remove_seed("seed1");
    assert!(f.pass().await.unwrap_err().is_not_found());
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::False,
        reason::SEED_NOT_FOUND,
    );

    f.registry.fail_seed_reads(Some(500));
    assert!(f.pass().await.is_err());
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::Unknown,
        reason::SEED_READ_ERROR,
    );
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::Unknown,
        seedpack_core::conditions::REASON_INITIALIZED,
    );
}

#[tokio::test]
async fn test_seed_connection_failures() {
    let f = Fixture::new();
    f.seed.fail(SeedOp::Connect, 500);
    let err = f.pass().await.unwrap_err();
    assert!(matches!(err, ControllerError::SeedConnection { .. }));
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::Unknown,
        reason::CHART_RENDERER_CREATION_FAILED,
    );

    f.seed.heal(SeedOp::Connect);
    f.seed.fail(SeedOp::ServerVersion, 503);
    assert!(f.pass().await.is_err());
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::Unknown,
        reason::CHART_RENDERER_CREATION_FAILED,
    );
    assert_eq!(f.seed.counts().namespace_applies, 0);
}

#[tokio::test]
async fn test_invalid_chart_information() {
    let f = Fixture::new();
    f.registry
        .add_registration(registration("r1", json!({"chart": "not base64!", "values": {}})));

    let err = f.pass().await.unwrap_err();
    assert!(matches!(err, ControllerError::ChartInformation(_)));
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::False,
        reason::CHART_INFORMATION_INVALID,
    );
    assert_eq!(f.seed.counts().namespace_applies, 0);
}

#[tokio::test]
async fn test_render_failure() {
    let f = Fixture::new();
    f.registry.add_registration(registration(
        "r1",
        json!({"chart": chart_blob("value: {{ values.missing.key }}\n")}),
    ));

    let err = f.pass().await.unwrap_err();
    assert!(matches!(err, ControllerError::Render(_)));
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::False,
        reason::CHART_CANNOT_BE_RENDERED,
    );
    // The namespace is provisioned before rendering
    assert!(f.seed.namespace_labels("extension-req1").is_some());
    assert!(f.seed.secret("garden", "req1").is_none());
}

#[tokio::test]
async fn test_publish_failures() {
    let f = Fixture::new();
    f.seed.fail(SeedOp::ReconcileSecret, 500);
    assert!(f.pass().await.is_err());
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::True,
        reason::REGISTRATION_VALID,
    );
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::INSTALLATION_FAILED,
    );

    f.seed.heal(SeedOp::ReconcileSecret);
    f.seed.fail(SeedOp::ReconcileManagedResource, 500);
    assert!(f.pass().await.is_err());
    assert!(f.seed.secret("garden", "req1").is_some());
    assert!(f.seed.managed_resource("garden", "req1").is_none());
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::INSTALLATION_FAILED,
    );

    // Installed is no longer Unknown, so it is not reset to pending
    f.seed.heal(SeedOp::ReconcileManagedResource);
    assert_eq!(f.pass().await.unwrap(), ReconcileOutcome::Installed);
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::INSTALLATION_FAILED,
    );
}

#[tokio::test]
async fn test_status_write_failure_does_not_fail_the_pass() {
    let f = Fixture::new();
    f.writer.fail_status_writes(Some(500));

    assert_eq!(f.pass().await.unwrap(), ReconcileOutcome::Installed);
    assert!(f.current().conditions().is_empty());
}

// Delete

#[tokio::test]
async fn test_delete_waits_for_extensions_then_finishes() {
    let f = Fixture::new();
    f.installed_then_deleted().await;
    f.seed.add_extension(extension("dns", "shoot-dns"), "shoot--dev--a");
    f.seed.add_extension(extension("other", "shoot-cert"), "shoot--dev--a");

    // First pass: the matching instance existed at list time
    let outcome = f.pass().await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::DeletionPending(_)));
    assert_eq!(f.seed.counts().extension_deletes, 1);
    assert!(f.current().has_finalizer());
    assert!(f.seed.managed_resource("garden", "req1").is_some());
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::DELETION_PENDING,
    );

    // Second pass: nothing left to drain
    assert_eq!(f.pass().await.unwrap(), ReconcileOutcome::Deleted);
    assert!(f.seed.managed_resource("garden", "req1").is_none());
    assert!(f.seed.secret("garden", "req1").is_none());
    assert!(f.seed.namespace_labels("extension-req1").is_none());
    assert!(!f.current().has_finalizer());
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::DELETION_SUCCESSFUL,
    );

    // Only the unrelated extension survives
    assert_eq!(f.seed.extension_count(), 1);
}

#[tokio::test]
async fn test_delete_stays_pending_while_extensions_linger() {
    let f = Fixture::new();
    f.installed_then_deleted().await;
    f.seed.add_extension(extension("dns", "shoot-dns"), "shoot--dev--a");
    f.seed.hold_extensions(true);

    for _ in 0..3 {
        assert!(matches!(
            f.pass().await.unwrap(),
            ReconcileOutcome::DeletionPending(_)
        ));
    }
    assert!(f.current().has_finalizer());
    assert_eq!(f.seed.counts().managed_resource_deletes, 0);
}

#[tokio::test]
async fn test_drain_failure_is_aggregated() {
    let f = Fixture::new();
    f.installed_then_deleted().await;
    f.seed.add_extension(extension("a", "shoot-dns"), "shoot--dev--a");
    f.seed.add_extension(extension("b", "shoot-dns"), "shoot--dev--b");
    f.seed.fail_extension_delete("b", 500);

    let err = f.pass().await.unwrap_err();
    assert!(!err.is_not_found());
    assert!(f.current().has_finalizer());
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::DELETION_FAILED,
    );

    // Both failing: one combined error
    f.seed.add_extension(extension("a", "shoot-dns"), "shoot--dev--a");
    f.seed.fail_extension_delete("a", 403);
    match f.pass().await.unwrap_err() {
        ControllerError::Aggregate(errors) => assert_eq!(errors.len(), 2),
        other => panic!("expected an aggregate error, got {other}"),
    }
}

#[tokio::test]
async fn test_drain_ignores_vanished_extensions() {
    let f = Fixture::new();
    f.installed_then_deleted().await;
    f.seed.add_extension(extension("a", "shoot-dns"), "shoot--dev--a");
    f.seed.fail_extension_delete("a", 404);

    assert!(matches!(
        f.pass().await.unwrap(),
        ReconcileOutcome::DeletionPending(_)
    ));
}

#[tokio::test]
async fn test_extension_list_failure() {
    let f = Fixture::new();
    f.installed_then_deleted().await;
    f.seed.fail(SeedOp::ListExtensions, 500);

    assert!(f.pass().await.is_err());
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::DELETION_FAILED,
    );
    assert!(f.current().has_finalizer());
}

#[tokio::test]
async fn test_managed_resource_removal() {
    let f = Fixture::new();
    f.installed_then_deleted().await;

    f.seed.hold_managed_resources(true);
    assert!(matches!(
        f.pass().await.unwrap(),
        ReconcileOutcome::DeletionPending(_)
    ));
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::DELETION_PENDING,
    );

    f.seed.hold_managed_resources(false);
    f.seed.fail(SeedOp::DeleteManagedResource, 500);
    assert!(f.pass().await.is_err());
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::DELETION_FAILED,
    );
    assert!(f.seed.secret("garden", "req1").is_some());
    assert!(f.current().has_finalizer());
}

#[tokio::test]
async fn test_secret_deletion_failure_keeps_finalizer_until_retried() {
    let f = Fixture::new();
    f.installed_then_deleted().await;
    f.seed.fail(SeedOp::DeleteSecret, 500);

    assert!(f.pass().await.is_err());
    assert!(f.current().has_finalizer());
    assert!(f.seed.secret("garden", "req1").is_some());
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::DELETION_FAILED,
    );
    // Namespace removal is still attempted in the same pass
    assert!(f.seed.namespace_labels(&extension_namespace("req1")).is_none());

    f.seed.heal(SeedOp::DeleteSecret);
    assert_eq!(f.pass().await.unwrap(), ReconcileOutcome::Deleted);
    assert!(!f.current().has_finalizer());
    assert!(f.seed.secret("garden", "req1").is_none());
    f.assert_condition(
        ConditionType::Installed,
        ConditionStatus::False,
        reason::DELETION_SUCCESSFUL,
    );
}

#[tokio::test]
async fn test_namespace_deletion_failure_keeps_finalizer() {
    let f = Fixture::new();
    f.installed_then_deleted().await;
    f.seed.fail(SeedOp::DeleteNamespace, 500);

    assert!(f.pass().await.is_err());
    assert!(f.current().has_finalizer());
    assert!(f.seed.managed_resource("garden", "req1").is_none());
}

#[tokio::test]
async fn test_delete_without_prior_install() {
    let f = Fixture::new();
    let mut inst = f.current();
    inst.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    f.registry.add_installation(inst);
    f.registry.mark_for_deletion("req1");

    // Nothing exists on the seed: every not-found counts as done, and the
    // object disappears with its last finalizer
    assert_eq!(
        reconcile_key(&f.reconciler, "req1").await.unwrap(),
        Some(ReconcileOutcome::Deleted)
    );
    assert!(f.registry.installation("req1").is_none());
    assert_eq!(reconcile_key(&f.reconciler, "req1").await.unwrap(), None);
}

#[tokio::test]
async fn test_delete_reports_missing_seed() {
    let f = Fixture::new();
    f.installed_then_deleted().await;
    f.registry.remove_seed("seed1");

    assert!(f.pass().await.unwrap_err().is_not_found());
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::False,
        reason::SEED_NOT_FOUND,
    );
    assert!(f.current().has_finalizer());
    assert_eq!(f.seed.counts().connects, 0);
}

#[tokio::test]
async fn test_delete_classifies_seed_connection_failures() {
    let f = Fixture::new();
    f.installed_then_deleted().await;

    f.seed.fail(SeedOp::Connect, 404);
    assert!(f.pass().await.unwrap_err().is_not_found());
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::False,
        reason::SEED_NOT_FOUND,
    );
    assert!(f.current().has_finalizer());

    f.seed.fail(SeedOp::Connect, 500);
    let err = f.pass().await.unwrap_err();
    assert!(matches!(err, ControllerError::SeedConnection { .. }));
    f.assert_condition(
        ConditionType::Valid,
        ConditionStatus::Unknown,
        reason::SEED_READ_ERROR,
    );
    assert!(f.current().has_finalizer());
    assert_eq!(f.seed.counts().extension_lists, 0);
}
