//! Unit tests for the Tenant reconciler

use super::*;
use crate::reconciler::EnvironmentReconciler;
use crate::test_utils::*;
use cluster_client::{MockClusterClient, MockFailure, Verb};
use crds::FINALIZER_NAMESPACE;
use k8s_openapi::api::core::v1::Namespace;

fn key(name: &str) -> ObjectKey {
    ObjectKey::cluster(name)
}

fn finalizers(client: &MockClusterClient, name: &str) -> Vec<String> {
    let tenant: Tenant = client.object(&key(name)).unwrap();
    let mut finalizers = tenant.metadata.finalizers.unwrap_or_default();
    finalizers.sort();
    finalizers
}

/// Tenant with all four finalizers, as left by an earlier active reconcile
fn seed_finalized_tenant(ctx: &TestContext, name: &str) -> Tenant {
    let mut tenant = create_test_tenant(name);
    tenant.metadata.finalizers = Some(TENANT_FINALIZERS.iter().map(|f| f.to_string()).collect());
    ctx.client.insert(&tenant)
}

#[tokio::test]
async fn test_new_tenant_converges_in_one_pass() {
    let ctx = TestContext::new().await;
    ctx.client.insert(&create_test_tenant("acme"));
    let reconciler = TenantReconciler::new(ctx.context());

    let action = reconciler.reconcile(&key("acme")).await.unwrap();
    assert_eq!(action, Action::AwaitChange);

    let mut expected: Vec<String> = TENANT_FINALIZERS.iter().map(|f| f.to_string()).collect();
    expected.sort();
    assert_eq!(finalizers(&ctx.client, "acme"), expected);

    let quota: TenantResourceQuota = ctx.client.object(&key("acme")).unwrap();
    assert_eq!(quota.spec.hard, default_tenant_quota());
    assert_eq!(quota.labels().get(LABEL_TENANT).map(String::as_str), Some("acme"));
    let owner = &quota.metadata.owner_references.unwrap()[0];
    assert_eq!((owner.kind.as_str(), owner.name.as_str()), ("Tenant", "acme"));

    let policy: TenantNetworkPolicy = ctx.client.object(&key("acme")).unwrap();
    assert_eq!(policy.spec.tenant, "acme");
    assert!(!policy.spec.tenant_isolated);

    assert_eq!(ctx.events.reasons(), vec!["Created", "Created"]);
}

#[tokio::test]
async fn test_second_pass_writes_nothing() {
    let ctx = TestContext::new().await;
    ctx.client.insert(&create_test_tenant("acme"));
    ctx.client.insert(&create_test_environment("dev", "acme", "web", "acme-dev"));
    let reconciler = TenantReconciler::new(ctx.context());

    reconciler.reconcile(&key("acme")).await.unwrap();
    ctx.client.clear_writes();
    reconciler.reconcile(&key("acme")).await.unwrap();

    assert!(ctx.client.writes().is_empty(), "unexpected writes: {:?}", ctx.client.writes());
}

#[tokio::test]
async fn test_status_lists_environments_and_namespaces() {
    let ctx = TestContext::new().await;
    seed_finalized_tenant(&ctx, "acme");
    ctx.client.insert(&create_test_environment("dev", "acme", "web", "acme-dev"));
    ctx.client.insert(&create_test_environment("prod", "acme", "web", "acme-prod"));
    ctx.client.insert(&create_test_environment("other", "globex", "web", "globex-dev"));
    let reconciler = TenantReconciler::new(ctx.context());

    reconciler.reconcile(&key("acme")).await.unwrap();

    let tenant: Tenant = ctx.client.object(&key("acme")).unwrap();
    let status = tenant.status.unwrap();
    assert_eq!(status.environments, vec!["dev", "prod"]);
    assert_eq!(status.namespaces, vec!["acme-dev", "acme-prod"]);
    assert!(status.last_update_time.is_some());
}

#[tokio::test]
async fn test_reordered_status_is_not_rewritten() {
    let ctx = TestContext::new().await;
    let mut tenant = create_test_tenant("acme");
    tenant.metadata.finalizers = Some(TENANT_FINALIZERS.iter().map(|f| f.to_string()).collect());
    tenant.status = Some(crds::TenantStatus {
        environments: vec!["prod".into(), "dev".into()],
        namespaces: vec!["acme-prod".into(), "acme-dev".into()],
        last_update_time: None,
    });
    let tenant = ctx.client.insert(&tenant);
    let owner = owner_reference(&tenant).unwrap();
    ctx.client.insert(&default_resource_quota("acme", &owner));
    ctx.client.insert(&default_network_policy("acme", &owner));
    ctx.client.insert(&create_test_environment("dev", "acme", "web", "acme-dev"));
    ctx.client.insert(&create_test_environment("prod", "acme", "web", "acme-prod"));

    TenantReconciler::new(ctx.context())
        .reconcile(&key("acme"))
        .await
        .unwrap();

    assert!(ctx.client.writes().is_empty());
}

#[tokio::test]
async fn test_drifted_quota_owner_is_repaired() {
    let ctx = TestContext::new().await;
    let tenant = seed_finalized_tenant(&ctx, "acme");
    let mut quota = create_test_tenant_resource_quota("acme", &[("limits.cpu", "8")]);
    quota.metadata.labels = None;
    ctx.client.insert(&quota);

    TenantReconciler::new(ctx.context())
        .reconcile(&key("acme"))
        .await
        .unwrap();

    let quota: TenantResourceQuota = ctx.client.object(&key("acme")).unwrap();
    assert!(has_owner_ref(&quota.metadata, &owner_reference(&tenant).unwrap()));
    assert_eq!(quota.labels().get(LABEL_TENANT).map(String::as_str), Some("acme"));
    // Operator-set limits survive the repair
    assert_eq!(quota.spec.hard, string_map(&[("limits.cpu", "8")]));
    assert!(ctx.events.reasons().contains(&"Updated".to_string()));
}

#[tokio::test]
async fn test_failed_sub_resource_is_reported_and_retried() {
    let ctx = TestContext::new().await;
    seed_finalized_tenant(&ctx, "acme");
    ctx.client
        .fail_next::<TenantResourceQuota>(Verb::Create, MockFailure::Unavailable("etcd".into()));
    let reconciler = TenantReconciler::new(ctx.context());

    let err = reconciler.reconcile(&key("acme")).await.unwrap_err();
    assert!(err.is_transient());
    let events = ctx.events.events();
    assert_eq!(events[0].reason, "FailedCreateSubResource");
    assert!(events[0].warning);

    reconciler.reconcile(&key("acme")).await.unwrap();
    assert!(ctx.client.object::<TenantResourceQuota>(&key("acme")).is_some());
    assert!(ctx.client.object::<TenantNetworkPolicy>(&key("acme")).is_some());
}

#[tokio::test]
async fn test_missing_tenant_is_a_noop() {
    let ctx = TestContext::new().await;
    let action = TenantReconciler::new(ctx.context())
        .reconcile(&key("ghost"))
        .await
        .unwrap();
    assert_eq!(action, Action::AwaitChange);
    assert!(ctx.client.writes().is_empty());
}

#[tokio::test]
async fn test_deletion_removes_environments_before_finalizers() {
    let ctx = TestContext::new().await;
    let tenant = seed_finalized_tenant(&ctx, "acme");
    let owner = owner_reference(&tenant).unwrap();
    ctx.client.insert(&default_resource_quota("acme", &owner));
    let mut policy = default_network_policy("acme", &owner);
    policy.metadata.finalizers = Some(vec![FINALIZER_NETWORK_POLICY.to_string()]);
    ctx.client.insert(&policy);
    ctx.client.insert(&create_test_gateway("acme-gw", "acme"));
    let mut env = create_test_environment("dev", "acme", "web", "acme-dev");
    env.metadata.finalizers = Some(vec![FINALIZER_NAMESPACE.to_string()]);
    ctx.client.insert(&env);
    ctx.client.insert(&create_test_namespace("acme-dev", &[(LABEL_TENANT, "acme")]));

    ctx.client.delete::<Tenant>(&key("acme")).await.unwrap();
    let tenants = TenantReconciler::new(ctx.context());

    // Environment still cleaning up: nothing else may be torn down yet
    let action = tenants.reconcile(&key("acme")).await.unwrap();
    assert!(matches!(action, Action::RequeueAfter(_)));
    assert_eq!(finalizers(&ctx.client, "acme").len(), 4);
    assert!(ctx.client.object::<TenantResourceQuota>(&key("acme")).is_some());
    let env: Environment = ctx.client.object(&key("dev")).unwrap();
    assert!(env.metadata.deletion_timestamp.is_some());

    EnvironmentReconciler::new(ctx.context())
        .reconcile(&key("dev"))
        .await
        .unwrap();
    assert!(ctx.client.object::<Environment>(&key("dev")).is_none());
    let ns: Namespace = ctx.client.object(&key("acme-dev")).unwrap();
    assert!(ns.labels().get(LABEL_TENANT).is_none());

    assert_eq!(tenants.reconcile(&key("acme")).await.unwrap(), Action::AwaitChange);
    assert!(ctx.client.object::<Tenant>(&key("acme")).is_none());
    assert!(ctx.client.object::<TenantResourceQuota>(&key("acme")).is_none());
    assert!(ctx.client.object::<TenantGateway>(&key("acme-gw")).is_none());
    // The policy waits for its own reconciler to remove the native objects
    let policy: TenantNetworkPolicy = ctx.client.object(&key("acme")).unwrap();
    assert!(policy.metadata.deletion_timestamp.is_some());
    assert!(policy.metadata.owner_references.is_none());
}

#[tokio::test]
async fn test_deletion_resumes_from_partial_state() {
    let ctx = TestContext::new().await;
    let mut tenant = create_test_tenant("acme");
    // Crashed after the first two steps
    tenant.metadata.finalizers = Some(vec![
        FINALIZER_NETWORK_POLICY.to_string(),
        FINALIZER_GATEWAY.to_string(),
    ]);
    ctx.client.insert(&tenant);
    ctx.client.insert(&create_test_gateway("acme-gw", "acme"));
    ctx.client.delete::<Tenant>(&key("acme")).await.unwrap();

    let action = TenantReconciler::new(ctx.context())
        .reconcile(&key("acme"))
        .await
        .unwrap();

    assert_eq!(action, Action::AwaitChange);
    assert!(ctx.client.object::<Tenant>(&key("acme")).is_none());
    assert!(ctx.client.object::<TenantGateway>(&key("acme-gw")).is_none());
}

#[tokio::test]
async fn test_failed_gateway_delete_keeps_finalizer() {
    let ctx = TestContext::new().await;
    let mut tenant = create_test_tenant("acme");
    tenant.metadata.finalizers = Some(vec![FINALIZER_GATEWAY.to_string()]);
    ctx.client.insert(&tenant);
    ctx.client.insert(&create_test_gateway("acme-gw", "acme"));
    ctx.client.delete::<Tenant>(&key("acme")).await.unwrap();
    ctx.client
        .fail_next::<TenantGateway>(Verb::Delete, MockFailure::Unavailable("timeout".into()));

    let result = TenantReconciler::new(ctx.context())
        .reconcile(&key("acme"))
        .await;

    assert!(result.is_err());
    assert_eq!(finalizers(&ctx.client, "acme"), vec![FINALIZER_GATEWAY.to_string()]);
    assert_eq!(ctx.events.reasons(), vec!["FailedDelete"]);
}

#[tokio::test]
async fn test_environment_linked_only_by_spec_is_deleted_with_tenant() {
    let ctx = TestContext::new().await;
    seed_finalized_tenant(&ctx, "acme");
    let mut env = create_test_environment("dev", "acme", "web", "acme-dev");
    env.metadata.labels = None;
    env.metadata.finalizers = Some(vec![FINALIZER_NAMESPACE.to_string()]);
    ctx.client.insert(&env);

    EnvironmentReconciler::new(ctx.context())
        .reconcile(&key("dev"))
        .await
        .unwrap();
    ctx.client.delete::<Tenant>(&key("acme")).await.unwrap();

    let action = TenantReconciler::new(ctx.context())
        .reconcile(&key("acme"))
        .await
        .unwrap();

    assert!(matches!(action, Action::RequeueAfter(_)));
    assert!(ctx.client.object::<Tenant>(&key("acme")).is_some());
    let env: Environment = ctx.client.object(&key("dev")).unwrap();
    assert!(env.metadata.deletion_timestamp.is_some());
}

#[tokio::test]
async fn test_environment_with_unknown_policy_stops_polling() {
    let ctx = TestContext::new().await;
    seed_finalized_tenant(&ctx, "acme");
    let mut env = create_test_environment("dev", "acme", "web", "acme-dev");
    env.spec.delete_policy = crds::DeletePolicy::Other("archive".into());
    env.metadata.finalizers = Some(vec![FINALIZER_NAMESPACE.to_string()]);
    ctx.client.insert(&env);
    ctx.client.delete::<Environment>(&key("dev")).await.unwrap();
    ctx.client.delete::<Tenant>(&key("acme")).await.unwrap();

    let err = TenantReconciler::new(ctx.context())
        .reconcile(&key("acme"))
        .await
        .unwrap_err();

    assert!(matches!(err, ControllerError::InvalidResource { .. }));
    assert!(!err.is_transient());
    assert_eq!(finalizers(&ctx.client, "acme").len(), 4);
}

#[tokio::test]
async fn test_tenant_deleted_during_finalizer_update_is_not_repopulated() {
    let ctx = TestContext::new().await;
    let stale = create_test_tenant("acme");
    let mut stored = stale.clone();
    stored.metadata.finalizers = Some(vec![FINALIZER_GATEWAY.to_string()]);
    ctx.client.insert(&stored);
    ctx.client.delete::<Tenant>(&key("acme")).await.unwrap();

    let action = TenantReconciler::new(ctx.context())
        .reconcile_active(stale)
        .await
        .unwrap();

    assert_eq!(action, Action::AwaitChange);
    assert!(ctx.client.object::<Tenant>(&key("acme")).is_none());
    assert!(ctx.client.objects::<TenantResourceQuota>().is_empty());
    assert!(ctx.client.objects::<TenantNetworkPolicy>().is_empty());
}
