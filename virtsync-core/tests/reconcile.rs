//! End-to-end reconciliation runs against the stub agent (real TCP) and the
//! in-memory registry.

use virtsync_core::config::{ObjectTypeConfig, OptionalRuleConfig};
use virtsync_core::model::{HostStatus, ObjectType};
use virtsync_core::reconcile::{RemovalAction, RunContext};
use virtsync_devkit::{rule, type_section, DiscoveryBuilder, MockRegistry, ReplyMode, TestHarness};

fn vm_registry() -> MockRegistry {
    MockRegistry::new()
        .with_template("Template VM", "t-vm")
        .with_group("Virtual machines", "g-vm")
}

fn vm_section() -> ObjectTypeConfig {
    type_section("Template VM", "Virtual machines")
}

fn ctx(action: RemovalAction) -> RunContext {
    RunContext::new(action).with_workers(4)
}

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

fn seed_vms(registry: &MockRegistry, count: usize) {
    for i in 0..count {
        registry.seed_host(&format!("vm-uuid-{i:03}"), &format!("vm-{i:03}"), &["g-vm"], HostStatus::Enabled);
    }
}

#[tokio::test]
async fn test_creates_missing_hosts_then_converges() {
    let harness = TestHarness::start().await.unwrap().with_registry(vm_registry());
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 3).build());
    let config = harness.config(&[(ObjectType::Vm, vm_section())]);

    let first = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert!(first.failed.is_empty(), "{:?}", first.failed);
    assert_eq!(sorted(first.added), vec!["vm-000", "vm-001", "vm-002"]);
    assert!(first.removed.is_empty());

    let stored = harness.registry.host("vm-uuid-001").unwrap();
    assert_eq!(stored.name, "vm-001");
    assert_eq!(stored.group_ids, vec!["g-vm"]);
    assert_eq!(stored.template_ids, vec!["t-vm"]);
    assert_eq!(stored.proxy_id, None);

    // Nothing changed on either side: the second run is a no-op.
    harness.registry.reset_calls();
    let second = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert!(!second.has_changes());
    assert_eq!(harness.registry.calls("host.create"), 0);
    assert_eq!(harness.registry.calls("host.delete"), 0);
    assert_eq!(harness.registry.hosts_snapshot().len(), 3);
}

#[tokio::test]
async fn test_extra_host_is_deleted() {
    let registry = vm_registry();
    seed_vms(&registry, 20);
    registry.seed_host("vm-uuid-gone", "vm-gone", &["g-vm"], HostStatus::Enabled);
    // Outside the type's groups: never a removal candidate.
    registry.seed_host("physical-01", "physical-01", &["g-other"], HostStatus::Enabled);

    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 20).build());
    let config = harness.config(&[(ObjectType::Vm, vm_section())]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert!(outcome.added.is_empty());
    assert_eq!(outcome.removed, vec!["vm-gone"]);
    assert!(harness.registry.host("vm-uuid-gone").is_none());
    assert!(harness.registry.host("physical-01").is_some());
}

#[tokio::test]
async fn test_anomaly_guard_holds_removal() {
    let registry = vm_registry();
    seed_vms(&registry, 100);
    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 89).build());
    let config = harness.config(&[(ObjectType::Vm, vm_section())]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert!(outcome.removed.is_empty());
    assert_eq!(outcome.held_back, vec![ObjectType::Vm]);
    assert_eq!(harness.registry.calls("host.delete"), 0);
    assert_eq!(harness.registry.hosts_snapshot().len(), 100);

    let forced = harness.run(&config, ctx(RemovalAction::Delete).with_force(true)).await;
    assert_eq!(forced.removed.len(), 11);
    assert!(forced.held_back.is_empty());
    assert_eq!(harness.registry.hosts_snapshot().len(), 89);
}

#[tokio::test]
async fn test_removal_below_threshold_proceeds() {
    let registry = vm_registry();
    seed_vms(&registry, 100);
    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 91).build());
    let config = harness.config(&[(ObjectType::Vm, vm_section())]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert_eq!(outcome.removed.len(), 9);
    assert!(outcome.held_back.is_empty());
    assert_eq!(harness.registry.hosts_snapshot().len(), 91);
}

#[tokio::test]
async fn test_disable_skips_already_disabled_hosts() {
    let registry = vm_registry();
    seed_vms(&registry, 20);
    registry.seed_host("vm-uuid-off", "vm-off", &["g-vm"], HostStatus::Disabled);
    registry.seed_host("vm-uuid-gone", "vm-gone", &["g-vm"], HostStatus::Enabled);

    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 20).build());
    let config = harness.config(&[(ObjectType::Vm, vm_section())]);

    let outcome = harness.run(&config, ctx(RemovalAction::Disable)).await;
    assert_eq!(outcome.removed, vec!["vm-gone"]);
    assert_eq!(harness.registry.calls("host.update"), 1);
    assert_eq!(harness.registry.host("vm-uuid-gone").unwrap().status, HostStatus::Disabled);
    assert_eq!(harness.registry.hosts_snapshot().len(), 22);
}

#[tokio::test]
async fn test_simulate_mutates_nothing_on_removal() {
    let registry = vm_registry();
    seed_vms(&registry, 20);
    registry.seed_host("vm-uuid-gone", "vm-gone", &["g-vm"], HostStatus::Enabled);

    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 20).build());
    let config = harness.config(&[(ObjectType::Vm, vm_section())]);

    let outcome = harness.run(&config, ctx(RemovalAction::Simulate)).await;
    assert!(outcome.removed.is_empty());
    assert_eq!(harness.registry.calls("host.delete"), 0);
    assert_eq!(harness.registry.calls("host.update"), 0);
    assert!(harness.registry.host("vm-uuid-gone").is_some());
}

#[tokio::test]
async fn test_optional_rules_accumulate_per_candidate() {
    let registry = vm_registry().with_template("Template Windows", "t-win");
    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    harness.discover(
        ObjectType::Vm,
        DiscoveryBuilder::new(ObjectType::Vm).object("u-win", "win-01").object("u-lnx", "lnx-01").build(),
    );
    harness
        .agent
        .answer("vm.guest.os[u-win]", "Microsoft Windows Server 2019")
        .answer("vm.folder[u-win]", "prod/windows")
        .answer("vm.guest.os[u-lnx]", "Ubuntu Linux")
        .answer("vm.folder[u-lnx]", "lab");

    let optional = |method: &str, pattern: &str, target: &str| OptionalRuleConfig {
        method: method.to_string(),
        pattern: pattern.to_string(),
        target: target.to_string(),
    };
    let mut section = vm_section();
    section.optional_groups = vec![
        optional("vm.guest.os", "windows", "Windows guests"),
        optional("vm.folder", "prod", "Production"),
        optional("vm.folder", "windows", "Windows guests"),
    ];
    section.optional_templates = vec![optional("vm.guest.os", "windows", "Template Windows")];
    let config = harness.config(&[(ObjectType::Vm, section)]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert!(outcome.failed.is_empty(), "{:?}", outcome.failed);
    assert_eq!(outcome.added.len(), 2);

    let windows_group = harness.registry.group_id("Windows guests").unwrap();
    let production_group = harness.registry.group_id("Production").unwrap();

    let win = harness.registry.host("u-win").unwrap();
    assert_eq!(win.group_ids, vec!["g-vm".to_string(), windows_group, production_group]);
    assert_eq!(win.template_ids, vec!["t-vm", "t-win"]);

    let lnx = harness.registry.host("u-lnx").unwrap();
    assert_eq!(lnx.group_ids, vec!["g-vm"]);
    assert_eq!(lnx.template_ids, vec!["t-vm"]);
}

#[tokio::test]
async fn test_inclusion_stops_at_first_failing_rule() {
    let harness = TestHarness::start().await.unwrap().with_registry(vm_registry());
    harness.discover(
        ObjectType::Vm,
        DiscoveryBuilder::new(ObjectType::Vm).object("u-on", "vm-on").object("u-off", "vm-off").build(),
    );
    harness
        .agent
        .answer("vm.powerstate[u-on]", "poweredOn")
        .answer("vm.guest.os[u-on]", "CentOS Linux")
        .answer("vm.powerstate[u-off]", "poweredOff")
        .answer("vm.guest.os[u-off]", "CentOS Linux");

    let mut section = vm_section();
    section.include = vec![rule("vm.powerstate", "poweredon"), rule("vm.guest.os", "linux")];
    let config = harness.config(&[(ObjectType::Vm, section)]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert_eq!(outcome.added, vec!["vm-on"]);
    assert!(harness.registry.host("u-off").is_none());
    assert_eq!(harness.agent.queries_with_prefix("vm.powerstate[u-off]").len(), 1);
    assert!(harness.agent.queries_with_prefix("vm.guest.os[u-off]").is_empty());
}

#[tokio::test]
async fn test_revalidation_skips_power_state() {
    let registry = vm_registry();
    registry.seed_host("u-stopped", "vm-stopped", &["g-vm"], HostStatus::Enabled);
    registry.seed_host("u-lab", "vm-lab", &["g-vm"], HostStatus::Enabled);

    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    harness.discover(
        ObjectType::Vm,
        DiscoveryBuilder::new(ObjectType::Vm).object("u-stopped", "vm-stopped").object("u-lab", "vm-lab").build(),
    );
    harness
        .agent
        .answer("vm.powerstate[u-stopped]", "poweredOff")
        .answer("vm.folder[u-stopped]", "prod")
        .answer("vm.powerstate[u-lab]", "poweredOn")
        .answer("vm.folder[u-lab]", "lab/tests");

    let mut section = vm_section();
    section.include = vec![rule("vm.powerstate", "poweredOn")];
    section.exclude = vec![rule("vm.folder", "^lab")];
    let config = harness.config(&[(ObjectType::Vm, section)]);

    // One of two managed hosts goes away, above the guard threshold.
    let outcome = harness.run(&config, ctx(RemovalAction::Delete).with_force(true)).await;
    assert_eq!(outcome.removed, vec!["vm-lab"]);
    assert!(harness.registry.host("u-stopped").is_some());
    assert!(harness.agent.queries_with_prefix("vm.powerstate[").is_empty());
}

#[tokio::test]
async fn test_no_group_resolved_aborts_before_creation() {
    let registry = MockRegistry::new().with_template("Template VM", "t-vm");
    registry.fail_method("hostgroup.create");

    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 2).build());
    let config = harness.config(&[(ObjectType::Vm, vm_section())]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].object_type, ObjectType::Vm);
    assert!(outcome.failed[0].error.contains("host group"));
    assert_eq!(harness.registry.calls("host.create"), 0);
}

#[tokio::test]
async fn test_missing_group_is_created() {
    let registry = MockRegistry::new().with_template("Template VM", "t-vm");
    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 1).build());
    let config = harness.config(&[(ObjectType::Vm, vm_section())]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert_eq!(outcome.added, vec!["vm-000"]);
    let group = harness.registry.group_id("Virtual machines").unwrap();
    assert_eq!(harness.registry.host("vm-uuid-000").unwrap().group_ids, vec![group]);
}

#[tokio::test]
async fn test_unknown_proxy_fails_the_type() {
    let harness = TestHarness::start().await.unwrap().with_registry(vm_registry());
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 1).build());
    let mut section = vm_section();
    section.proxy = Some("proxy-nowhere".to_string());
    let config = harness.config(&[(ObjectType::Vm, section)]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert_eq!(outcome.failed.len(), 1);
    assert!(outcome.failed[0].error.contains("proxy-nowhere"));
    assert!(harness.registry.hosts_snapshot().is_empty());
}

#[tokio::test]
async fn test_guest_name_overrides_interface_dns() {
    let harness = TestHarness::start().await.unwrap().with_registry(vm_registry());
    harness.discover(
        ObjectType::Vm,
        DiscoveryBuilder::new(ObjectType::Vm)
            .object("u-web", "web")
            .object("u-db", "db")
            .object("u-tmp", "tmp")
            .build(),
    );
    harness
        .agent
        .answer("vm.guest.name[u-web]", "web01.example.org")
        .answer("vm.guest.name[u-db]", "null");

    let config = harness.config(&[(ObjectType::Vm, vm_section())]);
    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert_eq!(outcome.added.len(), 3);

    assert_eq!(harness.registry.host("u-web").unwrap().dns, "web01.example.org");
    assert_eq!(harness.registry.host("u-db").unwrap().dns, "db");
    // Unanswered key: not-supported sentinel, discovery name kept.
    assert_eq!(harness.registry.host("u-tmp").unwrap().dns, "tmp");
}

#[tokio::test]
async fn test_failed_type_does_not_stop_the_run() {
    let registry = vm_registry()
        .with_template("Template HV", "t-hv")
        .with_group("Hypervisors", "g-hv");
    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    // No answer for the VM discovery key: the stub replies not-supported.
    harness.discover(
        ObjectType::Hypervisor,
        DiscoveryBuilder::new(ObjectType::Hypervisor).objects("esx", 2).build(),
    );
    let config = harness.config(&[
        (ObjectType::Vm, vm_section()),
        (ObjectType::Hypervisor, type_section("Template HV", "Hypervisors")),
    ]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].object_type, ObjectType::Vm);
    assert_eq!(sorted(outcome.added), vec!["esx-000", "esx-001"]);
}

#[tokio::test]
async fn test_rejected_host_does_not_abort_the_pass() {
    let registry = vm_registry();
    registry.reject_host("vm-uuid-001");
    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 3).build());
    let config = harness.config(&[(ObjectType::Vm, vm_section())]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert!(outcome.failed.is_empty());
    assert_eq!(sorted(outcome.added), vec!["vm-000", "vm-002"]);
}

#[tokio::test]
async fn test_unsupported_rule_answer_fails_the_type() {
    let harness = TestHarness::start().await.unwrap().with_registry(vm_registry());
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 1).build());
    let mut section = vm_section();
    section.include = vec![rule("vm.unknown.attribute", ".")];
    let config = harness.config(&[(ObjectType::Vm, section)]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert_eq!(outcome.failed.len(), 1);
    assert!(outcome.failed[0].error.contains("vm.unknown.attribute[vm-uuid-000]"));
    assert!(harness.registry.hosts_snapshot().is_empty());
}

#[tokio::test]
async fn test_aborted_pass_still_reports_created_hosts() {
    let registry = vm_registry();
    registry.seed_host("u-old", "vm-old", &["g-vm"], HostStatus::Enabled);

    let harness = TestHarness::start().await.unwrap().with_registry(registry);
    harness.discover(
        ObjectType::Vm,
        DiscoveryBuilder::new(ObjectType::Vm).object("u-new", "vm-new").object("u-old", "vm-old").build(),
    );
    // Re-validating u-old hits the not-supported sentinel after u-new was created.
    harness.agent.answer("vm.folder[u-new]", "prod");

    let mut section = vm_section();
    section.exclude = vec![rule("vm.folder", "^lab")];
    let config = harness.config(&[(ObjectType::Vm, section)]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert_eq!(outcome.failed.len(), 1);
    assert!(outcome.failed[0].error.contains("vm.folder[u-old]"));
    assert_eq!(outcome.added, vec!["vm-new"]);
    assert!(harness.registry.host("u-new").is_some());
    assert!(outcome.render_text().contains("Added hosts (1):\n  - vm-new"));
}

#[tokio::test]
async fn test_failing_candidate_keeps_sibling_creations() {
    let harness = TestHarness::start().await.unwrap().with_registry(vm_registry());
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 2).build());
    harness.agent.answer("vm.powerstate[vm-uuid-000]", "poweredOn");

    let mut section = vm_section();
    section.include = vec![rule("vm.powerstate", "poweredOn")];
    let config = harness.config(&[(ObjectType::Vm, section)]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert_eq!(outcome.failed.len(), 1);
    assert!(outcome.failed[0].error.contains("vm.powerstate[vm-uuid-001]"));
    assert_eq!(outcome.added, vec!["vm-000"]);
    assert!(harness.registry.host("vm-uuid-000").is_some());
    assert!(harness.registry.host("vm-uuid-001").is_none());
}

#[tokio::test]
async fn test_raw_agent_replies_are_accepted() {
    let harness = TestHarness::start().await.unwrap().with_registry(vm_registry());
    harness.agent.set_reply_mode(ReplyMode::Raw);
    harness.discover(ObjectType::Vm, DiscoveryBuilder::new(ObjectType::Vm).objects("vm", 2).build());
    let config = harness.config(&[(ObjectType::Vm, vm_section())]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert!(outcome.failed.is_empty(), "{:?}", outcome.failed);
    assert_eq!(outcome.added.len(), 2);
}

#[tokio::test]
async fn test_names_as_identifiers() {
    let harness = TestHarness::start().await.unwrap().with_registry(
        MockRegistry::new()
            .with_template("Template DS", "t-ds")
            .with_group("Datastores", "g-ds"),
    );
    harness.discover(
        ObjectType::Datastore,
        DiscoveryBuilder::new(ObjectType::Datastore).object("ds-uuid-1", "nfs-prod").build(),
    );
    let mut section = type_section("Template DS", "Datastores");
    section.use_uuid = false;
    let config = harness.config(&[(ObjectType::Datastore, section)]);

    let outcome = harness.run(&config, ctx(RemovalAction::Delete)).await;
    assert_eq!(outcome.added, vec!["nfs-prod"]);
    assert!(harness.registry.host("nfs-prod").is_some());
}
