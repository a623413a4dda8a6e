mod common;

use common::*;
use pretty_assertions::assert_eq;
use reconcile_model::{EntitySchema, FieldDef, ModelHandler, ModelRegistry, OwnershipMarker, SourceKind};
use reconcile_store::{Datastore, FieldMap, Row, RowPatch, SqliteStore, StatusChange, StoredValue};
use reconcile_sync::{
    ActiveSource, CancelToken, DeletePolicy, EntryError, LoadError, Operation, Outcome, Phase,
    RunParams, RunStatus, ScopeFilter, Side, SnapshotAdapter, SnapshotDocument, SnapshotRecord,
    SyncConfig,
    SyncEngine, SyncError, TransactionScope, WarningKind,
};
use reconcile_types::{SourceId, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn set_role(doc: &mut SnapshotDocument, model_type: &str, role: &str) {
    for record in doc.records_mut(model_type) {
        record.attributes.insert("role".into(), role.into());
    }
}

fn unowned_prefix(network: &str, role: &str) -> Row {
    let fields = FieldMap::from([
        ("network".to_string(), StoredValue::Plain(network.into())),
        ("role".to_string(), StoredValue::Plain(role.into())),
        ("description".to_string(), StoredValue::Plain(Value::Null)),
    ]);
    Row::new("prefix", key(network), fields)
}

// ── Prefix lifecycle ─────────────────────────────────────────────

#[tokio::test]
async fn prefix_create_update_safe_delete() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let mut doc = SnapshotDocument::new().record("prefix", prefix("10.0.0.0/24", "access"));

    let created = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(created.status, RunStatus::Completed);
    assert_eq!(created.changeset.len(), 1);
    assert_eq!(
        created.changeset.keys("prefix", Operation::Create),
        BTreeSet::from([key("10.0.0.0/24")])
    );
    let r = row(&*store, "prefix", "10.0.0.0/24");
    assert_eq!(r.owner.as_ref().map(|o| o.source.as_str()), Some(IPAM));
    assert_eq!(plain(&r, "role"), Value::from("access"));

    let again = sync(&engine, &doc, RunParams::default()).await;
    assert!(again.changeset.is_empty());
    assert_eq!(again.changeset.summary().no_change, 1);

    set_role(&mut doc, "prefix", "core");
    let updated = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(updated.changeset.len(), 1);
    let entry = &updated.changeset.entries()[0];
    assert_eq!(entry.operation, Operation::Update);
    assert_eq!(entry.old, attrs(&[("role", "access".into())]));
    assert_eq!(entry.new, attrs(&[("role", "core".into())]));
    assert_eq!(entry.outcome(), Some(&Outcome::Updated));
    assert_eq!(plain(&row(&*store, "prefix", "10.0.0.0/24"), "role"), Value::from("core"));

    doc.remove("prefix", |_| true);
    let deleted = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(
        deleted.changeset.keys("prefix", Operation::Delete),
        BTreeSet::from([key("10.0.0.0/24")])
    );
    assert_eq!(deleted.counts_for("prefix").deleted, 1);
    let r = row(&*store, "prefix", "10.0.0.0/24");
    assert_eq!(r.status.as_deref(), Some("deprecated"));
    assert!(r.tags.contains("marked-for-deletion"));

    let settled = sync(&engine, &doc, RunParams::default()).await;
    assert!(settled.changeset.is_empty());
}

#[tokio::test]
async fn second_run_is_empty() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let doc = make_network_doc()
        .record("vlan", vlan("hq", 10, "users"))
        .record("vlan", vlan("hq", 20, "voice"))
        .record("interface", interface("router1", "eth0", &["hq__20", "hq__10"]))
        .record("location", SnapshotRecord::default().identifier("name", "campus"));

    let first = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(first.status, RunStatus::Completed, "{first}");
    assert_eq!(first.totals().created, 7);

    let second = sync(&engine, &doc, RunParams::default()).await;
    assert!(second.changeset.is_empty(), "{}", second.changeset);
    assert_eq!(second.totals(), Default::default());
}

#[tokio::test]
async fn formatting_noise_is_not_a_change() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let mut doc = make_network_doc();
    sync(&engine, &doc, RunParams::default()).await;

    set_role(&mut doc, "device", "  CORE ");
    for record in doc.records_mut("device") {
        if record.identifiers.get("name") == Some(&Value::from("switch1")) {
            record.attributes.insert("role".into(), " Access".into());
        }
    }
    // router1 stays core, switch1 stays access
    let result = sync(&engine, &doc, RunParams::default()).await;
    assert!(result.changeset.is_empty(), "{}", result.changeset);
}

#[tokio::test]
async fn reference_keys_follow_target_normalization() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let doc = SnapshotDocument::new()
        .record("site", site("HQ"))
        .record("device", device("router1", "Hq", "core"));

    let first = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(first.status, RunStatus::Completed, "{first}");
    let second = sync(&engine, &doc, RunParams::default()).await;
    assert!(second.changeset.is_empty(), "{}", second.changeset);
}

// ── Ownership ────────────────────────────────────────────────────

#[tokio::test]
async fn unowned_match_is_claimed_not_created() {
    let store = memory_store();
    store.insert(&unowned_prefix("10.0.0.0/24", "access")).unwrap();
    let engine = make_ipam_engine(store.clone());
    let doc = SnapshotDocument::new().record("prefix", prefix("10.0.0.0/24", "access"));

    let result = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(result.changeset.len(), 1);
    let entry = &result.changeset.entries()[0];
    assert_eq!(entry.operation, Operation::Update);
    assert!(entry.claim);
    assert!(entry.new.is_empty());
    assert_eq!(entry.outcome(), Some(&Outcome::Claimed));
    assert_eq!(store.count("prefix").unwrap(), 1);
    assert_eq!(result.counts_for("prefix").updated, 1);
    assert_eq!(result.counts_for("prefix").created, 0);

    let r = row(&*store, "prefix", "10.0.0.0/24");
    assert_eq!(r.owner.map(|o| o.source), Some(SourceId::new(IPAM)));

    let again = sync(&engine, &doc, RunParams::default()).await;
    assert!(again.changeset.is_empty());
}

#[tokio::test]
async fn declarative_source_cannot_overwrite_discovery_fields() {
    let store = memory_store();
    let scanner = make_engine(store.clone(), SCANNER, SourceKind::Discovery);
    let ipam = make_ipam_engine(store.clone());

    let mut discovered = make_network_doc();
    for record in discovered.records_mut("device") {
        record.attributes.insert("serial".into(), "S1".into());
    }
    sync(&scanner, &discovered, RunParams::default()).await;

    let mut curated = discovered.clone();
    for record in curated.records_mut("device") {
        record.attributes.insert("serial".into(), "S2".into());
    }
    set_role(&mut curated, "device", "edge");

    let result = sync(&ipam, &curated, RunParams::default()).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.counts_for("device").updated, 2);
    assert_eq!(result.conflicts.len(), 2);
    assert!(result.conflicts.iter().all(|c| c.withheld == ["serial"]));
    assert!(
        result
            .conflicts
            .iter()
            .all(|c| c.owner == Some(SourceId::new(SCANNER)))
    );

    let r = row(&*store, "device", "router1");
    assert_eq!(plain(&r, "serial"), Value::from("S1"));
    assert_eq!(plain(&r, "role"), Value::from("edge"));
    assert_eq!(r.owner.map(|o| o.source), Some(SourceId::new(SCANNER)));
}

#[tokio::test]
async fn update_of_only_withheld_fields_is_skipped() {
    let store = memory_store();
    let scanner = make_engine(store.clone(), SCANNER, SourceKind::Discovery);
    let ipam = make_ipam_engine(store.clone());
    let mut doc = make_network_doc();
    sync(&scanner, &doc, RunParams::default()).await;

    for record in doc.records_mut("device") {
        record.attributes.insert("serial".into(), "S9".into());
    }
    let result = sync(&ipam, &doc, RunParams::default()).await;
    assert_eq!(result.counts_for("device").skipped_conflict, 2);
    assert_eq!(result.counts_for("device").updated, 0);
    assert!(
        result
            .changeset
            .for_model("device")
            .all(|e| e.outcome() == Some(&Outcome::SkippedConflict))
    );
    assert_eq!(plain(&row(&*store, "device", "router1"), "serial"), Value::Null);
}

#[tokio::test]
async fn discovery_source_writes_only_its_fields_on_curated_rows() {
    let store = memory_store();
    let scanner = make_engine(store.clone(), SCANNER, SourceKind::Discovery);
    let ipam = make_ipam_engine(store.clone());
    let mut doc = make_network_doc();
    sync(&ipam, &doc, RunParams::default()).await;

    for record in doc.records_mut("device") {
        record.attributes.insert("serial".into(), "S1".into());
    }
    set_role(&mut doc, "device", "edge");
    let result = sync(&scanner, &doc, RunParams::default()).await;

    let r = row(&*store, "device", "router1");
    assert_eq!(plain(&r, "serial"), Value::from("S1"));
    assert_eq!(plain(&r, "role"), Value::from("core"));
    assert!(result.conflicts.iter().all(|c| c.withheld == ["role"]));
}

#[tokio::test]
async fn foreign_rows_are_never_deleted() {
    let store = memory_store();
    let scanner = make_engine(store.clone(), SCANNER, SourceKind::Discovery);
    let ipam = make_ipam_engine(store.clone());
    sync(&scanner, &make_network_doc(), RunParams::default()).await;

    let params = RunParams {
        delete_policy: DeletePolicy::Hard,
        ..RunParams::default()
    };
    let result = sync(&ipam, &SnapshotDocument::new(), params).await;
    assert_eq!(result.totals().skipped_conflict, 3);
    assert_eq!(result.totals().deleted, 0);
    assert_eq!(store.count("device").unwrap(), 2);
    assert_eq!(store.count("site").unwrap(), 1);
}

#[tokio::test]
async fn sync_tagged_only_ignores_rows_of_others() {
    let store = memory_store();
    store.insert(&unowned_prefix("10.0.1.0/24", "legacy")).unwrap();
    let engine = make_ipam_engine(store.clone());
    let doc = SnapshotDocument::new().record("prefix", prefix("10.0.0.0/24", "access"));
    sync(&engine, &doc, RunParams::default()).await;
    // Soft-deleted, but left unowned.
    let legacy = row(&*store, "prefix", "10.0.1.0/24");
    assert!(legacy.owner.is_none());

    let params = RunParams {
        sync_tagged_only: true,
        delete_policy: DeletePolicy::Hard,
        ..RunParams::default()
    };
    let result = sync(&engine, &SnapshotDocument::new(), params).await;
    assert_eq!(
        result.changeset.keys("prefix", Operation::Delete),
        BTreeSet::from([key("10.0.0.0/24")])
    );
    assert!(store.find_by_key("prefix", &key("10.0.1.0/24")).unwrap().is_some());
}

#[tokio::test]
async fn hidden_unowned_row_is_claimed_on_create() {
    let store = memory_store();
    store.insert(&unowned_prefix("10.0.0.0/24", "access")).unwrap();
    let engine = make_ipam_engine(store.clone());
    let doc = SnapshotDocument::new().record("prefix", prefix("10.0.0.0/24", "core"));

    let params = RunParams {
        sync_tagged_only: true,
        ..RunParams::default()
    };
    let result = sync(&engine, &doc, params).await;
    let entry = &result.changeset.entries()[0];
    assert_eq!(entry.operation, Operation::Create);
    assert_eq!(entry.outcome(), Some(&Outcome::Claimed));
    assert_eq!(store.count("prefix").unwrap(), 1);
    let r = row(&*store, "prefix", "10.0.0.0/24");
    assert_eq!(plain(&r, "role"), Value::from("core"));
    assert!(r.owner.is_some());
}

#[tokio::test]
async fn hidden_soft_deleted_row_is_restored_when_claimed() {
    let store = memory_store();
    let mut hidden = unowned_prefix("10.0.0.0/24", "access").with_status("active");
    hidden.apply_patch(&RowPatch {
        status: Some(StatusChange::SoftDelete {
            status: "deprecated".into(),
        }),
        add_tags: BTreeSet::from(["marked-for-deletion".to_string()]),
        ..RowPatch::default()
    });
    store.insert(&hidden).unwrap();
    let engine = make_ipam_engine(store.clone());
    let doc = SnapshotDocument::new().record("prefix", prefix("10.0.0.0/24", "core"));

    let params = RunParams {
        sync_tagged_only: true,
        ..RunParams::default()
    };
    let result = sync(&engine, &doc, params.clone()).await;
    assert_eq!(result.changeset.entries()[0].outcome(), Some(&Outcome::Claimed));

    let r = row(&*store, "prefix", "10.0.0.0/24");
    assert_eq!(r.status.as_deref(), Some("active"));
    assert!(!r.tags.contains("marked-for-deletion"));
    assert_eq!(plain(&r, "role"), Value::from("core"));

    let again = sync(&engine, &doc, params).await;
    assert!(again.changeset.is_empty(), "{}", again.changeset);
}

#[tokio::test]
async fn hidden_foreign_row_blocks_create() {
    let store = memory_store();
    let marker = OwnershipMarker::now(SourceId::new(SCANNER), SourceKind::Discovery);
    store
        .insert(&unowned_prefix("10.0.0.0/24", "access").with_owner(marker))
        .unwrap();
    let engine = make_ipam_engine(store.clone());
    let doc = SnapshotDocument::new().record("prefix", prefix("10.0.0.0/24", "core"));

    let params = RunParams {
        sync_tagged_only: true,
        ..RunParams::default()
    };
    let result = sync(&engine, &doc, params).await;
    assert_eq!(result.counts_for("prefix").skipped_conflict, 1);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(plain(&row(&*store, "prefix", "10.0.0.0/24"), "role"), Value::from("access"));
}

#[tokio::test]
async fn reference_identifiers_use_the_target_canonical_key() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    // Site names are lowercased; the vlan's key embeds the site as written.
    let doc = SnapshotDocument::new()
        .record("site", site("HQ"))
        .record("vlan", vlan("HQ", 10, "users"));

    let first = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(
        first.changeset.keys("vlan", Operation::Create),
        BTreeSet::from([key("hq__10")])
    );

    for _ in 0..2 {
        let again = sync(&engine, &doc, RunParams::default()).await;
        assert!(again.changeset.is_empty(), "{}", again.changeset);
    }
    let r = row(&*store, "vlan", "hq__10");
    assert_eq!(r.status, None);
    assert!(r.tags.is_empty());
    assert_eq!(store.count("vlan").unwrap(), 1);
}

// ── Deletes ──────────────────────────────────────────────────────

#[tokio::test]
async fn safe_delete_is_reversible() {
    let store = memory_store();
    store
        .insert(&unowned_prefix("10.0.0.0/24", "access").with_status("active"))
        .unwrap();
    let engine = make_ipam_engine(store.clone());
    let doc = SnapshotDocument::new().record("prefix", prefix("10.0.0.0/24", "access"));

    sync(&engine, &doc, RunParams::default()).await;
    let before = row(&*store, "prefix", "10.0.0.0/24");

    sync(&engine, &SnapshotDocument::new(), RunParams::default()).await;
    let deleted = row(&*store, "prefix", "10.0.0.0/24");
    assert_eq!(deleted.status.as_deref(), Some("deprecated"));
    assert!(deleted.tags.contains("marked-for-deletion"));

    let result = sync(&engine, &doc, RunParams::default()).await;
    let entry = &result.changeset.entries()[0];
    assert!(entry.recover);
    assert_eq!(entry.outcome(), Some(&Outcome::Recovered));

    let after = row(&*store, "prefix", "10.0.0.0/24");
    assert_eq!(after.status, before.status);
    assert_eq!(after.tags, before.tags);
    assert_eq!(after.fields, before.fields);
    assert_eq!(after.prior_status, None);

    let settled = sync(&engine, &doc, RunParams::default()).await;
    assert!(settled.changeset.is_empty());
}

#[tokio::test]
async fn recovery_can_be_disabled_per_type() {
    let registry = ModelRegistry::builder()
        .register(
            EntitySchema::new("prefix")
                .identifier(FieldDef::scalar("network"))
                .attribute(FieldDef::scalar("role"))
                .auto_recover(false),
        )
        .build()
        .unwrap();
    let store = memory_store();
    let engine = SyncEngine::new(
        Arc::new(registry),
        store.clone(),
        ActiveSource::new(IPAM, SourceKind::Declarative),
    );
    let doc = SnapshotDocument::new().record("prefix", prefix("10.0.0.0/24", "access"));
    sync(&engine, &doc, RunParams::default()).await;
    sync(&engine, &SnapshotDocument::new(), RunParams::default()).await;

    let result = sync(&engine, &doc, RunParams::default()).await;
    assert!(result.changeset.is_empty());
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].kind, WarningKind::RecoveryDisabled);
    assert_eq!(
        row(&*store, "prefix", "10.0.0.0/24").status.as_deref(),
        Some("deprecated")
    );
}

#[tokio::test]
async fn hard_delete_removes_rows() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let doc = SnapshotDocument::new()
        .record("prefix", prefix("10.0.0.0/24", "access"))
        .record("prefix", prefix("10.0.1.0/24", "access"));
    sync(&engine, &doc, RunParams::default()).await;

    let mut remaining = doc.clone();
    remaining.remove("prefix", |r| {
        r.identifiers.get("network") == Some(&Value::from("10.0.1.0/24"))
    });
    let params = RunParams {
        delete_policy: DeletePolicy::Hard,
        ..RunParams::default()
    };
    let result = sync(&engine, &remaining, params).await;
    assert_eq!(result.changeset.entries()[0].outcome(), Some(&Outcome::Deleted));
    assert_eq!(store.count("prefix").unwrap(), 1);
}

#[tokio::test]
async fn hard_delete_of_referenced_row_fails_that_entry() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    sync(&engine, &make_network_doc(), RunParams::default()).await;

    // Sites are processed before devices, so the site is still referenced
    // when its delete runs.
    let params = RunParams {
        delete_policy: DeletePolicy::Hard,
        ..RunParams::default()
    };
    let result = sync(&engine, &SnapshotDocument::new(), params.clone()).await;
    assert_eq!(result.status, RunStatus::CompletedWithErrors);
    assert_eq!(result.counts_for("site").failed, 1);
    assert_eq!(result.counts_for("device").deleted, 2);
    assert!(matches!(
        result.failures[0].error,
        EntryError::ConstraintViolation(_)
    ));

    let retry = sync(&engine, &SnapshotDocument::new(), params).await;
    assert_eq!(retry.status, RunStatus::Completed);
    assert_eq!(store.count("site").unwrap(), 0);
}

#[tokio::test]
async fn handler_can_veto_delete() {
    struct Keep;
    impl ModelHandler for Keep {
        fn allow_delete(&self, _entity: &reconcile_model::Entity) -> bool {
            false
        }
    }
    let registry = ModelRegistry::builder()
        .register_with_handler(
            EntitySchema::new("prefix")
                .identifier(FieldDef::scalar("network"))
                .attribute(FieldDef::scalar("role")),
            Arc::new(Keep),
        )
        .build()
        .unwrap();
    let store = memory_store();
    let engine = SyncEngine::new(
        Arc::new(registry),
        store.clone(),
        ActiveSource::new(IPAM, SourceKind::Declarative),
    );
    let doc = SnapshotDocument::new().record("prefix", prefix("10.0.0.0/24", "access"));
    sync(&engine, &doc, RunParams::default()).await;

    let result = sync(&engine, &SnapshotDocument::new(), RunParams::default()).await;
    assert_eq!(result.counts_for("prefix").skipped_conflict, 1);
    assert!(result.conflicts[0].reason.contains("vetoed"));
    assert_eq!(row(&*store, "prefix", "10.0.0.0/24").status, None);
}

// ── Partial updates ──────────────────────────────────────────────

#[tokio::test]
async fn update_leaves_other_fields_untouched() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let mut doc = SnapshotDocument::new().record(
        "prefix",
        prefix("10.0.0.0/24", "access").attribute("description", "office"),
    );
    sync(&engine, &doc, RunParams::default()).await;

    // Written out of band by someone else, outside this sync's schema.
    let id = row(&*store, "prefix", "10.0.0.0/24").id;
    let comments = FieldMap::from([("comments".to_string(), StoredValue::Plain("keep me".into()))]);
    store.update(id, &reconcile_store::RowPatch::fields(comments)).unwrap();
    let before = row(&*store, "prefix", "10.0.0.0/24");

    set_role(&mut doc, "prefix", "core");
    let result = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(result.changeset.entries()[0].fields(), BTreeSet::from(["role"]));

    let after = row(&*store, "prefix", "10.0.0.0/24");
    assert_eq!(after.fields.get("comments"), before.fields.get("comments"));
    assert_eq!(after.fields.get("description"), before.fields.get("description"));
    assert_eq!(plain(&after, "role"), Value::from("core"));
}

// ── Relationships ────────────────────────────────────────────────

#[tokio::test]
async fn unresolved_reference_fails_only_that_entry() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let doc = make_network_doc().record("device", device("lost1", "nowhere", "access"));

    let result = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(result.status, RunStatus::CompletedWithErrors);
    assert_eq!(result.failures.len(), 1);
    let failure = &result.failures[0];
    assert_eq!(failure.key, key("lost1"));
    assert_eq!(failure.operation, Operation::Create);
    assert!(matches!(failure.error, EntryError::UnresolvedReference { .. }));
    assert_eq!(result.counts_for("device").created, 2);
    assert_eq!(result.counts_for("device").failed, 1);
    assert_eq!(result.logs.len(), 1);
    assert_eq!(result.logs[0].key, "lost1");
}

#[tokio::test]
async fn many_to_many_is_all_or_nothing() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let doc = make_network_doc()
        .record("vlan", vlan("hq", 10, "users"))
        .record("interface", interface("router1", "eth0", &["hq__10", "hq__99"]))
        .record("interface", interface("router1", "eth1", &["hq__10"]));

    let result = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(result.counts_for("interface").created, 1);
    assert_eq!(result.counts_for("interface").failed, 1);
    assert!(store.find_by_key("interface", &key("router1__eth0")).unwrap().is_none());

    let eth1 = row(&*store, "interface", "router1__eth1");
    let vlan = row(&*store, "vlan", "hq__10");
    assert_eq!(eth1.fields["vlans"].links().len(), 1);
    assert_eq!(eth1.fields["vlans"].links()[0].id, vlan.id);
}

#[tokio::test]
async fn polymorphic_reference_uses_discriminator() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let assigned = |address: &str, object_type: Option<&str>| {
        SnapshotRecord::default()
            .identifier("address", address)
            .attribute("assigned_object", "router1__eth0")
            .attribute("assigned_object_type", object_type)
    };
    let doc = make_network_doc()
        .record("interface", interface("router1", "eth0", &[]))
        .record("ip_address", assigned("10.0.0.1/24", Some("interface")))
        .record("ip_address", assigned("10.0.0.2/24", None));

    let result = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(result.counts_for("ip_address").created, 1);
    let ambiguous = &result.failures[0];
    assert_eq!(ambiguous.key, key("10.0.0.2/24"));
    assert!(matches!(ambiguous.error, EntryError::AmbiguousReference { .. }));

    let ip = row(&*store, "ip_address", "10.0.0.1/24");
    let eth0 = row(&*store, "interface", "router1__eth0");
    let link = &ip.fields["assigned_object"].links()[0];
    assert_eq!((link.model_type.as_str(), link.id), ("interface", eth0.id));

    let again = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(again.changeset.summary().update, 0);
}

#[tokio::test]
async fn self_referencing_type_creates_parents_first() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let location = |name: &str, parent: Option<&str>| {
        SnapshotRecord::default()
            .identifier("name", name)
            .attribute("parent", parent)
    };
    let doc = SnapshotDocument::new()
        .record("location", location("a-room", Some("b-floor")))
        .record("location", location("b-floor", Some("c-building")))
        .record("location", location("c-building", None));

    let result = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(result.status, RunStatus::Completed, "{result}");
    let order: Vec<String> = result
        .changeset
        .for_model("location")
        .map(|e| e.key.to_string())
        .collect();
    assert_eq!(order, ["c-building", "b-floor", "a-room"]);

    let building = row(&*store, "location", "c-building");
    let floor = row(&*store, "location", "b-floor");
    assert_eq!(floor.fields["parent"].links()[0].id, building.id);
    assert!(sync(&engine, &doc, RunParams::default()).await.changeset.is_empty());
}

// ── Source data problems ─────────────────────────────────────────

#[tokio::test]
async fn duplicate_source_records_are_excluded() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let doc = SnapshotDocument::new().record("prefix", prefix("10.0.0.0/24", "access"));
    sync(&engine, &doc, RunParams::default()).await;

    let doubled = doc
        .clone()
        .record("prefix", prefix("10.0.0.0/24", "core"))
        .record("prefix", prefix("10.0.9.0/24", "core"));
    let result = sync(&engine, &doubled, RunParams::default()).await;
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].kind, WarningKind::DuplicateSourceRecord);
    assert_eq!(result.warnings[0].key, key("10.0.0.0/24"));
    // Neither updated nor deleted; the other prefix goes ahead.
    assert_eq!(result.changeset.len(), 1);
    assert_eq!(result.counts_for("prefix").created, 1);
    assert_eq!(plain(&row(&*store, "prefix", "10.0.0.0/24"), "role"), Value::from("access"));
}

#[tokio::test]
async fn source_load_failure_aborts_before_any_write() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let mut source = SnapshotAdapter::from_path(IPAM, "/nonexistent/snapshot.json");
    let err = engine.run(&mut source, RunParams::default()).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Load {
            side: Side::Source,
            error: LoadError::Unavailable { .. }
        }
    ));
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn missing_identifier_fails_the_load() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let doc = make_network_doc().record(
        "prefix",
        SnapshotRecord::default().attribute("role", "access"),
    );
    let err = engine.run(&mut snapshot(doc), RunParams::default()).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Load {
            error: LoadError::Model(_),
            ..
        }
    ));
    assert!(store.is_empty().unwrap());
}

// ── Run parameters ───────────────────────────────────────────────

#[tokio::test]
async fn dry_run_writes_nothing() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let params = RunParams {
        dry_run: true,
        debug: true,
        ..RunParams::default()
    };
    let result = sync(&engine, &make_network_doc(), params).await;
    assert_eq!(result.status, RunStatus::DryRun);
    assert_eq!(result.changeset.summary().create, 3);
    assert!(result.changeset.iter().all(|e| e.outcome().is_none()));
    assert_eq!(result.logs.len(), 3);
    assert!(result.logs.iter().all(|l| l.status == "planned"));
    assert!(result.phase(Phase::Apply).is_none());
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn debug_logs_every_entry() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let quiet = sync(&engine, &make_network_doc(), RunParams::default()).await;
    assert!(quiet.logs.is_empty());

    let mut doc = make_network_doc();
    set_role(&mut doc, "device", "edge");
    let params = RunParams {
        debug: true,
        ..RunParams::default()
    };
    let verbose = sync(&engine, &doc, params).await;
    assert_eq!(verbose.logs.len(), 2);
    assert!(verbose.logs.iter().all(|l| l.action == "update" && l.status == "updated"));
    assert!(verbose.logs[0].diff.contains("role"));
}

#[tokio::test]
async fn skip_flags_suppress_creates_and_deletes() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    sync(&engine, &make_network_doc(), RunParams::default()).await;

    let doc = SnapshotDocument::new()
        .record("site", site("hq"))
        .record("device", device("router1", "hq", "core"))
        .record("device", device("router2", "hq", "core"));
    let params = RunParams {
        skip_unmatched_source: true,
        skip_unmatched_target: true,
        ..RunParams::default()
    };
    let result = sync(&engine, &doc, params).await;
    assert!(result.changeset.is_empty());
    assert_eq!(store.count("device").unwrap(), 2);
}

#[tokio::test]
async fn scope_filter_limits_both_sides() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let doc = SnapshotDocument::new()
        .record("site", site("hq"))
        .record("site", site("branch"))
        .record("vlan", vlan("hq", 10, "users"))
        .record("vlan", vlan("branch", 20, "users"));
    sync(&engine, &doc, RunParams::default()).await;

    let mut without_vlans = doc.clone();
    without_vlans.remove("vlan", |_| true);
    let params = RunParams {
        scope_filter: Some(ScopeFilter::under("hq", &["vlan"])),
        ..RunParams::default()
    };
    let result = sync(&engine, &without_vlans, params).await;
    assert_eq!(
        result.changeset.keys("vlan", Operation::Delete),
        BTreeSet::from([key("hq__10")])
    );
    assert_eq!(row(&*store, "vlan", "branch__20").status, None);
}

// ── Cancellation & transactions ──────────────────────────────────

/// Cancels the run when it validates the given network.
struct CancelAt {
    token: CancelToken,
    network: &'static str,
}

impl ModelHandler for CancelAt {
    fn validate(&self, entity: &reconcile_model::Entity) -> Result<(), String> {
        if entity.key.to_string() == self.network {
            self.token.cancel();
        }
        Ok(())
    }
}

fn prefix_registry(handler: Arc<dyn ModelHandler>) -> Arc<ModelRegistry> {
    Arc::new(
        ModelRegistry::builder()
            .register_with_handler(
                EntitySchema::new("prefix")
                    .identifier(FieldDef::scalar("network"))
                    .attribute(FieldDef::scalar("role")),
                handler,
            )
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn cancellation_rolls_back_the_open_batch() {
    let token = CancelToken::new();
    let registry = prefix_registry(Arc::new(CancelAt {
        token: token.clone(),
        network: "10.0.1.0/24",
    }));
    let store = memory_store();
    let engine = SyncEngine::new(
        registry,
        store.clone(),
        ActiveSource::new(IPAM, SourceKind::Declarative),
    );
    let doc = SnapshotDocument::new()
        .record("prefix", prefix("10.0.0.0/24", "a"))
        .record("prefix", prefix("10.0.1.0/24", "b"))
        .record("prefix", prefix("10.0.2.0/24", "c"));

    let mut source = snapshot(doc);
    let result = engine
        .run_with_cancel(&mut source, RunParams::default(), token)
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.abort_reason.as_deref(), Some("cancelled"));
    let outcomes: Vec<Option<&Outcome>> = result.changeset.iter().map(|e| e.outcome()).collect();
    assert_eq!(
        outcomes,
        [Some(&Outcome::RolledBack), Some(&Outcome::RolledBack), None]
    );
    assert_eq!(result.totals().created, 0);
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn cancelled_before_load_is_fatal() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let token = CancelToken::new();
    token.cancel();
    let mut source = snapshot(make_network_doc());
    let err = engine
        .run_with_cancel(&mut source, RunParams::default(), token)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Load {
            error: LoadError::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn expired_deadline_stops_before_first_write() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let params = RunParams {
        deadline: Some(Duration::ZERO),
        ..RunParams::default()
    };
    let result = sync(&engine, &make_network_doc(), params).await;
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.abort_reason.as_deref(), Some("deadline exceeded"));
    assert!(store.is_empty().unwrap());
}

fn strict_engine(store: Arc<dyn Datastore>, scope: TransactionScope) -> SyncEngine {
    let config = SyncConfig {
        fail_on_create_error: true,
        transaction_scope: scope,
        ..SyncConfig::default()
    };
    SyncEngine::with_config(
        Arc::new(make_registry()),
        store,
        ActiveSource::new(IPAM, SourceKind::Declarative),
        config,
    )
}

fn doc_with_bad_device() -> SnapshotDocument {
    SnapshotDocument::new()
        .record("site", site("hq"))
        .record("device", device("a-router", "hq", "core"))
        .record("device", device("z-broken", "nowhere", "core"))
}

#[tokio::test]
async fn create_error_aborts_the_model_batch() {
    let store = memory_store();
    let engine = strict_engine(store.clone(), TransactionScope::PerModelType);
    let result = sync(&engine, &doc_with_bad_device(), RunParams::default()).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(store.count("site").unwrap(), 1);
    assert_eq!(store.count("device").unwrap(), 0);
    let router = result
        .changeset
        .iter()
        .find(|e| e.key == key("a-router"))
        .unwrap();
    assert_eq!(router.outcome(), Some(&Outcome::RolledBack));
    assert_eq!(result.failures.len(), 1);
}

#[tokio::test]
async fn create_error_with_run_transaction_undoes_everything() {
    let store = memory_store();
    let engine = strict_engine(store.clone(), TransactionScope::PerRun);
    let result = sync(&engine, &doc_with_bad_device(), RunParams::default()).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(store.is_empty().unwrap());
    assert_eq!(result.totals().created, 0);
}

// ── Statistics ───────────────────────────────────────────────────

#[tokio::test]
async fn result_reports_phases_and_cache_use() {
    let store = memory_store();
    let engine = make_ipam_engine(store.clone());
    let result = sync(&engine, &make_network_doc(), RunParams::default()).await;

    let phases: Vec<Phase> = result.phases.iter().map(|p| p.phase).collect();
    assert_eq!(
        phases,
        [Phase::LoadSource, Phase::LoadTarget, Phase::Diff, Phase::Apply]
    );
    assert_eq!(result.phase(Phase::LoadSource).unwrap().entities, 3);
    assert_eq!(result.phase(Phase::LoadTarget).unwrap().entities, 0);
    assert_eq!(result.phase(Phase::Apply).unwrap().entities, 3);
    assert_eq!(
        result.phase(Phase::Diff).unwrap().estimated_bytes,
        result.changeset.estimated_size()
    );

    // The site is created in this run; both devices find it in the cache.
    assert_eq!(result.cache.registered, 3);
    assert_eq!(result.cache.cache_hits, 2);
    assert_eq!(result.cache.store_queries, 0);
    assert!(result.finished_at >= result.started_at);

    let second = sync(&engine, &make_network_doc(), RunParams::default()).await;
    assert_eq!(second.phase(Phase::LoadTarget).unwrap().entities, 3);
    assert_eq!(second.cache, Default::default());
}

// ── SQLite backend ───────────────────────────────────────────────

#[tokio::test]
async fn lifecycle_against_sqlite() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let engine = make_ipam_engine(store.clone());
    let mut doc = make_network_doc()
        .record("vlan", vlan("hq", 10, "users"))
        .record("interface", interface("router1", "eth0", &["hq__10"]));

    let first = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(first.status, RunStatus::Completed, "{first}");
    assert!(sync(&engine, &doc, RunParams::default()).await.changeset.is_empty());

    set_role(&mut doc, "device", "edge");
    let updated = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(updated.counts_for("device").updated, 2);

    doc.remove("interface", |_| true);
    let deleted = sync(&engine, &doc, RunParams::default()).await;
    assert_eq!(deleted.counts_for("interface").deleted, 1);
    let eth0 = row(&*store, "interface", "router1__eth0");
    assert_eq!(eth0.status.as_deref(), Some("deprecated"));
}

#[tokio::test]
async fn sqlite_state_survives_a_new_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target.db");
    let path = path.to_str().unwrap();
    let doc = make_network_doc();

    {
        let store = Arc::new(SqliteStore::new(path).unwrap());
        let result = sync(&make_ipam_engine(store), &doc, RunParams::default()).await;
        assert_eq!(result.totals().created, 3);
    }

    let store = Arc::new(SqliteStore::new(path).unwrap());
    let result = sync(&make_ipam_engine(store), &doc, RunParams::default()).await;
    assert!(result.changeset.is_empty());
}
