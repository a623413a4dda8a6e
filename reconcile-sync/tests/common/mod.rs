#![allow(dead_code)]

use reconcile_model::{
    AttrMap, EntitySchema, FieldDef, ModelHandler, ModelRegistry, Normalization, SourceKind,
};
use reconcile_store::{Datastore, MemoryStore, Row};
use reconcile_sync::{
    ActiveSource, RunParams, RunResult, SnapshotAdapter, SnapshotDocument, SnapshotRecord,
    SyncEngine,
};
use reconcile_types::{NaturalKey, Value};
use std::sync::Arc;

pub const IPAM: &str = "ipam";
pub const SCANNER: &str = "scanner";

/// site ← device ← interface, vlan (per site), prefix, ip_address
/// (polymorphic over interface/vm_interface) and a self-referencing location.
pub fn make_registry() -> ModelRegistry {
    make_registry_with(|b| b)
}

pub fn make_registry_with(
    extra: impl FnOnce(reconcile_model::RegistryBuilder) -> reconcile_model::RegistryBuilder,
) -> ModelRegistry {
    let builder = ModelRegistry::builder()
        .register(
            EntitySchema::new("site")
                .identifier(FieldDef::scalar("name").normalized(Normalization::Lowercase))
                .attribute(FieldDef::scalar("description")),
        )
        .register(
            EntitySchema::new("device")
                .identifier(FieldDef::scalar("name"))
                .attribute(FieldDef::foreign_key("site", "site"))
                .attribute(
                    FieldDef::scalar("role")
                        .normalized(Normalization::Trim)
                        .normalized(Normalization::Lowercase),
                )
                .attribute(FieldDef::scalar("serial").discovery_precedence())
                .attribute(FieldDef::scalar_set("tags")),
        )
        .register(
            EntitySchema::new("vlan")
                .identifier(FieldDef::foreign_key("site", "site"))
                .identifier(FieldDef::scalar("vid"))
                .attribute(FieldDef::scalar("name")),
        )
        .register(
            EntitySchema::new("interface")
                .identifier(FieldDef::foreign_key("device", "device"))
                .identifier(FieldDef::scalar("name"))
                .attribute(FieldDef::scalar("enabled"))
                .attribute(FieldDef::many_to_many("vlans", "vlan")),
        )
        .register(
            EntitySchema::new("vm_interface")
                .identifier(FieldDef::scalar("vm"))
                .identifier(FieldDef::scalar("name")),
        )
        .register(
            EntitySchema::new("prefix")
                .identifier(FieldDef::scalar("network"))
                .attribute(FieldDef::scalar("role"))
                .attribute(FieldDef::scalar("description")),
        )
        .register(
            EntitySchema::new("ip_address")
                .identifier(FieldDef::scalar("address"))
                .attribute(FieldDef::scalar("assigned_object_type"))
                .attribute(FieldDef::polymorphic(
                    "assigned_object",
                    &["interface", "vm_interface"],
                    "assigned_object_type",
                )),
        )
        .register(
            EntitySchema::new("location")
                .identifier(FieldDef::scalar("name"))
                .attribute(FieldDef::foreign_key("parent", "location")),
        );
    extra(builder).build().unwrap()
}

pub fn make_engine(store: Arc<dyn Datastore>, source: &str, kind: SourceKind) -> SyncEngine {
    SyncEngine::new(Arc::new(make_registry()), store, ActiveSource::new(source, kind))
}

pub fn make_ipam_engine(store: Arc<dyn Datastore>) -> SyncEngine {
    make_engine(store, IPAM, SourceKind::Declarative)
}

pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

pub fn site(name: &str) -> SnapshotRecord {
    SnapshotRecord::default().identifier("name", name)
}

pub fn device(name: &str, site: &str, role: &str) -> SnapshotRecord {
    SnapshotRecord::default()
        .identifier("name", name)
        .attribute("site", site)
        .attribute("role", role)
}

pub fn prefix(network: &str, role: &str) -> SnapshotRecord {
    SnapshotRecord::default()
        .identifier("network", network)
        .attribute("role", role)
}

pub fn interface(device: &str, name: &str, vlans: &[&str]) -> SnapshotRecord {
    SnapshotRecord::default()
        .identifier("device", device)
        .identifier("name", name)
        .attribute("enabled", true)
        .attribute(
            "vlans",
            Value::List(vlans.iter().map(|v| Value::from(*v)).collect()),
        )
}

pub fn vlan(site: &str, vid: i64, name: &str) -> SnapshotRecord {
    SnapshotRecord::default()
        .identifier("site", site)
        .identifier("vid", vid)
        .attribute("name", name)
}

/// One site with two devices.
pub fn make_network_doc() -> SnapshotDocument {
    SnapshotDocument::new()
        .record("site", site("hq"))
        .record("device", device("router1", "hq", "core"))
        .record("device", device("switch1", "hq", "access"))
}

pub fn snapshot(doc: SnapshotDocument) -> SnapshotAdapter {
    SnapshotAdapter::new(IPAM, doc)
}

pub async fn sync(engine: &SyncEngine, doc: &SnapshotDocument, params: RunParams) -> RunResult {
    let mut source = snapshot(doc.clone());
    engine.run(&mut source, params).await.unwrap()
}

pub fn key(s: &str) -> NaturalKey {
    NaturalKey::parse(s).unwrap()
}

pub fn row(store: &dyn Datastore, model_type: &str, k: &str) -> Row {
    store
        .find_by_key(model_type, &key(k))
        .unwrap()
        .unwrap_or_else(|| panic!("no {model_type} row for {k}"))
}

pub fn plain(row: &Row, field: &str) -> Value {
    match row.fields.get(field) {
        Some(reconcile_store::StoredValue::Plain(v)) => v.clone(),
        other => panic!("{field} is not a plain value: {other:?}"),
    }
}

/// A handler that rejects every entity carrying `field == value`.
pub struct RejectWhen {
    pub field: &'static str,
    pub value: &'static str,
}

impl ModelHandler for RejectWhen {
    fn validate(&self, entity: &reconcile_model::Entity) -> Result<(), String> {
        if entity.get_str(self.field) == Some(self.value) {
            return Err(format!("{} may not be {}", self.field, self.value));
        }
        Ok(())
    }
}

pub fn attrs(pairs: &[(&str, Value)]) -> AttrMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}
