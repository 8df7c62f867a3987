//! End-to-end workflow tests against the in-memory topology and the fake
//! tablet manager

use keyshift_topo::{
    ColumnVindex, KeyspaceVSchema, MemoryTopology, Table, Tablet, TabletAlias, TopologyStore,
    Vindex,
};
use keyshift_workflow::testing::{
    legacy_primary, sales_primary, sharded_sales_topology, FakeTabletManager, CUSTOMER_DDL,
};
use keyshift_workflow::{
    migration_id, CreateDdl, CreateLookupVindexRequest, ErrorKind, Field, MigrationIntent,
    MoveTablesRequest, StreamState, TableDefinition, TableSelection, TableSettings,
    WorkflowEngine, WorkflowError, WorkflowSpec,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("keyshift_workflow=debug")
        .with_test_writer()
        .try_init();
}

fn engine(topo: &Arc<MemoryTopology>, tmc: &Arc<FakeTabletManager>) -> WorkflowEngine {
    WorkflowEngine::new(topo.clone(), tmc.clone())
}

fn move_customer() -> MoveTablesRequest {
    MoveTablesRequest::new(
        "movecust",
        "legacy",
        "sales",
        TableSelection::Named(vec!["customer".into()]),
    )
}

/// `orders` split in four, so each `sales` shard overlaps exactly two of them
fn add_orders_keyspace(topo: &MemoryTopology) {
    topo.add_keyspace(
        "orders",
        KeyspaceVSchema::sharded()
            .with_vindex("hash", Vindex::new("hash"))
            .with_table(
                "customer",
                Table::default().with_column_vindex(ColumnVindex::single("id", "hash")),
            ),
    );
    for (uid, shard) in [(300, "-40"), (301, "40-80"), (302, "80-c0"), (303, "c0-")] {
        topo.add_shard_with_primary(
            "orders",
            shard,
            Tablet::new(TabletAlias::new("zone1", uid), "orders", shard),
        )
        .unwrap();
    }
}

fn orders_primaries() -> Vec<TabletAlias> {
    (300..304).map(|uid| TabletAlias::new("zone1", uid)).collect()
}

// ==================== MoveTables ====================

#[tokio::test]
async fn test_move_tables_from_unsharded_keyspace() {
    init_tracing();
    let topo = sharded_sales_topology();
    let tmc = Arc::new(FakeTabletManager::new());
    tmc.add_table(&legacy_primary(), "customer", CUSTOMER_DDL);

    let created = engine(&topo, &tmc).move_tables(&move_customer()).await.unwrap();
    assert_eq!(created.workflow, "movecust");
    assert_eq!(
        created.streams,
        vec![("-80".to_string(), 1), ("80-".to_string(), 1)]
    );
    assert!(created.started);

    for (index, range) in [(0, "'-80'"), (1, "'80-'")] {
        let alias = sales_primary(index);
        assert!(tmc.has_table(&alias, "customer"));

        let streams = tmc.streams(&alias);
        assert_eq!(streams.len(), 1);
        let stream = &streams[0];
        assert_eq!(stream.state, StreamState::Running);
        assert_eq!(stream.source.keyspace, "legacy");
        assert_eq!(stream.source.shard, "0");

        let rule = &stream.source.filter.rules[0];
        assert_eq!(rule.match_table, "customer");
        assert!(rule.filter.contains("in_keyrange("), "{}", rule.filter);
        assert!(rule.filter.contains("'sales.hash'"), "{}", rule.filter);
        assert!(rule.filter.contains(range), "{}", rule.filter);

        assert_eq!(
            tmc.stream_column(&alias, 1, "workflow_type"),
            Some(MigrationIntent::MoveTables.code().to_string())
        );
        assert_eq!(tmc.stream_column(&alias, 1, "db_name").as_deref(), Some("vt_sales"));
    }

    let rules = topo.get_routing_rules().await.unwrap();
    assert_eq!(rules.len(), 8);
    assert_eq!(
        rules.get("sales.customer@replica"),
        Some(&["legacy.customer".to_string()][..])
    );
    assert_eq!(topo.vschema_version("sales"), 1);
    assert!(topo.rebuild_count() >= 1);
}

#[tokio::test]
async fn test_move_tables_duplicate_workflow_leaves_topology_untouched() {
    let topo = sharded_sales_topology();
    let tmc = Arc::new(FakeTabletManager::new());
    tmc.add_table(&legacy_primary(), "customer", CUSTOMER_DDL);
    let engine = engine(&topo, &tmc);
    engine.move_tables(&move_customer()).await.unwrap();

    let rules_version = topo.routing_rules_version();
    let vschema_version = topo.vschema_version("sales");
    let inserts = tmc.executed_matching("insert into").len();

    let err = engine.move_tables(&move_customer()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.to_string().contains("workflow movecust already exists"), "{}", err);
    assert_eq!(topo.routing_rules_version(), rules_version);
    assert_eq!(topo.vschema_version("sales"), vschema_version);
    assert_eq!(topo.get_routing_rules().await.unwrap().len(), 8);
    assert_eq!(tmc.executed_matching("insert into").len(), inserts);
    assert_eq!(tmc.streams(&sales_primary(0)).len(), 1);
}

#[tokio::test]
async fn test_move_tables_skips_disjoint_shard_pairs() {
    let topo = sharded_sales_topology();
    add_orders_keyspace(&topo);
    let tmc = Arc::new(FakeTabletManager::new());
    tmc.add_table(&sales_primary(0), "customer", CUSTOMER_DDL);

    let request = MoveTablesRequest::new(
        "reorders",
        "sales",
        "orders",
        TableSelection::Named(vec!["customer".into()]),
    );
    let created = engine(&topo, &tmc).move_tables(&request).await.unwrap();
    assert_eq!(created.total_streams(), 4);

    let expected_sources = ["-80", "-80", "80-", "80-"];
    for (alias, source) in orders_primaries().iter().zip(expected_sources) {
        let streams = tmc.streams(alias);
        assert_eq!(streams.len(), 1, "tablet {}", alias);
        assert_eq!(streams[0].source.shard, source);
    }
}

#[tokio::test]
async fn test_move_tables_refuses_completed_migration() {
    let topo = sharded_sales_topology();
    let tmc = Arc::new(FakeTabletManager::new());
    tmc.add_table(&legacy_primary(), "customer", CUSTOMER_DDL);
    tmc.add_journal_entry(&legacy_primary(), migration_id("sales", &["-80:1", "80-:1"]));

    let err = engine(&topo, &tmc)
        .move_tables(&move_customer())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Idempotency);
    match &err {
        WorkflowError::Idempotency {
            tablets, keyspace, ..
        } => {
            assert_eq!(tablets, &vec![legacy_primary().to_string()]);
            assert_eq!(keyspace, "sales");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(tmc.executed_matching("insert into").is_empty());
    assert!(tmc.streams(&sales_primary(0)).is_empty());
}

#[tokio::test]
async fn test_move_tables_partial_subset() {
    let topo = sharded_sales_topology();
    let tmc = Arc::new(FakeTabletManager::new());
    tmc.add_table(&sales_primary(0), "customer", CUSTOMER_DDL);
    topo.add_keyspace(
        "archive",
        KeyspaceVSchema::sharded()
            .with_vindex("hash", Vindex::new("hash"))
            .with_table(
                "customer",
                Table::default().with_column_vindex(ColumnVindex::single("id", "hash")),
            ),
    );
    for (uid, shard) in [(500, "-80"), (501, "80-")] {
        topo.add_shard_with_primary(
            "archive",
            shard,
            Tablet::new(TabletAlias::new("zone1", uid), "archive", shard),
        )
        .unwrap();
    }

    let mut request = MoveTablesRequest::new(
        "archivecust",
        "sales",
        "archive",
        TableSelection::Named(vec!["customer".into()]),
    );
    request.source_shards = vec!["-80".into()];
    let created = engine(&topo, &tmc).move_tables(&request).await.unwrap();

    assert_eq!(created.streams, vec![("-80".to_string(), 1)]);
    let low = TabletAlias::new("zone1", 500);
    assert_eq!(tmc.stream_column(&low, 1, "workflow_sub_type").as_deref(), Some("1"));
    assert!(tmc.streams(&TabletAlias::new("zone1", 501)).is_empty());
    assert!(!tmc.has_table(&TabletAlias::new("zone1", 501), "customer"));
}

#[tokio::test]
async fn test_shard_failures_are_aggregated() {
    let topo = sharded_sales_topology();
    let tmc = Arc::new(FakeTabletManager::new());
    tmc.add_table(&legacy_primary(), "customer", CUSTOMER_DDL);
    tmc.fail_on(&sales_primary(0), "apply_schema");
    tmc.fail_on(&sales_primary(1), "apply_schema");

    let err = engine(&topo, &tmc)
        .move_tables(&move_customer())
        .await
        .unwrap_err();
    let WorkflowError::Aggregate(aggregate) = &err else {
        panic!("expected aggregate error, got {err:?}");
    };
    assert_eq!(aggregate.len(), 2);
    assert_eq!(err.kind(), ErrorKind::Remote);
    assert!(err.to_string().contains("sales/-80"));
    assert!(err.to_string().contains("sales/80-"));
    assert!(tmc.executed_matching("insert into").is_empty());
}

// ==================== Materialize ====================

#[tokio::test]
async fn test_materialize_without_auto_start() {
    let topo = sharded_sales_topology();
    add_orders_keyspace(&topo);
    let tmc = Arc::new(FakeTabletManager::new());
    tmc.add_table(&sales_primary(0), "customer", CUSTOMER_DDL);
    let engine = engine(&topo, &tmc);

    let spec = WorkflowSpec::builder("custcopy", "sales", "orders")
        .intent(MigrationIntent::MoveTables)
        .auto_start(false)
        .table(
            TableSettings::new("customer")
                .with_source_expression("select id, email from customer")
                .with_create_ddl(CreateDdl::Copy),
        )
        .build()
        .unwrap();
    let created = engine.materialize(&spec).await.unwrap();
    assert!(!created.started);
    assert_eq!(created.total_streams(), 8);

    for alias in orders_primaries() {
        assert!(tmc.has_table(&alias, "customer"));
        let streams = tmc.streams(&alias);
        assert_eq!(streams.len(), 2);
        assert!(streams.iter().all(|s| s.state == StreamState::Stopped));
        assert_eq!(
            tmc.stream_column(&alias, 1, "workflow_type"),
            Some(MigrationIntent::Materialize.code().to_string())
        );
    }

    engine.start_workflow("orders", "custcopy").await.unwrap();
    let streams = engine.workflow_streams("orders", "custcopy").await.unwrap();
    assert_eq!(streams.len(), 8);
    assert!(streams.iter().all(|s| s.state == StreamState::Running));
    assert_eq!(streams[0].shard, "-40");
}

#[tokio::test]
async fn test_materialize_keeps_placeholder_text_in_expression() {
    let topo = sharded_sales_topology();
    add_orders_keyspace(&topo);
    let tmc = Arc::new(FakeTabletManager::new());
    tmc.add_table(&sales_primary(0), "customer", CUSTOMER_DDL);

    let spec = WorkflowSpec::builder("tagcopy", "sales", "orders")
        .table(
            TableSettings::new("customer")
                .with_source_expression(
                    "select id, email, '{{keyrange}}/{{dbname}}' as tag from customer",
                )
                .with_create_ddl(CreateDdl::Copy),
        )
        .build()
        .unwrap();
    engine(&topo, &tmc).materialize(&spec).await.unwrap();

    for (alias, range) in orders_primaries().iter().zip(["'-40'", "'40-80'", "'80-c0'", "'c0-'"]) {
        for stream in tmc.streams(alias) {
            let filter = stream.source.filter.rules[0].filter.to_lowercase();
            assert!(filter.contains("'{{keyrange}}/{{dbname}}' as tag"), "{}", filter);
            assert!(filter.contains(range), "{}", filter);
            assert!(!filter.contains("keyrange_"), "{}", filter);
        }
        assert_eq!(tmc.stream_column(alias, 1, "db_name").as_deref(), Some("vt_orders"));
    }
}

// ==================== Lookup vindexes ====================

const USERS_DDL: &str = "CREATE TABLE `users` (\n  `id` bigint NOT NULL AUTO_INCREMENT,\n  `email` varchar(128) DEFAULT NULL,\n  PRIMARY KEY (`id`)\n) ENGINE=InnoDB";

fn lookup_primary() -> TabletAlias {
    TabletAlias::new("zone1", 400)
}

async fn lookup_fixture() -> (Arc<MemoryTopology>, Arc<FakeTabletManager>) {
    let topo = sharded_sales_topology();
    let mut sales = topo.get_vschema("sales").await.unwrap();
    sales.tables.insert(
        "users".into(),
        Table::default().with_column_vindex(ColumnVindex::single("id", "hash")),
    );
    topo.add_keyspace("sales", sales);
    for (index, shard) in [(0, "-80"), (1, "80-")] {
        topo.add_shard_with_primary(
            "sales",
            shard,
            Tablet::new(sales_primary(index), "sales", shard),
        )
        .unwrap();
    }
    topo.add_keyspace("lookupks", KeyspaceVSchema::unsharded());
    topo.add_shard_with_primary(
        "lookupks",
        "0",
        Tablet::new(lookup_primary(), "lookupks", "0"),
    )
    .unwrap();

    let tmc = Arc::new(FakeTabletManager::new());
    for index in 0..2 {
        tmc.add_table_definition(
            &sales_primary(index),
            TableDefinition {
                name: "users".into(),
                schema: USERS_DDL.into(),
                columns: vec!["id".into(), "email".into()],
                fields: vec![Field::new("id", "bigint"), Field::new("email", "varchar(128)")],
            },
        );
    }
    (topo, tmc)
}

fn email_lookup(owned: bool) -> CreateLookupVindexRequest {
    let mut vindex = Vindex::new("lookup_unique")
        .with_param("table", "lookupks.email_lookup")
        .with_param("from", "email")
        .with_param("to", "keyspace_id");
    if owned {
        vindex = vindex.with_owner("users");
    }
    CreateLookupVindexRequest {
        keyspace: "sales".into(),
        spec: KeyspaceVSchema::sharded()
            .with_vindex("email_idx", vindex)
            .with_table(
                "users",
                Table::default().with_column_vindex(ColumnVindex::single("email", "email_idx")),
            ),
        cell: String::new(),
        tablet_types: String::new(),
        continue_after_copy_with_owner: false,
    }
}

#[tokio::test]
async fn test_create_owned_lookup_vindex() {
    init_tracing();
    let (topo, tmc) = lookup_fixture().await;
    let created = engine(&topo, &tmc)
        .create_lookup_vindex(&email_lookup(true))
        .await
        .unwrap();
    assert_eq!(created.workflow, "email_lookup_vdx");
    assert_eq!(created.target_keyspace, "lookupks");
    assert_eq!(created.streams, vec![("0".to_string(), 2)]);

    let changes = tmc.schema_changes(&lookup_primary());
    assert_eq!(changes.len(), 1);
    assert_eq!(
        changes[0].sql,
        "CREATE TABLE `email_lookup` (\n  `email` varchar(128),\n  `keyspace_id` varbinary(128),\n  PRIMARY KEY (`email`)\n)"
    );

    let streams = tmc.streams(&lookup_primary());
    assert_eq!(streams.len(), 2);
    for stream in &streams {
        assert!(stream.source.stop_after_copy);
        assert_eq!(stream.source.keyspace, "sales");
        assert_eq!(
            stream.source.filter.rules[0].filter,
            "select email as email, keyspace_id() as keyspace_id from users group by email, keyspace_id"
        );
    }
    assert_eq!(
        tmc.stream_column(&lookup_primary(), 1, "workflow_type"),
        Some(MigrationIntent::CreateLookupIndex.code().to_string())
    );

    let sales = topo.get_vschema("sales").await.unwrap();
    assert_eq!(
        sales.vindexes["email_idx"].params.get("write_only").map(String::as_str),
        Some("true")
    );
    assert_eq!(sales.tables["users"].column_vindexes.len(), 2);
    let lookupks = topo.get_vschema("lookupks").await.unwrap();
    assert!(lookupks.tables.contains_key("email_lookup"));
}

/// Replace the unsharded `lookupks` with a two-shard keyspace
fn shard_lookup_keyspace(topo: &MemoryTopology, vschema: KeyspaceVSchema) -> Vec<TabletAlias> {
    topo.add_keyspace("lookupks", vschema);
    [(400, "-80"), (401, "80-")]
        .into_iter()
        .map(|(uid, shard)| {
            let alias = TabletAlias::new("zone1", uid);
            topo.add_shard_with_primary(
                "lookupks",
                shard,
                Tablet::new(alias.clone(), "lookupks", shard),
            )
            .unwrap();
            alias
        })
        .collect()
}

#[tokio::test]
async fn test_create_lookup_vindex_in_sharded_keyspace() {
    let (topo, tmc) = lookup_fixture().await;
    let primaries = shard_lookup_keyspace(&topo, KeyspaceVSchema::sharded());

    let created = engine(&topo, &tmc)
        .create_lookup_vindex(&email_lookup(true))
        .await
        .unwrap();
    assert_eq!(
        created.streams,
        vec![("-80".to_string(), 2), ("80-".to_string(), 2)]
    );

    let lookupks = topo.get_vschema("lookupks").await.unwrap();
    assert_eq!(lookupks.vindexes["unicode_loose_md5"].vindex_type, "unicode_loose_md5");
    assert_eq!(
        lookupks.tables["email_lookup"].column_vindexes,
        vec![ColumnVindex::single("email", "unicode_loose_md5")]
    );

    for (alias, range) in primaries.iter().zip(["'-80'", "'80-'"]) {
        assert_eq!(tmc.schema_changes(alias).len(), 1);
        let streams = tmc.streams(alias);
        assert_eq!(streams.len(), 2);
        for stream in &streams {
            let filter = &stream.source.filter.rules[0].filter;
            assert!(filter.contains("in_keyrange("), "{}", filter);
            assert!(filter.contains("'lookupks.unicode_loose_md5'"), "{}", filter);
            assert!(filter.contains(range), "{}", filter);
        }
    }
    assert_eq!(topo.vschema_version("lookupks"), 1);
    assert_eq!(topo.vschema_version("sales"), 1);
}

#[tokio::test]
async fn test_create_lookup_vindex_conflicting_backing_vindex() {
    let (topo, tmc) = lookup_fixture().await;
    let primaries = shard_lookup_keyspace(
        &topo,
        KeyspaceVSchema::sharded().with_vindex("unicode_loose_md5", Vindex::new("hash")),
    );

    let err = engine(&topo, &tmc)
        .create_lookup_vindex(&email_lookup(true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(topo.vschema_version("lookupks"), 0);
    assert_eq!(topo.vschema_version("sales"), 0);
    for alias in &primaries {
        assert!(tmc.schema_changes(alias).is_empty());
        assert!(tmc.streams(alias).is_empty());
    }
}

#[tokio::test]
async fn test_create_lookup_vindex_in_owner_keyspace() {
    let (topo, tmc) = lookup_fixture().await;
    let mut request = email_lookup(true);
    if let Some(vindex) = request.spec.vindexes.get_mut("email_idx") {
        vindex
            .params
            .insert("table".to_string(), "sales.email_lookup".to_string());
    }

    let created = engine(&topo, &tmc)
        .create_lookup_vindex(&request)
        .await
        .unwrap();
    assert_eq!(created.target_keyspace, "sales");
    assert_eq!(created.total_streams(), 4);
    for index in 0..2 {
        assert_eq!(tmc.streams(&sales_primary(index)).len(), 2);
    }

    // Both the backing table and the write-only vindex survive in one document
    let sales = topo.get_vschema("sales").await.unwrap();
    assert!(sales.tables.contains_key("email_lookup"));
    assert_eq!(
        sales.tables["email_lookup"].column_vindexes,
        vec![ColumnVindex::single("email", "unicode_loose_md5")]
    );
    assert_eq!(
        sales.vindexes["email_idx"].params.get("write_only").map(String::as_str),
        Some("true")
    );
    assert_eq!(sales.tables["users"].column_vindexes.len(), 2);
    assert_eq!(topo.vschema_version("sales"), 2);
    assert_eq!(topo.vschema_version("lookupks"), 0);
}

#[tokio::test]
async fn test_lookup_spec_with_two_vindexes_is_rejected() {
    let (topo, tmc) = lookup_fixture().await;
    let mut request = email_lookup(true);
    request.spec = request
        .spec
        .with_vindex("other_idx", Vindex::new("lookup_unique"));

    let err = engine(&topo, &tmc)
        .create_lookup_vindex(&request)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("only one vindex must be specified"));
    assert_eq!(topo.vschema_version("sales"), 0);
    assert_eq!(topo.vschema_version("lookupks"), 0);
    assert!(tmc.schema_changes(&lookup_primary()).is_empty());
    assert!(tmc.executed_on(&lookup_primary()).is_empty());
}

#[tokio::test]
async fn test_externalize_owned_vindex() {
    let (topo, tmc) = lookup_fixture().await;
    let engine = engine(&topo, &tmc);
    engine
        .create_lookup_vindex(&email_lookup(true))
        .await
        .unwrap();

    let err = engine.externalize_vindex("sales.email_idx").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateVerification);
    assert!(err.to_string().contains("is not in Stopped state"));
    let sales = topo.get_vschema("sales").await.unwrap();
    assert!(sales.vindexes["email_idx"].params.contains_key("write_only"));

    tmc.set_stream_state(
        &lookup_primary(),
        "email_lookup_vdx",
        StreamState::Stopped,
        "Stopped after copy.",
    );
    let externalized = engine.externalize_vindex("sales.email_idx").await.unwrap();
    assert!(externalized.streams_deleted);
    assert_eq!(externalized.workflow, "email_lookup_vdx");
    assert!(tmc.streams(&lookup_primary()).is_empty());

    let sales = topo.get_vschema("sales").await.unwrap();
    assert!(!sales.vindexes["email_idx"].params.contains_key("write_only"));
}

#[tokio::test]
async fn test_externalize_ownerless_vindex_keeps_streams() {
    let (topo, tmc) = lookup_fixture().await;
    let engine = engine(&topo, &tmc);
    engine
        .create_lookup_vindex(&email_lookup(false))
        .await
        .unwrap();
    let streams = tmc.streams(&lookup_primary());
    assert!(streams.iter().all(|s| !s.source.stop_after_copy));
    assert_eq!(
        streams[0].source.filter.rules[0].filter,
        "select email as email, keyspace_id() as keyspace_id from users"
    );

    let externalized = engine.externalize_vindex("sales.email_idx").await.unwrap();
    assert!(!externalized.streams_deleted);
    assert_eq!(tmc.streams(&lookup_primary()).len(), 2);
    assert!(tmc.executed_matching("delete from").is_empty());
}

#[tokio::test]
async fn test_externalize_unknown_vindex() {
    let (topo, tmc) = lookup_fixture().await;
    let err = engine(&topo, &tmc)
        .externalize_vindex("sales.nope")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
