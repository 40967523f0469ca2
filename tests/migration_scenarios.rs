use mesh_schema_rust::config::MigrationConfig;
use mesh_schema_rust::store::traits::{BranchStore, ContainerStore};
use mesh_schema_rust::{
    Branch, ContainerEdge, ContainerType, FieldContainer, FieldSchema, FieldType, FieldValue, Id, JobFilter,
    JobKind, JobStatus, MemoryStore, Micronode, MicroschemaUsageHasher, SchemaDefinition, SchemaDiff, SchemaKind,
    SchemaManager, SchemaVersion,
};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

// One project with a "main" branch over an in-memory store
struct Harness {
    store: Arc<MemoryStore>,
    manager: SchemaManager<MemoryStore>,
    branch: Branch,
}

impl Harness {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let config = MigrationConfig {
            bucket_size: 2,
            ..MigrationConfig::default()
        };
        let manager = SchemaManager::new(store.clone(), &config);
        let (branch, _) = manager
            .create_branch(&"project-1".to_string(), "main", None)
            .await
            .unwrap();
        Self { store, manager, branch }
    }

    async fn add_draft(&self, node_id: &str, version: &SchemaVersion, fields: Vec<(&str, FieldValue)>) -> FieldContainer {
        let fields = fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        let container = FieldContainer::new(node_id, "en", version.id.clone(), fields);
        self.store.insert_container(container.clone()).await.unwrap();
        self.store
            .set_edge(ContainerEdge::new(self.branch.id.clone(), &container, ContainerType::Draft))
            .await
            .unwrap();
        container
    }

    async fn draft(&self, node_id: &str) -> FieldContainer {
        self.draft_on(&self.branch.id, node_id).await
    }

    async fn draft_on(&self, branch_id: &Id, node_id: &str) -> FieldContainer {
        let edges = self
            .store
            .list_edges(branch_id, ContainerType::Draft, None, 100)
            .await
            .unwrap();
        let edge = edges.into_iter().find(|edge| edge.node_id == node_id).unwrap();
        self.store.get_container(&edge.container_id).await.unwrap().unwrap()
    }
}

fn article_v1() -> SchemaDefinition {
    SchemaDefinition::new("article").with_field(FieldSchema::new("title", FieldType::String))
}

fn article_v2() -> SchemaDefinition {
    article_v1().with_field(FieldSchema::new("subtitle", FieldType::String).with_default(json!("")))
}

fn product(price: FieldType) -> SchemaDefinition {
    SchemaDefinition::new("product")
        .with_field(FieldSchema::new("name", FieldType::String))
        .with_field(FieldSchema::new("price", price))
}

#[tokio::test]
async fn test_version_chain_is_linear() {
    let h = Harness::new().await;
    h.manager.create_schema(article_v1()).await.unwrap();
    h.manager
        .update_schema(SchemaKind::Schema, article_v2(), &[], None)
        .await
        .unwrap();
    h.manager
        .update_schema(
            SchemaKind::Schema,
            article_v2().with_field(FieldSchema::new("body", FieldType::Html)),
            &[],
            Some(2),
        )
        .await
        .unwrap();

    let chain = h.manager.versions(SchemaKind::Schema, "article").await.unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain.iter().filter(|version| version.previous.is_none()).count(), 1);
    assert_eq!(chain.iter().filter(|version| version.next.is_none()).count(), 1);
    for pair in chain.windows(2) {
        assert_eq!(pair[1].version, pair[0].version + 1);
        assert_eq!(pair[0].next.as_ref(), Some(&pair[1].id));
        assert_eq!(pair[1].previous.as_ref(), Some(&pair[0].id));
    }

    // Identical definitions diff to nothing, and an identical update is rejected
    assert!(SchemaDiff::diff(&chain[2].definition, &chain[2].definition, &[]).unwrap().is_empty());
    let err = h
        .manager
        .update_schema(SchemaKind::Schema, chain[2].definition.clone(), &[], None)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    // The change set of each version turns the previous definition into its own
    for pair in chain.windows(2) {
        let applied = SchemaDiff::apply(&pair[0].definition, &pair[1].changes).unwrap();
        assert_eq!(applied.field_names(), pair[1].definition.field_names());
    }
}

#[tokio::test]
async fn test_article_v1_to_v2_end_to_end() {
    let h = Harness::new().await;
    let v1 = h.manager.create_schema(article_v1()).await.unwrap();
    assert!(h.manager.assign_version(&h.branch.id, &v1, false).await.unwrap().is_none());
    h.add_draft("node-1", &v1, vec![("title", FieldValue::String("Hello".into()))])
        .await;

    let v2 = h
        .manager
        .update_schema(SchemaKind::Schema, article_v2(), &[], Some(1))
        .await
        .unwrap();
    let job = h
        .manager
        .assign_version(&h.branch.id, &v2, false)
        .await
        .unwrap()
        .expect("a migration job");
    assert_eq!(
        job.kind,
        JobKind::Schema {
            branch_id: h.branch.id.clone(),
            from_version: v1.id.clone(),
            to_version: v2.id.clone(),
        }
    );
    assert_eq!(h.manager.remaining_count(&h.branch.id, SchemaKind::Schema, "article").await.unwrap(), 1);

    let mut events = h.manager.subscribe();
    let finished = h.manager.run_pending().await.unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, JobStatus::Completed);
    assert!(events.recv().await.unwrap().is_success());

    assert_eq!(h.store.count_containers_at_version(&v2.id).await.unwrap(), 1);
    assert_eq!(h.store.count_containers_at_version(&v1.id).await.unwrap(), 1);
    assert_eq!(h.manager.remaining_count(&h.branch.id, SchemaKind::Schema, "article").await.unwrap(), 0);

    let migrated = h.draft("node-1").await;
    assert_eq!(migrated.fields["title"], FieldValue::String("Hello".into()));
    assert_eq!(migrated.fields["subtitle"], FieldValue::String(String::new()));
    let previous = h
        .store
        .get_container(migrated.previous.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(previous.schema_version_id, v1.id);
    assert!(previous.next.contains(&migrated.id));

    // Running the same migration again leaves the content alone
    h.manager
        .queue()
        .enqueue_schema_migration(&h.branch.id, &v1.id, &v2.id)
        .await
        .unwrap();
    let rerun = h.manager.run_pending().await.unwrap();
    assert_eq!(rerun[0].status, JobStatus::Completed);
    assert_eq!(h.draft("node-1").await.id, migrated.id);
    assert_eq!(h.store.count_containers_at_version(&v2.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_product_price_conversions() {
    let h = Harness::new().await;
    let v1 = h.manager.create_schema(product(FieldType::Number)).await.unwrap();
    h.manager.assign_version(&h.branch.id, &v1, false).await.unwrap();
    h.add_draft("p-1", &v1, vec![("price", FieldValue::Number(9.99))]).await;
    h.add_draft("p-2", &v1, vec![("price", FieldValue::Number(10.0))]).await;

    // number -> string always converts
    let v2 = h
        .manager
        .update_schema(SchemaKind::Schema, product(FieldType::String), &[], None)
        .await
        .unwrap();
    h.manager.assign_version(&h.branch.id, &v2, false).await.unwrap().unwrap();
    let finished = h.manager.run_pending().await.unwrap();
    assert_eq!(finished[0].status, JobStatus::Completed);
    assert_eq!(h.draft("p-1").await.fields["price"], FieldValue::String("9.99".into()));
    assert_eq!(h.draft("p-2").await.fields["price"], FieldValue::String("10".into()));

    // string -> number fails only for text that is not a number
    h.add_draft("p-3", &v2, vec![("price", FieldValue::String("abc".into()))]).await;
    h.add_draft("p-4", &v2, vec![("price", FieldValue::String("42".into()))]).await;
    let v3 = h
        .manager
        .update_schema(SchemaKind::Schema, product(FieldType::Number), &[], None)
        .await
        .unwrap();
    h.manager.assign_version(&h.branch.id, &v3, false).await.unwrap().unwrap();
    let finished = h.manager.run_pending().await.unwrap();
    let job = &finished[0];
    assert_eq!(job.status, JobStatus::Failed);

    let error = job.error.as_ref().unwrap();
    assert_eq!(error.container_errors.len(), 1);
    assert_eq!(error.container_errors[0].node_id, "p-3");
    assert_eq!(error.container_errors[0].field.as_deref(), Some("price"));

    assert_eq!(h.draft("p-1").await.fields["price"], FieldValue::Number(9.99));
    assert_eq!(h.draft("p-4").await.fields["price"], FieldValue::Number(42.0));
    let untouched = h.draft("p-3").await;
    assert_eq!(untouched.schema_version_id, v2.id);
    assert_eq!(untouched.fields["price"], FieldValue::String("abc".into()));
    assert_eq!(h.manager.remaining_count(&h.branch.id, SchemaKind::Schema, "product").await.unwrap(), 1);

    // A retry runs into the same container again
    let retry = h.manager.retry_job(&job.id).await.unwrap();
    assert_eq!(retry.retry_of.as_ref(), Some(&job.id));
    let finished = h.manager.run_pending().await.unwrap();
    assert_eq!(finished[0].status, JobStatus::Failed);
}

#[tokio::test]
async fn test_assignment_is_forward_only() {
    let h = Harness::new().await;
    let v1 = h.manager.create_schema(article_v1()).await.unwrap();
    let v2 = h
        .manager
        .update_schema(SchemaKind::Schema, article_v2(), &[], None)
        .await
        .unwrap();
    h.manager.assign_version(&h.branch.id, &v2, false).await.unwrap();
    h.add_draft("node-1", &v2, vec![("title", FieldValue::String("Hi".into()))])
        .await;

    // Same version is a no-op
    assert!(h.manager.assign_version(&h.branch.id, &v2, false).await.unwrap().is_none());

    let err = h.manager.assign_version(&h.branch.id, &v1, false).await.unwrap_err();
    assert!(err.is_conflict());

    // Forcing a step back moves the pin but does not touch content
    assert!(h.manager.assign_version(&h.branch.id, &v1, true).await.unwrap().is_none());
    let pinned = h
        .manager
        .assignment()
        .assigned_version(&h.branch.id, SchemaKind::Schema, "article")
        .await
        .unwrap();
    assert_eq!(pinned.id, v1.id);
    assert!(h.manager.list_jobs(&JobFilter::default()).await.unwrap().is_empty());

    // Content on v2 is now ahead of the pin; migrate_remaining only looks at older versions
    assert!(h
        .manager
        .migrate_remaining(&h.branch.id, SchemaKind::Schema)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_microschema_migration_and_branch_fork() {
    let h = Harness::new().await;
    let quote_v1 = h
        .manager
        .create_microschema(SchemaDefinition::new("quote").with_field(FieldSchema::new("text", FieldType::String)))
        .await
        .unwrap();
    let page = h
        .manager
        .create_schema(
            SchemaDefinition::new("page")
                .with_field(FieldSchema::new("title", FieldType::String))
                .with_field(FieldSchema::new("teaser", FieldType::Micronode).with_allow(&["quote"])),
        )
        .await
        .unwrap();
    h.manager.assign_version(&h.branch.id, &quote_v1, false).await.unwrap();
    h.manager.assign_version(&h.branch.id, &page, false).await.unwrap();

    let hash_before = h
        .manager
        .compute_hash(&page.id, &h.branch.id, &BTreeMap::new())
        .await
        .unwrap();

    let quote = Micronode::new("quote", quote_v1.id.clone()).with_field("text", FieldValue::String("Hi".into()));
    h.add_draft(
        "page-1",
        &page,
        vec![
            ("title", FieldValue::String("Home".into())),
            ("teaser", FieldValue::Micronode(quote)),
        ],
    )
    .await;
    h.add_draft("page-2", &page, vec![("title", FieldValue::String("Empty".into()))])
        .await;

    let quote_v2 = h
        .manager
        .update_schema(
            SchemaKind::Microschema,
            SchemaDefinition::new("quote")
                .with_field(FieldSchema::new("text", FieldType::String))
                .with_field(FieldSchema::new("author", FieldType::String).with_default(json!("unknown"))),
            &[],
            None,
        )
        .await
        .unwrap();
    let job = h
        .manager
        .assign_version(&h.branch.id, &quote_v2, false)
        .await
        .unwrap()
        .expect("a microschema job");
    assert_eq!(job.job_type().as_str(), "microschema");

    let finished = h.manager.run_pending().await.unwrap();
    assert_eq!(finished[0].status, JobStatus::Completed);
    assert_eq!(
        h.store
            .count_edges_with_micronode_version(&h.branch.id, &quote_v1.id)
            .await
            .unwrap(),
        0
    );

    let migrated = h.draft("page-1").await;
    assert_eq!(migrated.schema_version_id, page.id);
    let FieldValue::Micronode(teaser) = &migrated.fields["teaser"] else {
        panic!("teaser should hold a micronode");
    };
    assert_eq!(teaser.version_id, quote_v2.id);
    assert_eq!(teaser.fields["author"], FieldValue::String("unknown".into()));
    assert!(h.draft("page-2").await.previous.is_none());

    let hash_after = h
        .manager
        .compute_hash(&page.id, &h.branch.id, &BTreeMap::new())
        .await
        .unwrap();
    assert_ne!(hash_before, hash_after);

    // Fork a branch and let the branch job copy the content
    let (feature, job) = h
        .manager
        .create_branch(&"project-1".to_string(), "feature", Some(&h.branch.id))
        .await
        .unwrap();
    assert!(job.is_some());
    assert!(!feature.migrated);
    assert!(feature.latest);
    assert_eq!(feature.microschema_versions.get("quote"), Some(&quote_v2.id));

    let finished = h.manager.run_pending().await.unwrap();
    assert_eq!(finished[0].status, JobStatus::Completed);
    let feature = h.store.get_branch(&feature.id).await.unwrap().unwrap();
    assert!(feature.migrated);
    let copied = h
        .store
        .list_edges(&feature.id, ContainerType::Draft, None, 100)
        .await
        .unwrap();
    assert_eq!(copied.len(), 2);
    assert!(!h.store.get_branch(&h.branch.id).await.unwrap().unwrap().latest);
}

#[tokio::test]
async fn test_version_purge_removes_unreferenced_history() {
    let h = Harness::new().await;
    let v1 = h.manager.create_schema(article_v1()).await.unwrap();
    h.manager.assign_version(&h.branch.id, &v1, false).await.unwrap();
    h.add_draft("node-1", &v1, vec![("title", FieldValue::String("a".into()))])
        .await;

    for step in 0..2 {
        let latest = h.manager.registry().latest(SchemaKind::Schema, "article").await.unwrap();
        let next = h
            .manager
            .update_schema(
                SchemaKind::Schema,
                latest
                    .definition
                    .clone()
                    .with_field(FieldSchema::new(format!("extra{}", step), FieldType::String)),
                &[],
                None,
            )
            .await
            .unwrap();
        h.manager.assign_version(&h.branch.id, &next, false).await.unwrap().unwrap();
        h.manager.run_pending().await.unwrap();
    }
    let head = h.draft("node-1").await;
    assert_eq!(h.store.count_containers_at_version(&v1.id).await.unwrap(), 1);

    h.manager
        .enqueue_version_purge(&h.branch.project_id, None)
        .await
        .unwrap();
    let finished = h.manager.run_pending().await.unwrap();
    assert_eq!(finished[0].status, JobStatus::Completed);

    assert_eq!(h.store.count_containers_at_version(&v1.id).await.unwrap(), 0);
    let head = h.store.get_container(&head.id).await.unwrap().unwrap();
    assert!(head.previous.is_none());
    assert_eq!(h.draft("node-1").await.id, head.id);
}

#[tokio::test]
async fn test_forked_branches_migrate_and_purge_shared_history() {
    let h = Harness::new().await;
    let v1 = h.manager.create_schema(article_v1()).await.unwrap();
    h.manager.assign_version(&h.branch.id, &v1, false).await.unwrap();
    let shared = h
        .add_draft("node-1", &v1, vec![("title", FieldValue::String("Shared".into()))])
        .await;

    let (feature, _) = h
        .manager
        .create_branch(&"project-1".to_string(), "feature", Some(&h.branch.id))
        .await
        .unwrap();
    h.manager.run_pending().await.unwrap();
    assert_eq!(h.draft_on(&feature.id, "node-1").await.id, shared.id);

    // Both branches move the shared container to v2 independently
    let v2 = h
        .manager
        .update_schema(SchemaKind::Schema, article_v2(), &[], Some(1))
        .await
        .unwrap();
    h.manager.assign_version(&h.branch.id, &v2, false).await.unwrap().unwrap();
    h.manager.assign_version(&feature.id, &v2, false).await.unwrap().unwrap();
    let finished = h.manager.run_pending().await.unwrap();
    assert!(finished.iter().all(|job| job.status == JobStatus::Completed));

    let main_head = h.draft("node-1").await;
    let feature_head = h.draft_on(&feature.id, "node-1").await;
    assert_ne!(main_head.id, feature_head.id);
    let shared = h.store.get_container(&shared.id).await.unwrap().unwrap();
    assert_eq!(shared.next.len(), 2);
    assert!(shared.next.contains(&main_head.id));
    assert!(shared.next.contains(&feature_head.id));

    h.manager
        .enqueue_version_purge(&h.branch.project_id, None)
        .await
        .unwrap();
    let finished = h.manager.run_pending().await.unwrap();
    assert_eq!(finished[0].status, JobStatus::Completed);

    assert!(h.store.get_container(&shared.id).await.unwrap().is_none());
    for head in [&main_head, &feature_head] {
        let head = h.store.get_container(&head.id).await.unwrap().unwrap();
        assert!(head.previous.is_none());
    }
}

#[tokio::test]
async fn test_second_upgrade_before_first_job_runs() {
    let h = Harness::new().await;
    let v1 = h.manager.create_schema(article_v1()).await.unwrap();
    h.manager.assign_version(&h.branch.id, &v1, false).await.unwrap();
    h.add_draft("node-1", &v1, vec![("title", FieldValue::String("Hello".into()))])
        .await;

    let v2 = h
        .manager
        .update_schema(SchemaKind::Schema, article_v2(), &[], Some(1))
        .await
        .unwrap();
    h.manager.assign_version(&h.branch.id, &v2, false).await.unwrap().unwrap();

    let v3 = h
        .manager
        .update_schema(
            SchemaKind::Schema,
            article_v2().with_field(FieldSchema::new("summary", FieldType::String)),
            &[],
            Some(2),
        )
        .await
        .unwrap();
    assert!(h.manager.assign_version(&h.branch.id, &v3, false).await.unwrap().is_some());

    let finished = h.manager.run_pending().await.unwrap();
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|job| job.status == JobStatus::Completed));
    let head = h.draft("node-1").await;
    assert_eq!(head.schema_version_id, v3.id);
    assert_eq!(head.fields["title"], FieldValue::String("Hello".into()));
    assert_eq!(h.manager.remaining_count(&h.branch.id, SchemaKind::Schema, "article").await.unwrap(), 0);
}

#[tokio::test]
async fn test_purge_failed_keeps_completed() {
    let h = Harness::new().await;
    let queue = h.manager.queue();
    let mut jobs = Vec::new();
    for branch in ["b-1", "b-2", "b-3"] {
        jobs.push(queue.enqueue_branch_migration(&branch.to_string()).await.unwrap());
    }
    for job in &jobs {
        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(&claimed.id, &job.id);
    }
    queue.fail(&jobs[0].id, mesh_schema_rust::JobError::new("first")).await.unwrap();
    queue.fail(&jobs[1].id, mesh_schema_rust::JobError::new("second")).await.unwrap();
    queue.complete(&jobs[2].id).await.unwrap();

    assert_eq!(h.manager.purge_failed_jobs().await.unwrap(), 2);
    let remaining = h.manager.list_jobs(&JobFilter::default()).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, jobs[2].id);
    assert_eq!(remaining[0].status, JobStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    let h = Harness::new().await;
    let job_count = 6;
    let claimant_count = 10;

    let mut expected = HashSet::new();
    for i in 0..job_count {
        let job = h
            .manager
            .queue()
            .enqueue_branch_migration(&format!("branch-{}", i))
            .await
            .unwrap();
        expected.insert(job.id);
    }

    let mut handles = Vec::new();
    for _ in 0..claimant_count {
        let queue = h.manager.queue().clone();
        handles.push(tokio::spawn(async move { queue.claim_next().await.unwrap() }));
    }

    let mut claimed: Vec<Id> = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            assert_eq!(job.status, JobStatus::Started);
            claimed.push(job.id);
        }
    }

    assert_eq!(claimed.len(), job_count);
    let distinct: HashSet<Id> = claimed.into_iter().collect();
    assert_eq!(distinct, expected);
}

#[tokio::test]
async fn test_usage_hash_order_and_sensitivity() {
    let h = Harness::new().await;
    let teaser = FieldSchema::new("teaser", FieldType::Micronode).with_allow(&["quote", "image"]);
    let gallery = FieldSchema::list("gallery", FieldType::Micronode).with_allow(&["image"]);

    let mut forward = SchemaDefinition::new("page");
    forward.fields = vec![teaser.clone(), gallery.clone()];
    let mut reversed = SchemaDefinition::new("page");
    reversed.fields = vec![gallery, teaser];
    let a = SchemaVersion::root(SchemaKind::Schema, forward);
    let b = SchemaVersion::root(SchemaKind::Schema, reversed);

    let mut branch = h.branch.clone();
    branch.microschema_versions.insert("quote".into(), "quote-1".into());
    branch.microschema_versions.insert("image".into(), "image-1".into());

    let hasher = MicroschemaUsageHasher::new();
    let none = BTreeMap::new();
    let hash = hasher.compute_hash(&a, &branch, &none);
    assert_eq!(hash, hasher.compute_hash(&b, &branch, &none));
    assert_eq!(hash.len(), 64);

    branch.microschema_versions.insert("image".into(), "image-2".into());
    hasher.invalidate_branch(&branch.id);
    assert_ne!(hash, hasher.compute_hash(&a, &branch, &none));
}
