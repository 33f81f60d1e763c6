use std::{
	collections::{BTreeMap, BTreeSet},
	path::Path,
	sync::Arc,
};

use clap::ValueEnum;
use miette::{IntoDiagnostic as _, Result, WrapErr as _, miette};
use tracing::{debug, info, instrument, warn};

use crate::{
	clickhouse::{ClickHouse, DiskInfo, quote_ident, schema},
	engine::{Engine, TableFilter},
	errors::ChError,
	metadata::{BackupMeta, BackupState, DatabaseMeta, PartMeta, SourceKind, TableMeta},
};

use self::{
	cloud::CloudRestorePlan,
	context::{PartProgress, RestoreContext},
};

pub mod cloud;
pub mod context;

/// How much stale coordination state to clear for Replicated engines before recreating them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CleanZookeeperMode {
	/// Remove only this replica's entries.
	ReplicaOnly,
	/// Remove every replica's entries under the table's coordination path.
	AllReplicas,
}

/// Options for one `restore` invocation.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
	pub target: String,
	pub filter: TableFilter,
	pub schema_only: bool,
	pub sources: BTreeSet<SourceKind>,
	pub override_replica_name: Option<String>,
	pub force_non_replicated: bool,
	pub clean_zookeeper_mode: Option<CleanZookeeperMode>,
	pub keep_going: bool,
	pub restore_tables_in_replicated_database: bool,
	pub cloud_source_bucket: Option<String>,
	pub cloud_source_path: Option<String>,
	pub cloud_latest: bool,
	pub use_inplace_cloud_restore: bool,
}

impl RestoreOptions {
	pub fn new(target: impl Into<String>) -> Self {
		Self {
			target: target.into(),
			filter: TableFilter::default(),
			schema_only: false,
			sources: SourceKind::all(),
			override_replica_name: None,
			force_non_replicated: false,
			clean_zookeeper_mode: None,
			keep_going: false,
			restore_tables_in_replicated_database: true,
			cloud_source_bucket: None,
			cloud_source_path: None,
			cloud_latest: false,
			use_inplace_cloud_restore: false,
		}
	}
}

/// What a restore run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
	pub databases: usize,
	pub tables: usize,
	pub attached: usize,
	pub skipped: usize,
	/// Some restored payloads (access control, named collections) only apply after a server
	/// restart; the caller decides when.
	pub needs_restart: bool,
}

/// Run a restore. Resumable: a second run against the same destination consumes the restore
/// context and retries only what is not already attached.
#[instrument(skip(engine, options), fields(target = %options.target), level = "debug")]
pub async fn restore(engine: &Engine, options: RestoreOptions) -> Result<RestoreReport> {
	// restore only contends with local mutations, so the file lock alone
	let mut lock = engine.locks.acquire(false).await?;
	let result = restore_locked(engine, options).await;
	lock.release().await;
	result
}

async fn restore_locked(engine: &Engine, options: RestoreOptions) -> Result<RestoreReport> {
	let meta = engine.pipeline.resolve_backup(&options.target).await?;
	if meta.state != BackupState::Created {
		return Err(miette!(
			"backup {} is {}, only created backups are restorable",
			meta.name,
			meta.state
		));
	}

	let mut context = RestoreContext::load_or_new(
		&engine.config.backup.restore_context_path,
		&meta.name,
		engine
			.config
			.backup
			.restore_context_sync_on_disk_operation_threshold,
	)
	.await?;

	let mut report = RestoreReport::default();
	let effective_override = options
		.override_replica_name
		.clone()
		.or_else(|| engine.config.backup.override_replica_name.clone());
	let force_non_replicated =
		options.force_non_replicated || engine.config.backup.force_non_replicated;

	restore_payloads(engine, &meta, &options.sources, &mut report).await?;

	if options.sources.contains(&SourceKind::Schema)
		|| options.sources.contains(&SourceKind::Data)
	{
		restore_databases(engine, &meta, &options, &mut context, &mut report).await?;
		restore_tables(
			engine,
			&meta,
			&options,
			effective_override.as_deref(),
			force_non_replicated,
			&mut context,
			&mut report,
		)
		.await?;
	}

	if !options.schema_only && options.sources.contains(&SourceKind::Data) {
		restore_parts(engine, &meta, &options, &mut context, &mut report).await?;
	}

	context.sync().await?;
	info!(
		databases = report.databases,
		tables = report.tables,
		attached = report.attached,
		skipped = report.skipped,
		"restore finished"
	);
	Ok(report)
}

/// Phase 1: local payloads. These become visible to the server on restart.
async fn restore_payloads(
	engine: &Engine,
	meta: &BackupMeta,
	sources: &BTreeSet<SourceKind>,
	report: &mut RestoreReport,
) -> Result<()> {
	if sources.contains(&SourceKind::Access) && !meta.access.is_empty() {
		for file in &meta.access {
			let body = engine
				.pipeline
				.download_payload(&engine.pipeline.layout().access_key(&meta.name, file))
				.await?;
			write_payload(&engine.config.clickhouse.access_path, file, body).await?;
		}
		report.needs_restart = true;
		info!(files = meta.access.len(), "restored access control payload");
	}

	if sources.contains(&SourceKind::Udf) && !meta.udf.is_empty() {
		for file in &meta.udf {
			let body = engine
				.pipeline
				.download_payload(&engine.pipeline.layout().udf_key(&meta.name, file))
				.await?;
			write_payload(&engine.config.clickhouse.udf_path, file, body).await?;
		}
		info!(files = meta.udf.len(), "restored user defined functions");
	}

	if sources.contains(&SourceKind::NamedCollections) && !meta.named_collections.is_empty() {
		for file in &meta.named_collections {
			let body = engine
				.pipeline
				.download_payload(
					&engine
						.pipeline
						.layout()
						.named_collections_key(&meta.name, file),
				)
				.await?;
			write_payload(&engine.config.clickhouse.named_collections_path, file, body).await?;
		}
		report.needs_restart = true;
		info!(
			files = meta.named_collections.len(),
			"restored named collections"
		);
	}

	Ok(())
}

async fn write_payload(dir: &Path, file: &str, body: Vec<u8>) -> Result<()> {
	tokio::fs::create_dir_all(dir).await.into_diagnostic()?;
	let path = dir.join(file);
	tokio::fs::write(&path, body)
		.await
		.into_diagnostic()
		.wrap_err_with(|| format!("writing payload file {path:?}"))
}

/// Phase 2: databases, in name order.
async fn restore_databases(
	engine: &Engine,
	meta: &BackupMeta,
	options: &RestoreOptions,
	context: &mut RestoreContext,
	report: &mut RestoreReport,
) -> Result<()> {
	for db in meta.databases.values() {
		if !options.filter.matches_database(&db.name) {
			continue;
		}

		let replicated = db.engine.as_deref() == Some("Replicated");
		if replicated {
			clean_coordination(engine, &db.metadata_sql, options.clean_zookeeper_mode).await?;
		}

		if engine.ch.show_create_database(&db.name).await?.is_none() {
			debug!(database = db.name, "creating database");
			engine
				.ch
				.execute(&db.metadata_sql)
				.await
				.wrap_err_with(|| format!("creating database {}", db.name))?;
		}
		context.mark_database(&db.name).await?;
		report.databases += 1;
	}
	Ok(())
}

/// Drop stale replica entries under a Replicated engine's coordination path, as a plain set
/// difference against the `replicas` prefix rather than any stateful walking.
async fn clean_coordination(
	engine: &Engine,
	create: &str,
	mode: Option<CleanZookeeperMode>,
) -> Result<()> {
	let (Some(mode), Some(coord)) = (mode, engine.coord.as_ref()) else {
		return Ok(());
	};
	let Some((zk_path, replica)) = schema::replica_args(create) else {
		return Ok(());
	};
	let macros = engine.ch.macros().await.unwrap_or_default();
	let zk_path = schema::expand_macros(&zk_path, &macros);
	let replicas_path = format!("{}/replicas", zk_path.trim_end_matches('/'));

	match mode {
		CleanZookeeperMode::ReplicaOnly => {
			let replica = schema::expand_macros(&replica, &macros);
			coord
				.delete_recursive(&format!("{replicas_path}/{replica}"))
				.await?;
		}
		CleanZookeeperMode::AllReplicas => {
			for child in coord.list_children(&replicas_path).await? {
				coord
					.delete_recursive(&format!("{replicas_path}/{child}"))
					.await?;
			}
		}
	}
	Ok(())
}

/// Phase 3: tables. Plain tables first, then dictionaries, views last, so dependents find
/// their dependencies.
async fn restore_tables(
	engine: &Engine,
	meta: &BackupMeta,
	options: &RestoreOptions,
	override_replica: Option<&str>,
	force_non_replicated: bool,
	context: &mut RestoreContext,
	report: &mut RestoreReport,
) -> Result<()> {
	let mut tables: Vec<(&DatabaseMeta, &TableMeta)> = Vec::new();
	for db in meta.databases.values() {
		if !options.filter.matches_database(&db.name) {
			continue;
		}
		let replicated_db = db.engine.as_deref() == Some("Replicated");
		if replicated_db && !options.restore_tables_in_replicated_database {
			// the database shell is enough; replication brings the tables over
			debug!(database = db.name, "leaving tables to database replication");
			continue;
		}
		for table in db.tables.values() {
			if options.filter.matches_table(&db.name, &table.name) {
				tables.push((db, table));
			}
		}
	}
	tables.sort_by_key(|(db, table)| {
		let class = match table.engine() {
			Some("Dictionary") => 1,
			Some("View" | "MaterializedView" | "LiveView") => 2,
			_ => 0,
		};
		(class, db.name.clone(), table.name.clone())
	});

	for (db, table) in tables {
		let mut create = table.create_statement.clone();
		if force_non_replicated {
			create = schema::force_non_replicated(&create);
		} else if let Some(replica) = override_replica {
			create = schema::override_replica(&create, replica);
		}

		if table.is_replicated() && !force_non_replicated {
			clean_coordination(engine, &create, options.clean_zookeeper_mode).await?;
		}

		match engine.ch.show_create_table(&db.name, &table.name).await? {
			None => {
				debug!(database = db.name, table = table.name, "creating table");
				engine
					.ch
					.execute(&create)
					.await
					.wrap_err_with(|| format!("creating table {}.{}", db.name, table.name))?;
			}
			Some(existing) if statements_match(&existing, &create) => {
				debug!(database = db.name, table = table.name, "table already matches");
			}
			Some(_) => {
				warn!(
					database = db.name,
					table = table.name,
					"schema mismatch, dropping and recreating"
				);
				drop_table(engine, &db.name, &table.name).await?;
				engine
					.ch
					.execute(&create)
					.await
					.wrap_err_with(|| format!("recreating table {}.{}", db.name, table.name))?;
			}
		}
		context.mark_table(&db.name, &table.name).await?;
		report.tables += 1;
	}
	Ok(())
}

/// CREATE statements compare modulo whitespace runs.
fn statements_match(a: &str, b: &str) -> bool {
	let squash = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
	squash(a) == squash(b)
}

async fn drop_table(engine: &Engine, database: &str, table: &str) -> Result<()> {
	let mut sql = format!(
		"DROP TABLE IF EXISTS {}.{} SYNC",
		quote_ident(database),
		quote_ident(table)
	);
	if engine.config.backup.relax_drop_guard {
		sql.push_str(" SETTINGS max_table_size_to_drop = 0");
	}
	engine
		.ch
		.execute(&sql)
		.await
		.map_err(|err| {
			miette::Report::new(ChError::SchemaMismatch {
				table: format!("{database}.{table}"),
			})
			.wrap_err(err.to_string())
		})
		.map(|_| ())
}

/// Phase 4: parts. Local parts are downloaded and attached; object-storage parts get their
/// objects materialized first.
async fn restore_parts(
	engine: &Engine,
	meta: &BackupMeta,
	options: &RestoreOptions,
	context: &mut RestoreContext,
	report: &mut RestoreReport,
) -> Result<()> {
	let disks: BTreeMap<String, DiskInfo> = engine
		.ch
		.list_disks()
		.await?
		.into_iter()
		.map(|disk| (disk.name.clone(), disk))
		.collect();

	let fatal_attach = engine.config.backup.restore_fail_on_attach_error && !options.keep_going;
	let mut cloud_plans: BTreeMap<String, CloudRestorePlan> = BTreeMap::new();

	for db in meta.databases.values() {
		if !options.filter.matches_database(&db.name) {
			continue;
		}
		for table in db.tables.values() {
			if !options.filter.matches_table(&db.name, &table.name) {
				continue;
			}
			for part in table.parts.values() {
				let key = RestoreContext::part_key(&db.name, &table.name, &part.name);
				if context.part_progress(&key) == PartProgress::Attached {
					debug!(part = key, "already attached, skipping");
					continue;
				}

				let disk = disks.get(&part.disk_name).ok_or_else(|| {
					miette!("part {} lives on unknown disk {}", part.name, part.disk_name)
				})?;

				let result =
					restore_one_part(engine, meta, options, part, disk, &mut cloud_plans, &key)
						.await;
				match result {
					Ok(()) => {
						context.mark_part(&key, PartProgress::Attached).await?;
						report.attached += 1;
					}
					Err(err) if fatal_attach => {
						context.sync().await?;
						return Err(err);
					}
					Err(err) => {
						warn!(part = key, %err, "attach failed, skipping");
						context.mark_part(&key, PartProgress::Skipped).await?;
						report.skipped += 1;
					}
				}
			}
		}
	}
	Ok(())
}

async fn restore_one_part(
	engine: &Engine,
	meta: &BackupMeta,
	options: &RestoreOptions,
	part: &PartMeta,
	disk: &DiskInfo,
	cloud_plans: &mut BTreeMap<String, CloudRestorePlan>,
	key: &str,
) -> Result<()> {
	let detached = disk
		.path
		.join("data")
		.join(&part.database)
		.join(&part.table)
		.join("detached")
		.join(&part.name);

	engine
		.pipeline
		.download_part(&meta.name, part, &detached)
		.await?;

	if disk.is_object_storage() {
		let plan = match cloud_plans.get(&disk.name) {
			Some(plan) => plan.clone(),
			None => {
				let plan = build_cloud_plan(engine, options, &disk.name).await?;
				cloud_plans.insert(disk.name.clone(), plan.clone());
				plan
			}
		};
		cloud::materialize_part_objects(
			&plan,
			&detached,
			engine.config.multiprocessing.cloud_storage_restore_workers,
		)
		.await?;
		cloud::verify_part_objects(&plan, &detached).await?;
	}

	engine
		.ch
		.attach_part(&part.database, &part.table, &part.name)
		.await
		.map_err(|err| {
			// leave no torn detached directory behind a failed attach
			let _ = std::fs::remove_dir_all(&detached);
			miette::Report::new(ChError::AttachFailure {
				table: format!("{}.{}", part.database, part.table),
				part: part.name.clone(),
				message: err.to_string(),
			})
		})?;

	debug!(part = key, "attached");
	Ok(())
}

/// Resolve where a cloud disk's objects come from and go to for this run.
async fn build_cloud_plan(
	engine: &Engine,
	options: &RestoreOptions,
	disk_name: &str,
) -> Result<CloudRestorePlan> {
	let remote = engine
		.config
		.cloud_storage
		.disks
		.get(disk_name)
		.ok_or_else(|| {
			miette!(
				"no cloud_storage.disks entry for disk {disk_name}; \
				 cannot restore object-storage parts without it"
			)
		})?;

	let source_bucket = options
		.cloud_source_bucket
		.clone()
		.unwrap_or_else(|| remote.bucket.clone());
	let source_path = options
		.cloud_source_path
		.clone()
		.unwrap_or_else(|| remote.path.clone());
	if options.cloud_latest {
		debug!(disk = disk_name, "restoring from the latest bucket state");
	}

	let inplace = CloudRestorePlan::resolve_inplace(
		options.use_inplace_cloud_restore,
		&source_bucket,
		&source_path,
		&remote.bucket,
		&remote.path,
	);

	let dest = engine.disk_bucket(&remote.bucket).await?;
	let source = if source_bucket == remote.bucket {
		dest.clone()
	} else {
		engine.disk_bucket(&source_bucket).await?
	};

	Ok(CloudRestorePlan {
		source,
		source_bucket,
		source_path,
		dest,
		dest_bucket: remote.bucket.clone(),
		dest_path: remote.path.clone(),
		inplace,
	})
}

/// Copy normalized schema from another host: the `restore-schema` operation.
///
/// Reads the source's databases and tables, applies the same rewrites a restore would, and
/// recreates them here, dropping this replica's stale coordination entries so the server
/// re-syncs from its peers on startup.
#[instrument(skip(engine, source), level = "debug")]
pub async fn restore_schema_from(
	engine: &Engine,
	source: Arc<dyn ClickHouse>,
	filter: &TableFilter,
) -> Result<usize> {
	let mut lock = engine.locks.acquire(false).await?;
	let result = restore_schema_locked(engine, source, filter).await;
	lock.release().await;
	result
}

async fn restore_schema_locked(
	engine: &Engine,
	source: Arc<dyn ClickHouse>,
	filter: &TableFilter,
) -> Result<usize> {
	let override_replica = engine.config.backup.override_replica_name.clone();
	let force_non_replicated = engine.config.backup.force_non_replicated;
	let mut created = 0_usize;

	for database in source.list_databases().await? {
		if database.is_system() || !filter.matches_database(&database.name) {
			continue;
		}
		if engine
			.ch
			.show_create_database(&database.name)
			.await?
			.is_none()
		{
			engine
				.ch
				.execute(&database.create_statement)
				.await
				.wrap_err_with(|| format!("creating database {}", database.name))?;
		}

		let mut tables = source.list_tables(&database.name).await?;
		tables.sort_by_key(|table| (table.is_view(), table.name.clone()));
		for table in tables {
			if !filter.matches_table(&database.name, &table.name) {
				continue;
			}
			let mut create = table.create_statement.clone();
			if force_non_replicated {
				create = schema::force_non_replicated(&create);
			} else if let Some(replica) = &override_replica {
				create = schema::override_replica(&create, replica);
			}

			if table.engine.starts_with("Replicated") && !force_non_replicated {
				clean_coordination(engine, &create, Some(CleanZookeeperMode::ReplicaOnly))
					.await?;
			}

			if engine
				.ch
				.show_create_table(&database.name, &table.name)
				.await?
				.is_none()
			{
				engine
					.ch
					.execute(&create)
					.await
					.wrap_err_with(|| {
						format!("creating table {}.{}", database.name, table.name)
					})?;
				created += 1;
			}
		}
	}
	Ok(created)
}
