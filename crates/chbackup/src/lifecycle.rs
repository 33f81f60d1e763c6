use std::{
	collections::BTreeSet,
	path::Path,
	sync::Arc,
	time::Duration,
};

use chrono::{DateTime, FixedOffset, Local, Utc};
use miette::{IntoDiagnostic as _, Result, WrapErr as _, bail};
use tracing::{debug, info, instrument, warn};

use crate::{
	dedup::Deduper,
	engine::{Engine, TableFilter},
	freeze,
	metadata::{
		BackupMeta, BackupState, DatabaseMeta, PartLink, SourceKind, TableMeta, resolve_name,
	},
};

/// Options for one `backup` invocation.
#[derive(Debug, Clone)]
pub struct BackupOptions {
	pub name: Option<String>,
	pub filter: TableFilter,
	pub schema_only: bool,
	pub sources: BTreeSet<SourceKind>,
	pub force: bool,
	pub labels: Vec<(String, String)>,
}

impl Default for BackupOptions {
	fn default() -> Self {
		Self {
			name: None,
			filter: TableFilter::default(),
			schema_only: false,
			sources: SourceKind::all(),
			force: false,
			labels: Vec::new(),
		}
	}
}

/// Create a backup. Returns the new backup's name, or `None` when the min-interval policy
/// made the command a no-op.
#[instrument(skip(engine, options), level = "debug")]
pub async fn create(engine: &Engine, options: BackupOptions) -> Result<Option<String>> {
	let bypass_lock =
		options.schema_only && engine.config.backup.skip_lock_for_schema_only.backup;
	let mut lock = engine.locks.acquire(!bypass_lock).await?;

	let result = create_locked(engine, options).await;
	lock.release().await;
	result
}

async fn create_locked(engine: &Engine, options: BackupOptions) -> Result<Option<String>> {
	// one snapshot serves min-interval, the name conflict check, and the dedup index
	let existing = engine.pipeline.list_backups().await?;
	let now = Local::now().fixed_offset();

	if !options.force {
		if let Some(recent) =
			min_interval_blocker(&existing, engine.config.backup.min_interval, now)
		{
			info!(
				recent = recent.name,
				"last backup is within min_interval, nothing to do"
			);
			return Ok(None);
		}
	}

	let name = resolve_name(options.name.as_deref(), Utc::now());
	if existing.iter().any(|meta| meta.name == name) {
		bail!("backup {name} already exists");
	}

	let ch_version = engine.ch_version().await?;
	let mut meta = BackupMeta::new(&name, &engine.hostname, ch_version, options.sources.clone());
	meta.labels = engine.merged_labels(&options.labels);
	meta.schema_only = options.schema_only;
	meta.encryption_enabled = engine.pipeline.encryption_enabled();

	let result = create_inner(engine, &mut meta, &options, &existing, now).await;
	match result {
		Ok(()) => {
			meta.finalize();
			engine.pipeline.save_document(&meta).await?;
			info!(
				name,
				data = meta.data_count(),
				links = meta.link_count(),
				"backup created"
			);
			Ok(Some(name))
		}
		Err(err) => {
			meta.fail(err.to_string());
			if let Err(save_err) = engine.pipeline.save_document(&meta).await {
				warn!(%save_err, "failed to record the failure in the backup document");
			}
			Err(err)
		}
	}
}

async fn create_inner(
	engine: &Engine,
	meta: &mut BackupMeta,
	options: &BackupOptions,
	existing: &[BackupMeta],
	now: DateTime<FixedOffset>,
) -> Result<()> {
	if options.sources.contains(&SourceKind::Schema)
		|| options.sources.contains(&SourceKind::Data)
	{
		collect_schema(engine, meta, &options.filter).await?;
	}
	collect_payloads(engine, meta, &options.sources).await?;

	// the creating stub with the schema section; the final write adds the catalog
	engine.pipeline.save_document(meta).await?;

	let with_data =
		!options.schema_only && options.sources.contains(&SourceKind::Data);
	if with_data {
		let deduper = if engine.config.backup.deduplicate_parts {
			Arc::new(Deduper::build(
				existing,
				engine.config.backup.deduplication_age_limit,
				engine.config.backup.deduplication_batch_size,
				now,
			))
		} else {
			Arc::new(Deduper::disabled())
		};
		freeze::freeze_and_upload(engine, meta, deduper).await?;
	}
	Ok(())
}

/// The most recent non-failed backup inside the window, if any. A prior `failed` backup
/// never blocks the next run.
pub fn min_interval_blocker<'b>(
	existing: &'b [BackupMeta],
	min_interval: Duration,
	now: DateTime<FixedOffset>,
) -> Option<&'b BackupMeta> {
	if min_interval.is_zero() {
		return None;
	}
	existing
		.iter()
		.filter(|meta| meta.state != BackupState::Failed)
		.max_by_key(|meta| meta.start_time)
		.filter(|recent| {
			now.signed_duration_since(recent.start_time)
				.to_std()
				.map(|age| age < min_interval)
				.unwrap_or(true)
		})
}

async fn collect_schema(engine: &Engine, meta: &mut BackupMeta, filter: &TableFilter) -> Result<()> {
	for database in engine.ch.list_databases().await? {
		if database.is_system() || !filter.matches_database(&database.name) {
			continue;
		}

		let mut db_meta = DatabaseMeta {
			name: database.name.clone(),
			engine: Some(database.engine.clone()),
			uuid: database.uuid.clone(),
			metadata_sql: database.create_statement.clone(),
			tables: Default::default(),
		};

		for table in engine.ch.list_tables(&database.name).await? {
			if !filter.matches_table(&database.name, &table.name) {
				continue;
			}
			debug!(database = database.name, table = table.name, "recording schema");
			db_meta.tables.insert(
				table.name.clone(),
				TableMeta::new(&table.name, &table.create_statement)
					.with_engine(&table.engine)
					.with_uuid(table.uuid.clone()),
			);
		}

		meta.databases.insert(database.name.clone(), db_meta);
	}
	Ok(())
}

/// Upload the access-control, UDF, and named-collections payloads that were requested.
async fn collect_payloads(
	engine: &Engine,
	meta: &mut BackupMeta,
	sources: &BTreeSet<SourceKind>,
) -> Result<()> {
	if sources.contains(&SourceKind::Access) {
		let files =
			upload_payload_dir(engine, &engine.config.clickhouse.access_path, |file| {
				engine.pipeline.layout().access_key(&meta.name, file)
			})
			.await
			.wrap_err("backing up access control payload")?;
		meta.access = files;
	}
	if sources.contains(&SourceKind::Udf) {
		let files = upload_payload_dir(engine, &engine.config.clickhouse.udf_path, |file| {
			engine.pipeline.layout().udf_key(&meta.name, file)
		})
		.await
		.wrap_err("backing up user defined functions")?;
		meta.udf = files;
	}
	if sources.contains(&SourceKind::NamedCollections) {
		let files = upload_payload_dir(
			engine,
			&engine.config.clickhouse.named_collections_path,
			|file| {
				engine
					.pipeline
					.layout()
					.named_collections_key(&meta.name, file)
			},
		)
		.await
		.wrap_err("backing up named collections")?;
		meta.named_collections = files;
	}
	Ok(())
}

async fn upload_payload_dir(
	engine: &Engine,
	dir: &Path,
	key_of: impl Fn(&str) -> String,
) -> Result<Vec<String>> {
	if !dir.is_dir() {
		debug!(?dir, "payload directory absent, skipping");
		return Ok(Vec::new());
	}

	let mut files = Vec::new();
	let mut entries = tokio::fs::read_dir(dir).await.into_diagnostic()?;
	while let Some(entry) = entries.next_entry().await.into_diagnostic()? {
		if !entry.file_type().await.into_diagnostic()?.is_file() {
			continue;
		}
		let name = entry.file_name().to_string_lossy().into_owned();
		let body = tokio::fs::read(entry.path()).await.into_diagnostic()?;
		engine.pipeline.upload_payload(&key_of(&name), body).await?;
		files.push(name);
	}
	files.sort();
	Ok(files)
}

/// How a delete ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteResult {
	/// Document and all owned artifacts removed.
	Removed,
	/// Some artifacts are still referenced by other backups; the document stays behind in
	/// `partially_deleted` state until those references go away.
	PartiallyDeleted { retained_parts: usize },
}

/// Delete a backup, keeping any artifacts other backups still link to.
#[instrument(skip(engine), level = "debug")]
pub async fn delete(engine: &Engine, name: &str) -> Result<DeleteResult> {
	let mut lock = engine.locks.acquire(true).await?;
	let result = delete_locked(engine, name).await;
	lock.release().await;
	result
}

async fn delete_locked(engine: &Engine, name: &str) -> Result<DeleteResult> {
	let target = engine.pipeline.load_document(name).await?;
	let others: Vec<BackupMeta> = engine
		.pipeline
		.list_backups()
		.await?
		.into_iter()
		.filter(|meta| meta.name != target.name)
		.collect();
	delete_one(engine, target, &others).await
}

/// The delete core, shared with purge. `others` is the set of still-existing backups the
/// reference scan runs against.
async fn delete_one(
	engine: &Engine,
	mut target: BackupMeta,
	others: &[BackupMeta],
) -> Result<DeleteResult> {
	// flip to deleting first so a concurrent reader never trusts it again
	target.state = BackupState::Deleting;
	engine.pipeline.save_document(&target).await?;

	let mut deletable = Vec::new();
	let mut retained = Vec::new();
	for part in target.iter_parts() {
		if part.link.is_some() {
			continue; // the artifact belongs to another backup
		}
		let link = PartLink {
			backup: target.name.clone(),
			database: part.database.clone(),
			table: part.table.clone(),
		};
		let referenced = others.iter().any(|other| {
			other
				.iter_parts()
				.any(|p| p.name == part.name && p.link.as_ref() == Some(&link))
		});
		if referenced {
			retained.push((part.database.clone(), part.table.clone(), part.name.clone()));
		} else {
			deletable.push(engine.pipeline.artifact_key(&target.name, part));
		}
	}

	let outcome = engine.pipeline.delete_keys(&deletable).await?;
	if !outcome.failed.is_empty() {
		for (key, reason) in &outcome.failed {
			warn!(key, reason, "failed to delete artifact");
		}
		bail!(
			"failed to delete {} of {} artifacts of backup {}",
			outcome.failed.len(),
			deletable.len(),
			target.name
		);
	}

	if retained.is_empty() {
		gc_cloud_key_spaces(engine, &target, others).await?;
		// nothing links into this backup: remove the whole key space, document last
		let prefix = engine.pipeline.layout().backup_prefix(&target.name);
		engine.pipeline.delete_prefix(&prefix).await?;
		info!(name = target.name, "backup removed");
		Ok(DeleteResult::Removed)
	} else {
		// keep only descriptors whose artifacts survive, so links keep resolving
		for db in target.databases.values_mut() {
			for table in db.tables.values_mut() {
				table.parts.retain(|part_name, part| {
					part.link.is_some()
						|| retained.iter().any(|(d, t, p)| {
							d == &part.database && t == &part.table && p == part_name
						})
				});
			}
		}
		target.state = BackupState::PartiallyDeleted;
		engine.pipeline.save_document(&target).await?;
		info!(
			name = target.name,
			retained = retained.len(),
			"backup partially deleted; shared artifacts retained"
		);
		Ok(DeleteResult::PartiallyDeleted {
			retained_parts: retained.len(),
		})
	}
}

/// Remove the `shadow/<backup>` and `operations/<backup>` key spaces a fully-deleted backup
/// left in its object-storage disks' own buckets. Skipped for any disk whose captured
/// revision another backup still references.
async fn gc_cloud_key_spaces(
	engine: &Engine,
	target: &BackupMeta,
	others: &[BackupMeta],
) -> Result<()> {
	let Some(cloud) = &target.cloud_storage else {
		return Ok(());
	};

	for (disk, revision) in &cloud.revisions {
		let shared = others.iter().any(|other| {
			other
				.cloud_storage
				.as_ref()
				.is_some_and(|c| c.revisions.get(disk) == Some(revision))
		});
		if shared {
			debug!(disk, revision, "revision still referenced, leaving disk key spaces");
			continue;
		}
		let Some(remote) = engine.config.cloud_storage.disks.get(disk) else {
			warn!(disk, "no cloud_storage.disks entry, cannot clean its key spaces");
			continue;
		};

		let bucket = engine.disk_bucket(&remote.bucket).await?;
		for prefix in [
			format!("{}shadow/{}/", remote.path, target.name),
			format!("{}operations/{}/", remote.path, target.name),
		] {
			let keys: Vec<String> = bucket
				.list(&prefix)
				.await?
				.into_iter()
				.map(|entry| entry.key)
				.collect();
			if !keys.is_empty() {
				debug!(disk, prefix, count = keys.len(), "removing disk key space");
				bucket.delete_many(&keys).await?;
			}
		}
	}
	Ok(())
}

/// What purge did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
	pub removed: Vec<String>,
	pub partially_deleted: Vec<String>,
}

/// Apply the retention policy: protect the newest `retain_count` created backups, delete the
/// rest only once they are also older than `retain_time`. A backup survives unless both
/// policies select it.
#[instrument(skip(engine), level = "debug")]
pub async fn purge(engine: &Engine) -> Result<PurgeReport> {
	let mut lock = engine.locks.acquire(true).await?;
	let result = purge_locked(engine).await;
	lock.release().await;
	result
}

async fn purge_locked(engine: &Engine) -> Result<PurgeReport> {
	let now = Local::now().fixed_offset();
	let backups = engine.pipeline.list_backups().await?;
	let plan = purge_plan(
		&backups,
		engine.config.backup.retain_time,
		engine.config.backup.retain_count,
		now,
	);

	let mut report = PurgeReport::default();
	// oldest first, so shared parts progressively unreference
	let mut remaining = backups.clone();
	for name in plan.into_iter().rev() {
		let Some(position) = remaining.iter().position(|meta| meta.name == name) else {
			continue;
		};
		let target = remaining.remove(position);
		match delete_one(engine, target, &remaining).await? {
			DeleteResult::Removed => report.removed.push(name),
			DeleteResult::PartiallyDeleted { .. } => {
				report.partially_deleted.push(name.clone());
				// keep the surviving document in the reference set
				if let Some(meta) = engine.pipeline.try_load_document(&name).await? {
					remaining.insert(position, meta);
				}
			}
		}
	}
	Ok(report)
}

/// Names to delete, newest first, per the retention policy. Pure, for testability.
pub fn purge_plan(
	backups: &[BackupMeta],
	retain_time: Duration,
	retain_count: usize,
	now: DateTime<FixedOffset>,
) -> Vec<String> {
	let mut plan = Vec::new();
	let mut protected = 0_usize;

	for meta in backups {
		// newest-first ordering is the caller's contract (list_backups)
		if meta.state == BackupState::Created && protected < retain_count {
			protected += 1;
			continue;
		}

		let age = now.signed_duration_since(meta.start_time).to_std();
		let old_enough = age.map(|age| age > retain_time).unwrap_or(false);

		let unreferenced_leftover = meta.state == BackupState::PartiallyDeleted;
		if old_enough || unreferenced_leftover {
			plan.push(meta.name.clone());
		}
	}
	plan
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration as ChronoDuration;

	fn backup_at(name: &str, state: BackupState, hours_ago: i64) -> BackupMeta {
		let mut meta = BackupMeta::new(name, "host", "24.3", SourceKind::all());
		meta.start_time = Local::now().fixed_offset() - ChronoDuration::hours(hours_ago);
		meta.end_time = Some(meta.start_time);
		meta.state = state;
		meta
	}

	#[test]
	fn min_interval_ignores_failed_backups() {
		let now = Local::now().fixed_offset();
		let interval = Duration::from_secs(3600);

		// only a failed backup inside the window: does not block
		let existing = vec![backup_at("f", BackupState::Failed, 0)];
		assert!(min_interval_blocker(&existing, interval, now).is_none());

		// a created backup inside the window blocks
		let existing = vec![
			backup_at("f", BackupState::Failed, 0),
			backup_at("c", BackupState::Created, 0),
		];
		assert_eq!(
			min_interval_blocker(&existing, interval, now).map(|b| b.name.as_str()),
			Some("c")
		);

		// an old enough created backup does not
		let existing = vec![backup_at("c", BackupState::Created, 2)];
		assert!(min_interval_blocker(&existing, interval, now).is_none());

		// zero interval never blocks
		assert!(min_interval_blocker(&existing, Duration::ZERO, now).is_none());
	}

	#[test]
	fn purge_protects_count_and_requires_both_policies() {
		let now = Local::now().fixed_offset();
		// ages 0h, 25h, 50h; retain_time 1d, retain_count 2
		let backups = vec![
			backup_at("b2", BackupState::Created, 0),
			backup_at("b1", BackupState::Created, 25),
			backup_at("b0", BackupState::Created, 50),
		];

		// count protects the two newest even though b1 is older than retain_time
		let plan = purge_plan(&backups, Duration::from_secs(24 * 3600), 2, now);
		assert_eq!(plan, vec!["b0".to_string()]);

		// with retain_count 1, b1 and b0 are both selected by both policies
		let plan = purge_plan(&backups, Duration::from_secs(24 * 3600), 1, now);
		assert_eq!(plan, vec!["b1".to_string(), "b0".to_string()]);

		// a long retain_time preserves everything beyond the count
		let plan = purge_plan(&backups, Duration::from_secs(100 * 3600), 1, now);
		assert!(plan.is_empty());
	}

	#[test]
	fn purge_skips_non_created_for_protection() {
		let now = Local::now().fixed_offset();
		let backups = vec![
			backup_at("new-failed", BackupState::Failed, 30),
			backup_at("ok", BackupState::Created, 40),
			backup_at("old", BackupState::Created, 50),
		];
		// failed does not consume a protection slot; both created backups are protected
		let plan = purge_plan(&backups, Duration::from_secs(24 * 3600), 2, now);
		assert_eq!(plan, vec!["new-failed".to_string()]);
	}

	#[test]
	fn purge_collects_partially_deleted_leftovers() {
		let now = Local::now().fixed_offset();
		let backups = vec![
			backup_at("keep", BackupState::Created, 0),
			backup_at("leftover", BackupState::PartiallyDeleted, 1),
		];
		let plan = purge_plan(&backups, Duration::from_secs(24 * 3600), 2, now);
		assert_eq!(plan, vec!["leftover".to_string()]);
	}
}
