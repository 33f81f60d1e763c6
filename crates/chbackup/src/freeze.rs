use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use miette::{IntoDiagnostic as _, Result, WrapErr as _, miette};
use tokio::{
	sync::{Mutex, Semaphore, mpsc},
	task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
	clickhouse::DiskInfo,
	cloud::{CloudEnvelope, DiskMetadataFile, ENVELOPE_FILE, REVISION_FILE},
	dedup::{DedupDecision, Deduper},
	engine::Engine,
	errors::ChError,
	metadata::{BackupMeta, CloudStorageMeta, PartMeta, StorageClass},
	storage::tar,
};

/// One discovered frozen part, waiting to be deduplicated and uploaded.
#[derive(Debug, Clone)]
struct Candidate {
	database: String,
	table: String,
	part: String,
	dir: PathBuf,
	disk_name: String,
	object_storage: bool,
	disk_type: Option<String>,
}

/// Freeze every MergeTree table recorded in the backup document, walk the shadow trees,
/// deduplicate, and upload. Appends part descriptors to the document's catalog.
///
/// Freezing and uploading run in independent bounded pools; the first unrecoverable error
/// cancels both and surfaces once everything has drained. The shadow trees are released on
/// every exit path.
#[instrument(skip_all, fields(backup = %meta.name), level = "debug")]
pub async fn freeze_and_upload(
	engine: &Engine,
	meta: &mut BackupMeta,
	deduper: Arc<Deduper>,
) -> Result<()> {
	let disks = engine.ch.list_disks().await?;
	prepare_shadow_dirs(engine, &meta.name, &disks).await?;

	let result = run_pipeline(engine, meta, deduper, &disks).await;

	if let Err(err) = unfreeze(engine, &meta.name, &disks).await {
		// the backup itself is fine at this point; a stuck shadow dir is an operator chore
		warn!(%err, "failed to release shadow directories");
	}

	result
}

/// A shadow tree with our name left over from an unrelated earlier freeze would mix foreign
/// parts into this backup. Clear it out, within the configured retry budget.
async fn prepare_shadow_dirs(engine: &Engine, name: &str, disks: &[DiskInfo]) -> Result<()> {
	let retries = engine.config.backup.retry_on_existing_dir;
	for disk in disks {
		let shadow = disk.path.join("shadow").join(name);
		let mut attempt = 0;
		while shadow.exists() {
			if attempt >= retries {
				return Err(ChError::Integrity(format!(
					"shadow directory {shadow:?} already exists and retries are exhausted"
				))
				.into());
			}
			attempt += 1;
			warn!(?shadow, attempt, "removing leftover shadow directory");
			tokio::fs::remove_dir_all(&shadow)
				.await
				.into_diagnostic()
				.wrap_err_with(|| format!("removing leftover shadow directory {shadow:?}"))?;
		}
	}
	Ok(())
}

async fn run_pipeline(
	engine: &Engine,
	meta: &mut BackupMeta,
	deduper: Arc<Deduper>,
	disks: &[DiskInfo],
) -> Result<()> {
	let tables: Vec<(String, String)> = meta
		.databases
		.values()
		.flat_map(|db| {
			db.tables
				.values()
				.filter(|table| table.is_merge_tree())
				.map(|table| (db.name.clone(), table.name.clone()))
		})
		.collect();
	if tables.is_empty() {
		debug!("no tables with data to freeze");
		return Ok(());
	}

	let upload_threads = engine.config.multiprocessing.upload_threads.max(1);
	let freeze_threads = engine.config.multiprocessing.freeze_threads.max(1);

	let token = CancellationToken::new();
	let first_error: Arc<Mutex<Option<miette::Report>>> = Arc::default();
	let record_error = {
		let first_error = first_error.clone();
		let token = token.clone();
		move |err: miette::Report| {
			let first_error = first_error.clone();
			let token = token.clone();
			async move {
				let mut slot = first_error.lock().await;
				if slot.is_none() {
					*slot = Some(err);
					token.cancel();
				} else {
					// only the first failure becomes the fail reason
					warn!(%err, "subsequent error while draining pipeline");
				}
			}
		}
	};

	let (tx, rx) = mpsc::channel::<Candidate>(upload_threads * 2);
	let rx = Arc::new(Mutex::new(rx));

	// freeze + walk: per-table workers gated by a semaphore
	let freeze_gate = Arc::new(Semaphore::new(freeze_threads));
	let mut freezers = JoinSet::new();
	for (database, table) in tables {
		let engine = engine.clone();
		let name = meta.name.clone();
		let disks = disks.to_vec();
		let tx = tx.clone();
		let token = token.clone();
		let gate = freeze_gate.clone();
		let record_error = record_error.clone();

		freezers.spawn(async move {
			let _permit = gate.acquire_owned().await.expect("BUG: gate never closes");
			if token.is_cancelled() {
				return;
			}

			if let Err(err) = engine
				.ch
				.freeze_table(&database, &table, &name, &[])
				.await
				.wrap_err_with(|| format!("freezing {database}.{table}"))
			{
				record_error(err).await;
				return;
			}

			if let Err(err) =
				walk_frozen_table(&name, &disks, &database, &table, &tx, &token).await
			{
				record_error(err).await;
			}
		});
	}
	drop(tx);

	// dedupe + pack + upload workers
	let parts: Arc<Mutex<Vec<PartMeta>>> = Arc::default();
	let envelope_objects: Arc<Mutex<BTreeMap<String, Vec<crate::cloud::ObjectRef>>>> =
		Arc::default();
	let mut uploaders = JoinSet::new();
	for _ in 0..upload_threads {
		let engine = engine.clone();
		let name = meta.name.clone();
		let deduper = deduper.clone();
		let rx = rx.clone();
		let token = token.clone();
		let parts = parts.clone();
		let envelope_objects = envelope_objects.clone();
		let record_error = record_error.clone();

		uploaders.spawn(async move {
			loop {
				let candidate = {
					let mut rx = rx.lock().await;
					rx.recv().await
				};
				let Some(candidate) = candidate else {
					break;
				};
				if token.is_cancelled() {
					continue; // drain without working
				}

				match process_candidate(&engine, &name, &deduper, &candidate, &envelope_objects)
					.await
				{
					Ok(part) => parts.lock().await.push(part),
					Err(err) => record_error(err).await,
				}
			}
		});
	}

	while freezers.join_next().await.is_some() {}
	while uploaders.join_next().await.is_some() {}

	if let Some(err) = first_error.lock().await.take() {
		return Err(err);
	}

	for part in Arc::try_unwrap(parts)
		.map_err(|_| miette!("upload workers still hold the parts list"))?
		.into_inner()
	{
		meta.add_part(part)?;
	}

	finish_cloud_storage(engine, meta, disks, envelope_objects).await?;
	Ok(())
}

/// Emit one candidate per part directory found under the frozen table's shadow path.
async fn walk_frozen_table(
	name: &str,
	disks: &[DiskInfo],
	database: &str,
	table: &str,
	tx: &mpsc::Sender<Candidate>,
	token: &CancellationToken,
) -> Result<()> {
	for disk in disks {
		let table_shadow = disk
			.path
			.join("shadow")
			.join(name)
			.join("data")
			.join(database)
			.join(table);
		if !table_shadow.is_dir() {
			continue;
		}

		let mut entries = tokio::fs::read_dir(&table_shadow)
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("reading shadow directory {table_shadow:?}"))?;
		while let Some(entry) = entries.next_entry().await.into_diagnostic()? {
			if !entry.file_type().await.into_diagnostic()?.is_dir() {
				continue;
			}
			let part = entry.file_name().to_string_lossy().into_owned();
			debug!(database, table, part, disk = disk.name, "found frozen part");

			let candidate = Candidate {
				database: database.to_string(),
				table: table.to_string(),
				part,
				dir: entry.path(),
				disk_name: disk.name.clone(),
				object_storage: disk.is_object_storage(),
				disk_type: disk
					.is_object_storage()
					.then(|| disk.disk_type.clone()),
			};
			tokio::select! {
				sent = tx.send(candidate) => {
					if sent.is_err() {
						return Ok(()); // uploaders are gone; the error is already recorded
					}
				}
				() = token.cancelled() => return Ok(()),
			}
		}
	}
	Ok(())
}

/// Scan, deduplicate, and (when no prior artifact matches) pack and upload one part.
async fn process_candidate(
	engine: &Engine,
	backup: &str,
	deduper: &Deduper,
	candidate: &Candidate,
	envelope_objects: &Mutex<BTreeMap<String, Vec<crate::cloud::ObjectRef>>>,
) -> Result<PartMeta> {
	// a part merged away mid-backup surfaces here as an integrity error
	let manifest = tar::manifest_of_dir(&candidate.dir)
		.await
		.map_err(|err| ChError::Integrity(err.to_string()))?;
	let checksum = tar::manifest_checksum(&manifest.files);

	if candidate.object_storage {
		let mut objects = Vec::new();
		for file in &manifest.files {
			let text = tokio::fs::read_to_string(candidate.dir.join(&file.name))
				.await
				.into_diagnostic()?;
			objects.extend(DiskMetadataFile::parse(&text)?.objects);
		}
		envelope_objects
			.lock()
			.await
			.entry(candidate.disk_name.clone())
			.or_default()
			.extend(objects);
	}

	let decision = deduper
		.decide(
			&engine.pipeline,
			&candidate.database,
			&candidate.table,
			&candidate.part,
			&checksum,
		)
		.await?;

	let (link, size) = match decision {
		DedupDecision::Link(link) => {
			let key = engine.pipeline.layout().part_key(
				&link.backup,
				&link.database,
				&link.table,
				&candidate.part,
			);
			let size = engine.pipeline.raw().size(&key).await?.unwrap_or(0);
			info!(
				database = candidate.database,
				table = candidate.table,
				part = candidate.part,
				to = link.backup,
				"deduplicated part"
			);
			(Some(link), size)
		}
		DedupDecision::Upload => {
			let _permit = deduper.upload_permit(&checksum).await;
			let uploaded = engine
				.pipeline
				.upload_part(
					backup,
					&candidate.database,
					&candidate.table,
					&candidate.part,
					&candidate.dir,
				)
				.await?;
			info!(
				database = candidate.database,
				table = candidate.table,
				part = candidate.part,
				size = uploaded.size,
				"uploaded part"
			);
			(None, uploaded.size)
		}
	};

	Ok(PartMeta {
		database: candidate.database.clone(),
		table: candidate.table.clone(),
		name: candidate.part.clone(),
		disk_name: candidate.disk_name.clone(),
		storage_class: if candidate.object_storage {
			StorageClass::ObjectStorage
		} else {
			StorageClass::Local
		},
		checksum,
		size,
		raw_size: manifest.raw_size,
		files: manifest.files,
		link,
		tarball: true,
		disk_type: candidate.disk_type.clone(),
	})
}

/// Capture revision markers and upload the per-disk envelopes for object-storage disks.
async fn finish_cloud_storage(
	engine: &Engine,
	meta: &mut BackupMeta,
	disks: &[DiskInfo],
	envelope_objects: Arc<Mutex<BTreeMap<String, Vec<crate::cloud::ObjectRef>>>>,
) -> Result<()> {
	let mut envelope_objects = envelope_objects.lock().await;
	let mut revisions = BTreeMap::new();

	for disk in disks.iter().filter(|disk| disk.is_object_storage()) {
		let objects = envelope_objects.remove(&disk.name).unwrap_or_default();
		if objects.is_empty() {
			continue;
		}

		let revision_file = disk.path.join("shadow").join(&meta.name).join(REVISION_FILE);
		let revision = match tokio::fs::read_to_string(&revision_file).await {
			Ok(text) => text.trim().parse().unwrap_or(0),
			Err(_) => 0,
		};
		revisions.insert(disk.name.clone(), revision);

		let envelope = CloudEnvelope {
			disk: disk.name.clone(),
			disk_type: disk.disk_type.clone(),
			revision,
			objects,
		};
		let key = format!(
			"{}{ENVELOPE_FILE}",
			engine
				.pipeline
				.layout()
				.cloud_storage_prefix(&meta.name, &disk.name)
		);
		engine
			.pipeline
			.upload_envelope(&key, serde_json::to_vec_pretty(&envelope).into_diagnostic()?)
			.await?;
		debug!(disk = disk.name, revision, "wrote cloud storage envelope");
	}

	if !revisions.is_empty() {
		meta.cloud_storage = Some(CloudStorageMeta {
			revisions,
			compression: engine.config.cloud_storage.compression,
			encryption: engine.config.cloud_storage.encryption,
			source_bucket: None,
			source_path: None,
		});
	}
	Ok(())
}

/// Release the shadow trees, server-side when the server can, directly otherwise.
async fn unfreeze(engine: &Engine, name: &str, disks: &[DiskInfo]) -> Result<()> {
	if engine.ch.can_system_unfreeze().await? {
		engine.ch.system_unfreeze(name).await
	} else {
		for disk in disks {
			let shadow = disk.path.join("shadow").join(name);
			if shadow.exists() {
				tokio::fs::remove_dir_all(&shadow)
					.await
					.into_diagnostic()
					.wrap_err_with(|| format!("removing shadow directory {shadow:?}"))?;
			}
		}
		Ok(())
	}
}
