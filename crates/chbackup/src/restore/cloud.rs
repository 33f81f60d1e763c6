use std::{path::Path, sync::Arc};

use miette::{IntoDiagnostic as _, Result, WrapErr as _, miette};
use tokio::{
	sync::{Mutex, Semaphore},
	task::JoinSet,
};
use tracing::{debug, info, instrument};

use crate::{
	cloud::{CloudEnvelope, DiskMetadataFile, ENVELOPE_FILE},
	engine::Engine,
	storage::ObjectStorage,
};

/// Where an object-storage disk's objects come from and go to during restore.
#[derive(Clone)]
pub struct CloudRestorePlan {
	pub source: Arc<dyn ObjectStorage>,
	pub source_bucket: String,
	pub source_path: String,
	pub dest: Arc<dyn ObjectStorage>,
	pub dest_bucket: String,
	pub dest_path: String,
	/// Resolved mode: true when source and destination are the same bucket and prefix, so
	/// only metadata needs rebuilding.
	pub inplace: bool,
}

impl CloudRestorePlan {
	/// Inplace is strict: the same bucket AND the same prefix, else we copy.
	pub fn resolve_inplace(
		requested: bool,
		source_bucket: &str,
		source_path: &str,
		dest_bucket: &str,
		dest_path: &str,
	) -> bool {
		requested && source_bucket == dest_bucket && source_path == dest_path
	}
}

/// Fetch the cloud-storage envelope of a backup for one disk.
pub async fn load_envelope(engine: &Engine, backup: &str, disk: &str) -> Result<CloudEnvelope> {
	let key = format!(
		"{}{ENVELOPE_FILE}",
		engine.pipeline.layout().cloud_storage_prefix(backup, disk)
	);
	let body = engine
		.pipeline
		.download_envelope(&key)
		.await
		.wrap_err_with(|| format!("fetching cloud storage envelope for disk {disk}"))?;
	serde_json::from_slice(&body).into_diagnostic()
}

/// Make every object referenced by the stub files under `part_dir` exist at the
/// destination. In copy mode objects are transferred one by one; in inplace mode the stubs
/// already point at live objects and nothing moves.
#[instrument(skip(plan, part_dir), level = "debug")]
pub async fn materialize_part_objects(
	plan: &CloudRestorePlan,
	part_dir: &Path,
	workers: usize,
) -> Result<()> {
	if plan.inplace {
		debug!("inplace restore, leaving objects where they are");
		return Ok(());
	}

	let stubs = collect_stubs(part_dir).await?;
	let gate = Arc::new(Semaphore::new(workers.max(1)));
	let first_error: Arc<Mutex<Option<miette::Report>>> = Arc::default();
	let mut copies = JoinSet::new();

	for stub in stubs {
		for object in stub.objects {
			let plan = plan.clone();
			let gate = gate.clone();
			let first_error = first_error.clone();
			copies.spawn(async move {
				let _permit = gate.acquire_owned().await.expect("BUG: gate never closes");
				if first_error.lock().await.is_some() {
					return;
				}
				let from = format!("{}{}", plan.source_path, object.key);
				let to = format!("{}{}", plan.dest_path, object.key);
				let result = async {
					let reader = plan.source.get(&from).await?;
					plan.dest.put(&to, reader).await?;
					Ok::<_, miette::Report>(())
				}
				.await;
				if let Err(err) = result {
					let mut slot = first_error.lock().await;
					if slot.is_none() {
						*slot = Some(err.wrap_err(miette!("copying object {from}")));
					}
				}
			});
		}
	}
	while copies.join_next().await.is_some() {}

	if let Some(err) = first_error.lock().await.take() {
		return Err(err);
	}
	Ok(())
}

/// Parse every stub file of an unpacked object-storage part.
async fn collect_stubs(part_dir: &Path) -> Result<Vec<DiskMetadataFile>> {
	let mut stubs = Vec::new();
	for entry in walkdir::WalkDir::new(part_dir).sort_by_file_name() {
		let entry = entry.into_diagnostic()?;
		if !entry.file_type().is_file() {
			continue;
		}
		let text = tokio::fs::read_to_string(entry.path())
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("reading disk metadata stub {:?}", entry.path()))?;
		stubs.push(DiskMetadataFile::parse(&text).wrap_err_with(|| {
			format!("parsing disk metadata stub {:?}", entry.path())
		})?);
	}
	Ok(stubs)
}

/// Verify the copied (or inplace) objects of a part all exist and carry their recorded
/// sizes before the part is attached.
pub async fn verify_part_objects(plan: &CloudRestorePlan, part_dir: &Path) -> Result<()> {
	for stub in collect_stubs(part_dir).await? {
		for object in stub.objects {
			let key = format!("{}{}", plan.dest_path, object.key);
			match plan.dest.size(&key).await? {
				Some(size) if size == object.size => {}
				Some(size) => {
					return Err(miette!(
						"object {key} has size {size}, stub expects {}",
						object.size
					));
				}
				None => return Err(miette!("object {key} referenced by stub is missing")),
			}
		}
	}
	Ok(())
}

/// Report what `get-cloud-storage-metadata` fetched.
pub async fn fetch_envelope_to_file(
	engine: &Engine,
	backup: &str,
	disk: &str,
	local_path: &Path,
) -> Result<CloudEnvelope> {
	let envelope = load_envelope(engine, backup, disk).await?;
	let body = serde_json::to_vec_pretty(&envelope).into_diagnostic()?;
	tokio::fs::write(local_path, body)
		.await
		.into_diagnostic()
		.wrap_err_with(|| format!("writing {local_path:?}"))?;
	info!(disk, revision = envelope.revision, ?local_path, "wrote cloud storage metadata");
	Ok(envelope)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{cloud::ObjectRef, storage::memory::MemoryStorage};
	use std::io::Cursor;

	fn stub_with(objects: &[(&str, u64)]) -> DiskMetadataFile {
		DiskMetadataFile {
			objects: objects
				.iter()
				.map(|(key, size)| ObjectRef {
					key: key.to_string(),
					size: *size,
				})
				.collect(),
			ref_count: 1,
			read_only: false,
		}
	}

	async fn plan(inplace: bool) -> (Arc<MemoryStorage>, Arc<MemoryStorage>, CloudRestorePlan) {
		let source = Arc::new(MemoryStorage::new());
		let dest = Arc::new(MemoryStorage::new());
		let plan = CloudRestorePlan {
			source: source.clone(),
			source_bucket: "src".into(),
			source_path: "cluster/".into(),
			dest: dest.clone(),
			dest_bucket: "dst".into(),
			dest_path: "cluster/".into(),
			inplace,
		};
		(source, dest, plan)
	}

	#[test]
	fn inplace_requires_identical_bucket_and_prefix() {
		assert!(CloudRestorePlan::resolve_inplace(true, "b", "p/", "b", "p/"));
		assert!(!CloudRestorePlan::resolve_inplace(true, "b", "p/", "b", "q/"));
		assert!(!CloudRestorePlan::resolve_inplace(true, "a", "p/", "b", "p/"));
		assert!(!CloudRestorePlan::resolve_inplace(false, "b", "p/", "b", "p/"));
	}

	#[tokio::test]
	async fn copy_mode_transfers_referenced_objects() {
		let (source, dest, plan) = plan(false).await;
		source
			.put("cluster/abc/one", Box::new(Cursor::new(b"first".to_vec())))
			.await
			.expect("put");
		source
			.put("cluster/abc/two", Box::new(Cursor::new(b"second".to_vec())))
			.await
			.expect("put");

		let dir = tempfile::tempdir().expect("tempdir");
		std::fs::write(
			dir.path().join("data.bin"),
			stub_with(&[("abc/one", 5), ("abc/two", 6)]).render(),
		)
		.expect("w");

		materialize_part_objects(&plan, dir.path(), 2)
			.await
			.expect("copy");
		assert!(dest.exists("cluster/abc/one").await.expect("exists"));
		assert!(dest.exists("cluster/abc/two").await.expect("exists"));

		verify_part_objects(&plan, dir.path()).await.expect("verify");
	}

	#[tokio::test]
	async fn inplace_mode_copies_nothing() {
		let (_source, dest, plan) = plan(true).await;
		let dir = tempfile::tempdir().expect("tempdir");
		std::fs::write(
			dir.path().join("data.bin"),
			stub_with(&[("abc/one", 5)]).render(),
		)
		.expect("w");

		materialize_part_objects(&plan, dir.path(), 2)
			.await
			.expect("inplace");
		assert!(dest.keys().await.is_empty());
	}

	#[tokio::test]
	async fn verification_catches_missing_and_resized_objects() {
		let (_source, dest, plan) = plan(false).await;
		let dir = tempfile::tempdir().expect("tempdir");
		std::fs::write(
			dir.path().join("data.bin"),
			stub_with(&[("abc/one", 5)]).render(),
		)
		.expect("w");

		assert!(verify_part_objects(&plan, dir.path()).await.is_err());

		dest.put("cluster/abc/one", Box::new(Cursor::new(b"12345".to_vec())))
			.await
			.expect("put");
		verify_part_objects(&plan, dir.path()).await.expect("ok");

		dest.put("cluster/abc/one", Box::new(Cursor::new(b"123".to_vec())))
			.await
			.expect("put");
		assert!(verify_part_objects(&plan, dir.path()).await.is_err());
	}
}
