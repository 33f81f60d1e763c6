use std::{
	io::Cursor,
	path::Path,
	sync::{Arc, Mutex},
};

use chrono::DateTime;
use miette::{Context as _, IntoDiagnostic as _, Result};
use tokio::io::AsyncReadExt as _;
use tokio_util::io::InspectReader;
use tracing::{debug, instrument, warn};

use crate::{
	config::Config,
	errors::ChError,
	layout::BackupLayout,
	metadata::{BackupMeta, BackupState, LAST, PartMeta},
};

use super::{
	DeleteOutcome, ObjectStorage,
	codec::CodecChain,
	rate_limit::{TokenBucket, limit_reader},
	tar,
};

/// Everything produced by uploading one part.
#[derive(Debug, Clone)]
pub struct UploadedPart {
	pub checksum: String,
	/// Stored bytes, after codecs.
	pub size: u64,
	pub raw_size: u64,
	pub files: Vec<crate::metadata::FileEntry>,
}

/// The storage facade the engine talks to: documents, part artifacts, and payload files,
/// with the codec chain and rate limiter applied where they belong.
#[derive(Clone)]
pub struct BackupStorage {
	storage: Arc<dyn ObjectStorage>,
	layout: BackupLayout,
	parts_chain: CodecChain,
	envelope_chain: CodecChain,
	bucket: Arc<TokenBucket>,
	validate_after_upload: bool,
}

impl BackupStorage {
	pub fn new(storage: Arc<dyn ObjectStorage>, config: &Config) -> Self {
		Self {
			storage,
			layout: BackupLayout::new(config.backup.path_root.clone()),
			parts_chain: CodecChain::for_parts(&config.encryption),
			envelope_chain: CodecChain::for_cloud_envelope(
				&config.encryption,
				config.cloud_storage.compression,
				config.cloud_storage.encryption,
			),
			bucket: Arc::new(TokenBucket::new(config.rate_limiter.max_upload_rate)),
			validate_after_upload: config.backup.validate_part_after_upload,
		}
	}

	pub fn layout(&self) -> &BackupLayout {
		&self.layout
	}

	pub fn raw(&self) -> &Arc<dyn ObjectStorage> {
		&self.storage
	}

	pub fn encryption_enabled(&self) -> bool {
		self.parts_chain.encrypted()
	}

	// ---- documents ----

	pub async fn save_document(&self, meta: &BackupMeta) -> Result<()> {
		let key = self.layout.document_key(&meta.name);
		let body = serde_json::to_vec_pretty(meta).into_diagnostic()?;
		debug!(key, state = %meta.state, "writing backup document");
		self.storage
			.put(&key, Box::new(Cursor::new(body)))
			.await
			.wrap_err("writing backup document")?;
		Ok(())
	}

	pub async fn try_load_document(&self, name: &str) -> Result<Option<BackupMeta>> {
		let key = self.layout.document_key(name);
		if !self.storage.exists(&key).await? {
			return Ok(None);
		}
		let mut reader = self.storage.get(&key).await?;
		let mut body = Vec::new();
		reader.read_to_end(&mut body).await.into_diagnostic()?;

		match serde_json::from_slice(&body) {
			Ok(meta) => Ok(Some(meta)),
			Err(err) => {
				// torn or foreign documents surface as failed, not as a crash
				warn!(name, %err, "unreadable backup document");
				Ok(Some(unreadable_document(name, &err.to_string())))
			}
		}
	}

	pub async fn load_document(&self, name: &str) -> Result<BackupMeta> {
		self.try_load_document(name)
			.await?
			.ok_or_else(|| ChError::NotFound(name.to_string()).into())
	}

	/// All backup documents, newest first by start time.
	pub async fn list_backups(&self) -> Result<Vec<BackupMeta>> {
		let entries = self.storage.list(&self.layout.root_prefix()).await?;
		let mut backups = Vec::new();
		for entry in entries {
			if let Some(name) = self.layout.backup_name_of_document(&entry.key) {
				if let Some(meta) = self.try_load_document(&name).await? {
					backups.push(meta);
				}
			}
		}
		backups.sort_by(|a, b| {
			b.start_time
				.cmp(&a.start_time)
				.then_with(|| b.name.cmp(&a.name))
		});
		Ok(backups)
	}

	/// Resolve a name or the `LAST` alias. Only `created` backups satisfy `LAST`.
	pub async fn resolve_backup(&self, target: &str) -> Result<BackupMeta> {
		if target == LAST {
			self.list_backups()
				.await?
				.into_iter()
				.find(|meta| meta.state == BackupState::Created)
				.ok_or_else(|| ChError::NotFound(LAST.to_string()).into())
		} else {
			self.load_document(target).await
		}
	}

	// ---- part artifacts ----

	/// The key of the artifact actually holding a part's bytes, following its link if any.
	pub fn artifact_key(&self, own_backup: &str, part: &PartMeta) -> String {
		match &part.link {
			None => self
				.layout
				.part_key(own_backup, &part.database, &part.table, &part.name),
			Some(link) => self
				.layout
				.part_key(&link.backup, &link.database, &link.table, &part.name),
		}
	}

	/// Present and non-empty; used both by dedup verification and delete bookkeeping.
	pub async fn artifact_verified(&self, key: &str) -> Result<bool> {
		Ok(self.storage.size(key).await?.is_some_and(|size| size > 0))
	}

	/// Pack a part directory and upload it, hashing the TAR stream as it is produced so the
	/// checksum is known at completion. Optionally validates by reading the artifact back;
	/// the first mismatch deletes and re-uploads, a second is fatal for the part.
	#[instrument(skip(self, dir), level = "debug")]
	pub async fn upload_part(
		&self,
		backup: &str,
		database: &str,
		table: &str,
		part: &str,
		dir: &Path,
	) -> Result<UploadedPart> {
		let key = self.layout.part_key(backup, database, table, part);

		let (mut uploaded, mut stream_hash) = self.upload_part_once(&key, dir).await?;
		if self.validate_after_upload {
			if self.readback_checksum(&key).await? != stream_hash {
				warn!(key, "artifact failed read-back validation, re-uploading");
				self.storage.delete_many(&[key.clone()]).await?;
				(uploaded, stream_hash) = self.upload_part_once(&key, dir).await?;
				let second = self.readback_checksum(&key).await?;
				if second != stream_hash {
					return Err(ChError::Integrity(format!(
						"artifact {key} corrupt after re-upload: expected {stream_hash}, read back {second}"
					))
					.into());
				}
			}
		}
		Ok(uploaded)
	}

	async fn upload_part_once(&self, key: &str, dir: &Path) -> Result<(UploadedPart, String)> {
		let (tar_reader, pack_task) = tar::pack_dir(dir);

		let hasher = Arc::new(Mutex::new(blake3::Hasher::new()));
		let hashing = {
			let hasher = hasher.clone();
			InspectReader::new(tar_reader, move |bytes| {
				hasher
					.lock()
					.expect("BUG: hasher mutex poisoned")
					.update(bytes);
			})
		};

		let (encoded, codec_task) = self.parts_chain.encode(Box::new(hashing));
		let limited = limit_reader(encoded, self.bucket.clone());

		let size = self
			.storage
			.put(key, limited)
			.await
			.wrap_err_with(|| format!("uploading part artifact {key}"))?;

		let pack = pack_task
			.await
			.into_diagnostic()
			.wrap_err("packing task panicked")??;
		if let Some(task) = codec_task {
			task.await
				.into_diagnostic()
				.wrap_err("codec task panicked")??;
		}

		let stream_hash = tar::checksum_label(
			&hasher
				.lock()
				.expect("BUG: hasher mutex poisoned")
				.finalize(),
		);
		Ok((
			UploadedPart {
				checksum: tar::manifest_checksum(&pack.files),
				size,
				raw_size: pack.raw_size,
				files: pack.files,
			},
			stream_hash,
		))
	}

	/// Hash of the unpacked (post-codec) TAR stream of a stored artifact.
	async fn readback_checksum(&self, key: &str) -> Result<String> {
		let reader = self.storage.get(key).await?;
		let mut decoded = self.parts_chain.decode(reader).await?;
		let mut hasher = blake3::Hasher::new();
		let mut buffer = vec![0_u8; 64 * 1024];
		loop {
			let read = decoded.read(&mut buffer).await.into_diagnostic()?;
			if read == 0 {
				break;
			}
			hasher.update(&buffer[..read]);
		}
		Ok(tar::checksum_label(&hasher.finalize()))
	}

	/// Download a part artifact (following its link) and unpack it into `dest`, then verify
	/// the unpacked files against the catalog checksum.
	#[instrument(skip(self, part, dest), level = "debug")]
	pub async fn download_part(
		&self,
		own_backup: &str,
		part: &PartMeta,
		dest: &Path,
	) -> Result<()> {
		let key = self.artifact_key(own_backup, part);
		let reader = self.storage.get(&key).await?;
		let decoded = self.parts_chain.decode(reader).await?;

		tar::unpack_into(decoded, dest).await?;

		let manifest = tar::manifest_of_dir(dest).await?;
		let found = tar::manifest_checksum(&manifest.files);
		if found != part.checksum {
			return Err(ChError::Integrity(format!(
				"artifact {key}: expected {}, downloaded {found}",
				part.checksum
			))
			.into());
		}
		Ok(())
	}

	// ---- payload files (access control, UDFs, named collections) ----

	pub async fn upload_payload(&self, key: &str, body: Vec<u8>) -> Result<()> {
		let (encoded, task) = self.parts_chain.encode(Box::new(Cursor::new(body)));
		self.storage.put(key, encoded).await?;
		if let Some(task) = task {
			task.await
				.into_diagnostic()
				.wrap_err("codec task panicked")??;
		}
		Ok(())
	}

	pub async fn download_payload(&self, key: &str) -> Result<Vec<u8>> {
		let reader = self.storage.get(key).await?;
		let mut decoded = self.parts_chain.decode(reader).await?;
		let mut body = Vec::new();
		decoded.read_to_end(&mut body).await.into_diagnostic()?;
		Ok(body)
	}

	// ---- cloud-storage metadata envelope ----

	pub async fn upload_envelope(&self, key: &str, body: Vec<u8>) -> Result<()> {
		let (encoded, task) = self.envelope_chain.encode(Box::new(Cursor::new(body)));
		self.storage.put(key, encoded).await?;
		if let Some(task) = task {
			task.await
				.into_diagnostic()
				.wrap_err("codec task panicked")??;
		}
		Ok(())
	}

	pub async fn download_envelope(&self, key: &str) -> Result<Vec<u8>> {
		let reader = self.storage.get(key).await?;
		let mut decoded = self.envelope_chain.decode(reader).await?;
		let mut body = Vec::new();
		decoded.read_to_end(&mut body).await.into_diagnostic()?;
		Ok(body)
	}

	// ---- deletion ----

	pub async fn delete_keys(&self, keys: &[String]) -> Result<DeleteOutcome> {
		if keys.is_empty() {
			return Ok(DeleteOutcome::default());
		}
		self.storage.delete_many(keys).await
	}

	pub async fn delete_prefix(&self, prefix: &str) -> Result<DeleteOutcome> {
		let keys: Vec<String> = self
			.storage
			.list(prefix)
			.await?
			.into_iter()
			.map(|entry| entry.key)
			.collect();
		self.delete_keys(&keys).await
	}
}

fn unreadable_document(name: &str, reason: &str) -> BackupMeta {
	let mut meta = BackupMeta::new(name, "", "", Default::default());
	meta.state = BackupState::Failed;
	meta.fail_reason = Some(format!("unreadable document: {reason}"));
	meta.start_time = DateTime::UNIX_EPOCH.fixed_offset();
	meta
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::memory::MemoryStorage;

	fn test_pipeline() -> (Arc<MemoryStorage>, BackupStorage) {
		let storage = Arc::new(MemoryStorage::new());
		let mut config = Config::default();
		config.backup.path_root = "root".into();
		config.backup.validate_part_after_upload = true;
		let pipeline = BackupStorage::new(storage.clone(), &config);
		(storage, pipeline)
	}

	fn part_dir() -> tempfile::TempDir {
		let dir = tempfile::tempdir().expect("tempdir");
		std::fs::write(dir.path().join("data.bin"), vec![3_u8; 2048]).expect("w");
		std::fs::write(dir.path().join("count.txt"), b"2048").expect("w");
		dir
	}

	#[tokio::test]
	async fn part_upload_download_roundtrip() {
		let (_storage, pipeline) = test_pipeline();
		let dir = part_dir();

		let uploaded = pipeline
			.upload_part("b1", "db", "t", "0_1_1_0", dir.path())
			.await
			.expect("upload");
		assert!(uploaded.checksum.starts_with("b3:"));
		assert_eq!(uploaded.raw_size, 2048 + 4);
		assert_eq!(uploaded.files.len(), 2);

		let part = PartMeta {
			database: "db".into(),
			table: "t".into(),
			name: "0_1_1_0".into(),
			disk_name: "default".into(),
			storage_class: Default::default(),
			checksum: uploaded.checksum.clone(),
			size: uploaded.size,
			raw_size: uploaded.raw_size,
			files: uploaded.files.clone(),
			link: None,
			tarball: true,
			disk_type: None,
		};

		let dest = tempfile::tempdir().expect("tempdir");
		pipeline
			.download_part("b1", &part, dest.path())
			.await
			.expect("download");
		assert_eq!(
			std::fs::read(dest.path().join("data.bin")).expect("read"),
			vec![3_u8; 2048]
		);
	}

	#[tokio::test]
	async fn corrupted_artifact_fails_download() {
		let (storage, pipeline) = test_pipeline();
		let dir = part_dir();
		let uploaded = pipeline
			.upload_part("b1", "db", "t", "0_1_1_0", dir.path())
			.await
			.expect("upload");

		storage
			.corrupt_truncate("root/b1/data/db/t/0_1_1_0.tar")
			.await;

		let part = PartMeta {
			database: "db".into(),
			table: "t".into(),
			name: "0_1_1_0".into(),
			disk_name: "default".into(),
			storage_class: Default::default(),
			checksum: uploaded.checksum,
			size: uploaded.size,
			raw_size: uploaded.raw_size,
			files: vec![],
			link: None,
			tarball: true,
			disk_type: None,
		};
		let dest = tempfile::tempdir().expect("tempdir");
		assert!(
			pipeline
				.download_part("b1", &part, dest.path())
				.await
				.is_err()
		);
	}

	#[tokio::test]
	async fn documents_roundtrip_and_list_newest_first() {
		let (_storage, pipeline) = test_pipeline();

		let mut old = BackupMeta::new("older", "h", "24.3", Default::default());
		old.start_time = DateTime::parse_from_str(
			"2026-07-01 00:00:00 +0000",
			crate::metadata::TIME_FORMAT,
		)
		.expect("time");
		old.finalize();
		let mut new = BackupMeta::new("newer", "h", "24.3", Default::default());
		new.start_time = DateTime::parse_from_str(
			"2026-08-01 00:00:00 +0000",
			crate::metadata::TIME_FORMAT,
		)
		.expect("time");

		pipeline.save_document(&old).await.expect("save");
		pipeline.save_document(&new).await.expect("save");

		let listed = pipeline.list_backups().await.expect("list");
		assert_eq!(listed.len(), 2);
		assert_eq!(listed[0].name, "newer");

		// LAST resolves past the non-created newest to the newest created
		let last = pipeline.resolve_backup(LAST).await.expect("resolve");
		assert_eq!(last.name, "older");

		assert!(matches!(
			pipeline
				.resolve_backup("missing")
				.await
				.expect_err("missing")
				.downcast_ref::<ChError>(),
			Some(ChError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn torn_documents_surface_as_failed() {
		let (storage, pipeline) = test_pipeline();
		storage
			.put(
				"root/torn/backup_struct.json",
				Box::new(Cursor::new(b"{not json".to_vec())),
			)
			.await
			.expect("put");

		let meta = pipeline.load_document("torn").await.expect("load");
		assert_eq!(meta.state, BackupState::Failed);
		assert!(meta.fail_reason.expect("reason").contains("unreadable"));
	}
}
