use std::{
	collections::HashMap,
	sync::Arc,
	time::Duration,
};

use chrono::{DateTime, FixedOffset};
use miette::Result;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, trace};

use crate::{
	metadata::{BackupMeta, PartLink},
	storage::pipeline::BackupStorage,
};

/// What to do with one candidate part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
	/// No prior artifact matches; pack and upload.
	Upload,
	/// A verified prior artifact holds identical content; write a link-only descriptor.
	Link(PartLink),
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct PartKey {
	database: String,
	table: String,
	part: String,
	checksum: String,
}

/// Part-level deduplication against prior backups.
///
/// The index is a snapshot taken at the start of the run; the locks guarantee no concurrent
/// operation mutates the backups it points into. Artifact presence is verified at decision
/// time, so a part whose artifact was lost (a crashed upload, external damage) falls out of
/// the index and gets re-uploaded rather than linked.
pub struct Deduper {
	enabled: bool,
	index: Mutex<HashMap<PartKey, PartLink>>,
	uploads: KeyedLocks,
}

impl Deduper {
	/// A disabled deduper: every candidate uploads.
	pub fn disabled() -> Self {
		Self {
			enabled: false,
			index: Mutex::new(HashMap::new()),
			uploads: KeyedLocks::default(),
		}
	}

	/// Build the index from a snapshot of prior backups, newest first.
	///
	/// A backup contributes entries iff it ended (or, while still `creating`, started) within
	/// the age limit and is not being deleted. Parts already shadowed by a newer backup are
	/// not replaced: the newest artifact wins.
	#[instrument(skip_all, level = "debug")]
	pub fn build(
		prior: &[BackupMeta],
		age_limit: Duration,
		batch_size: usize,
		now: DateTime<FixedOffset>,
	) -> Self {
		let mut index = HashMap::new();
		let batch_size = batch_size.max(1);

		for backup in prior {
			if !backup.usable_for_dedup() {
				trace!(name = %backup.name, state = %backup.state, "skipping for dedup");
				continue;
			}
			let reference = backup.end_time.unwrap_or(backup.start_time);
			let age = now.signed_duration_since(reference);
			if age.num_seconds() < 0 || age.to_std().is_ok_and(|age| age > age_limit) {
				trace!(name = %backup.name, "outside the dedup age window");
				continue;
			}

			let parts: Vec<_> = backup.iter_parts().collect();
			for batch in parts.chunks(batch_size) {
				for part in batch {
					let key = PartKey {
						database: part.database.clone(),
						table: part.table.clone(),
						part: part.name.clone(),
						checksum: part.checksum.clone(),
					};
					// the ultimate artifact, so links never chain
					let link = part.link.clone().unwrap_or_else(|| PartLink {
						backup: backup.name.clone(),
						database: part.database.clone(),
						table: part.table.clone(),
					});
					index.entry(key).or_insert(link);
				}
			}
		}

		debug!(entries = index.len(), "built dedup index");
		Self {
			enabled: true,
			index: Mutex::new(index),
			uploads: KeyedLocks::default(),
		}
	}

	/// Decide for one candidate, verifying the matched artifact is still present and
	/// non-empty before trusting it.
	pub async fn decide(
		&self,
		pipeline: &BackupStorage,
		database: &str,
		table: &str,
		part: &str,
		checksum: &str,
	) -> Result<DedupDecision> {
		if !self.enabled {
			return Ok(DedupDecision::Upload);
		}

		let key = PartKey {
			database: database.to_string(),
			table: table.to_string(),
			part: part.to_string(),
			checksum: checksum.to_string(),
		};

		let link = {
			let index = self.index.lock().await;
			index.get(&key).cloned()
		};
		let Some(link) = link else {
			return Ok(DedupDecision::Upload);
		};

		let artifact = pipeline
			.layout()
			.part_key(&link.backup, &link.database, &link.table, part);
		if pipeline.artifact_verified(&artifact).await? {
			Ok(DedupDecision::Link(link))
		} else {
			debug!(artifact, "indexed artifact is missing or empty, re-uploading");
			self.index.lock().await.remove(&key);
			Ok(DedupDecision::Upload)
		}
	}

	/// Serialize uploads by checksum: at most one concurrent upload per content identity.
	pub async fn upload_permit(&self, checksum: &str) -> OwnedMutexGuard<()> {
		self.uploads.lock(checksum).await
	}
}

/// Lazily-created named mutexes.
#[derive(Default)]
struct KeyedLocks {
	locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
	async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
		let lock = {
			let mut locks = self.locks.lock().await;
			locks.entry(key.to_string()).or_default().clone()
		};
		lock.lock_owned().await
	}
}
