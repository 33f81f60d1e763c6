use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
};

use miette::{IntoDiagnostic as _, Result, WrapErr as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Progress of one part through the restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartProgress {
	Pending,
	Downloaded,
	Attached,
	Skipped,
}

/// The resumable per-destination restore document.
///
/// Re-running a restore against the same destination consumes this and retries only what is
/// not already attached. Synced to disk every
/// `backup.restore_context_sync_on_disk_operation_threshold` mutations, and always at the
/// end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreContext {
	pub backup: String,
	#[serde(default)]
	pub databases: BTreeMap<String, bool>,
	#[serde(default)]
	pub tables: BTreeMap<String, bool>,
	#[serde(default)]
	pub parts: BTreeMap<String, PartProgress>,

	#[serde(skip)]
	path: PathBuf,
	#[serde(skip)]
	dirty_ops: usize,
	#[serde(skip)]
	sync_threshold: usize,
}

impl RestoreContext {
	/// Load the context for this backup, or start fresh. A context left behind by a restore
	/// of a different backup is discarded.
	#[instrument(level = "debug")]
	pub async fn load_or_new(path: &Path, backup: &str, sync_threshold: usize) -> Result<Self> {
		let mut context = match tokio::fs::read(path).await {
			Ok(body) => match serde_json::from_slice::<Self>(&body) {
				Ok(context) if context.backup == backup => {
					debug!(?path, "resuming existing restore context");
					context
				}
				Ok(stale) => {
					debug!(stale = stale.backup, "discarding context for another backup");
					Self::fresh(backup)
				}
				Err(err) => {
					debug!(%err, "discarding unreadable restore context");
					Self::fresh(backup)
				}
			},
			Err(_) => Self::fresh(backup),
		};
		context.path = path.to_path_buf();
		context.sync_threshold = sync_threshold.max(1);
		Ok(context)
	}

	fn fresh(backup: &str) -> Self {
		Self {
			backup: backup.to_string(),
			databases: BTreeMap::new(),
			tables: BTreeMap::new(),
			parts: BTreeMap::new(),
			path: PathBuf::new(),
			dirty_ops: 0,
			sync_threshold: 1,
		}
	}

	pub fn part_key(database: &str, table: &str, part: &str) -> String {
		format!("{database}.{table}.{part}")
	}

	pub fn part_progress(&self, key: &str) -> PartProgress {
		self.parts
			.get(key)
			.copied()
			.unwrap_or(PartProgress::Pending)
	}

	pub async fn mark_database(&mut self, database: &str) -> Result<()> {
		self.databases.insert(database.to_string(), true);
		self.bump().await
	}

	pub async fn mark_table(&mut self, database: &str, table: &str) -> Result<()> {
		self.tables.insert(format!("{database}.{table}"), true);
		self.bump().await
	}

	pub async fn mark_part(&mut self, key: &str, progress: PartProgress) -> Result<()> {
		self.parts.insert(key.to_string(), progress);
		self.bump().await
	}

	async fn bump(&mut self) -> Result<()> {
		self.dirty_ops += 1;
		if self.dirty_ops >= self.sync_threshold {
			self.sync().await?;
		}
		Ok(())
	}

	/// Write the context out atomically (write-then-rename).
	pub async fn sync(&mut self) -> Result<()> {
		if self.path.as_os_str().is_empty() {
			return Ok(());
		}
		let body = serde_json::to_vec_pretty(self).into_diagnostic()?;
		let tmp = self.path.with_extension("tmp");
		tokio::fs::write(&tmp, body)
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("writing restore context {tmp:?}"))?;
		tokio::fs::rename(&tmp, &self.path)
			.await
			.into_diagnostic()
			.wrap_err("publishing restore context")?;
		self.dirty_ops = 0;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn resumes_matching_backup_only() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("context.json");

		let mut context = RestoreContext::load_or_new(&path, "b1", 1).await.expect("new");
		context
			.mark_part("db.t.0_1_1_0", PartProgress::Attached)
			.await
			.expect("mark");

		// same backup: progress survives
		let resumed = RestoreContext::load_or_new(&path, "b1", 1).await.expect("load");
		assert_eq!(
			resumed.part_progress("db.t.0_1_1_0"),
			PartProgress::Attached
		);

		// different backup: fresh start
		let fresh = RestoreContext::load_or_new(&path, "b2", 1).await.expect("load");
		assert_eq!(fresh.part_progress("db.t.0_1_1_0"), PartProgress::Pending);
	}

	#[tokio::test]
	async fn syncs_only_at_threshold() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("context.json");

		let mut context = RestoreContext::load_or_new(&path, "b1", 3).await.expect("new");
		context
			.mark_part("a", PartProgress::Downloaded)
			.await
			.expect("mark");
		context
			.mark_part("b", PartProgress::Downloaded)
			.await
			.expect("mark");
		assert!(!path.exists());
		context
			.mark_part("c", PartProgress::Downloaded)
			.await
			.expect("mark");
		assert!(path.exists());
	}
}
