use std::{collections::BTreeMap, sync::Arc};

use miette::{Context as _, Result};

use crate::{
	clickhouse::{ClickHouse, HttpClickHouse},
	config::Config,
	coord::Coordination,
	lock::LockManager,
	storage::{ObjectStorage, pipeline::BackupStorage, s3::S3Storage},
};

/// Everything one operation needs: config, storage facade, the ClickHouse node, locks, and
/// (optionally) the coordination service.
#[derive(Clone)]
pub struct Engine {
	pub config: Config,
	pub pipeline: BackupStorage,
	pub ch: Arc<dyn ClickHouse>,
	pub locks: LockManager,
	pub coord: Option<Arc<dyn Coordination>>,
	pub hostname: String,
}

impl Engine {
	/// Wire up production collaborators from config.
	pub async fn from_config(config: Config) -> Result<Self> {
		let storage: Arc<dyn ObjectStorage> = Arc::new(S3Storage::new(&config.storage).await?);
		let ch: Arc<dyn ClickHouse> = Arc::new(HttpClickHouse::new(&config.clickhouse)?);
		Ok(Self::assemble(config, storage, ch, None))
	}

	/// Assemble from explicit collaborators; this is how tests inject fakes.
	pub fn assemble(
		config: Config,
		storage: Arc<dyn ObjectStorage>,
		ch: Arc<dyn ClickHouse>,
		coord: Option<Arc<dyn Coordination>>,
	) -> Self {
		let pipeline = BackupStorage::new(storage, &config);
		let locks = LockManager::new(config.lock.clone(), coord.clone());
		let hostname = hostname::get()
			.map(|name| name.to_string_lossy().into_owned())
			.unwrap_or_else(|_| "unknown".into());
		Self {
			config,
			pipeline,
			ch,
			locks,
			coord,
			hostname,
		}
	}

	/// An object-storage client for a configured cloud disk's own bucket.
	pub async fn disk_bucket(&self, bucket: &str) -> Result<Arc<dyn ObjectStorage>> {
		let mut storage_config = self.config.storage.clone();
		storage_config.bucket = bucket.to_string();
		Ok(Arc::new(
			S3Storage::new(&storage_config)
				.await
				.wrap_err_with(|| format!("connecting to disk bucket {bucket}"))?,
		))
	}

	/// Labels for a new backup: configured defaults overridden by the caller's.
	pub fn merged_labels(&self, given: &[(String, String)]) -> BTreeMap<String, String> {
		let mut labels = self.config.backup.labels.clone();
		labels.extend(given.iter().cloned());
		labels
	}

	pub async fn ch_version(&self) -> Result<String> {
		self.ch
			.version()
			.await
			.wrap_err("probing clickhouse version")
	}
}

/// Parse repeated `k=v` label arguments.
pub fn parse_label(arg: &str) -> Result<(String, String)> {
	arg.split_once('=')
		.map(|(k, v)| (k.to_string(), v.to_string()))
		.ok_or_else(|| miette::miette!("label must be key=value, got {arg:?}"))
}

/// Parse a `db` or `db.table` filter.
pub fn parse_table_filter(args: &[String]) -> Result<TableFilter> {
	let mut filter = TableFilter::default();
	for arg in args {
		match arg.split_once('.') {
			Some((db, table)) => filter
				.tables
				.push((db.to_string(), table.to_string())),
			None => filter.databases.push(arg.clone()),
		}
	}
	Ok(filter)
}

/// Which databases and tables an operation covers. Empty means everything.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
	pub databases: Vec<String>,
	pub tables: Vec<(String, String)>,
}

impl TableFilter {
	pub fn from_args(databases: &[String], tables: &[String]) -> Result<Self> {
		let mut filter = parse_table_filter(tables)?;
		filter.databases.extend(databases.iter().cloned());
		Ok(filter)
	}

	pub fn is_empty(&self) -> bool {
		self.databases.is_empty() && self.tables.is_empty()
	}

	pub fn matches_database(&self, database: &str) -> bool {
		self.is_empty()
			|| self.databases.iter().any(|db| db == database)
			|| self.tables.iter().any(|(db, _)| db == database)
	}

	pub fn matches_table(&self, database: &str, table: &str) -> bool {
		if self.is_empty() {
			return true;
		}
		self.databases.iter().any(|db| db == database)
			|| self
				.tables
				.iter()
				.any(|(db, t)| db == database && t == table)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn label_parsing() {
		assert_eq!(
			parse_label("env=prod").expect("parse"),
			("env".to_string(), "prod".to_string())
		);
		assert!(parse_label("no-equals").is_err());
	}

	#[test]
	fn filter_matching() {
		let filter =
			TableFilter::from_args(&["logs".to_string()], &["app.events".to_string()])
				.expect("parse");
		assert!(filter.matches_database("logs"));
		assert!(filter.matches_database("app"));
		assert!(!filter.matches_database("other"));
		assert!(filter.matches_table("logs", "anything"));
		assert!(filter.matches_table("app", "events"));
		assert!(!filter.matches_table("app", "other"));

		let all = TableFilter::default();
		assert!(all.matches_database("anything"));
		assert!(all.matches_table("any", "thing"));
	}
}
