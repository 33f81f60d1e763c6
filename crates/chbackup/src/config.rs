use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	time::Duration,
};

use miette::{Context as _, IntoDiagnostic as _, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

/// Tool configuration, read from a single YAML file.
///
/// Every section has workable defaults; a config file is only needed to point at the object
/// storage bucket and the ClickHouse node, and to tune retention and dedup behaviour.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
	pub backup: BackupConfig,
	pub storage: StorageConfig,
	pub rate_limiter: RateLimiterConfig,
	pub encryption: EncryptionConfig,
	pub cloud_storage: CloudStorageConfig,
	pub multiprocessing: MultiprocessingConfig,
	pub lock: LockConfig,
	pub clickhouse: ClickHouseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackupConfig {
	/// Key prefix all backups live under in the bucket.
	pub path_root: String,

	pub deduplicate_parts: bool,

	/// Prior backups older than this do not contribute dedup entries.
	#[serde(deserialize_with = "duration_str")]
	pub deduplication_age_limit: Duration,

	/// How many catalog entries to page at once while building the dedup index.
	pub deduplication_batch_size: usize,

	#[serde(deserialize_with = "duration_str")]
	pub retain_time: Duration,
	pub retain_count: usize,

	/// A new backup is a no-op if the most recent non-failed one started within this window.
	#[serde(deserialize_with = "duration_str")]
	pub min_interval: Duration,

	/// Labels applied to every backup, merged with (and overridden by) `--label` arguments.
	pub labels: BTreeMap<String, String>,

	/// Read each part back after upload and verify its checksum.
	pub validate_part_after_upload: bool,

	pub override_replica_name: Option<String>,
	pub force_non_replicated: bool,
	pub restore_fail_on_attach_error: bool,

	/// How many times to retry a table whose shadow directory already exists from an earlier
	/// freeze with the same name.
	pub retry_on_existing_dir: usize,

	pub skip_lock_for_schema_only: SchemaOnlyLockBypass,

	/// Persist the restore context to disk every N part operations.
	pub restore_context_sync_on_disk_operation_threshold: usize,

	/// Where the resumable restore context lives on the destination node.
	pub restore_context_path: PathBuf,

	/// Ask the server to waive its drop-size guard when replacing a mismatched table.
	pub relax_drop_guard: bool,
}

impl Default for BackupConfig {
	fn default() -> Self {
		Self {
			path_root: "ch_backup".into(),
			deduplicate_parts: true,
			deduplication_age_limit: Duration::from_secs(7 * 24 * 3600),
			deduplication_batch_size: 500,
			retain_time: Duration::from_secs(30 * 24 * 3600),
			retain_count: 7,
			min_interval: Duration::ZERO,
			labels: BTreeMap::new(),
			validate_part_after_upload: false,
			override_replica_name: None,
			force_non_replicated: false,
			restore_fail_on_attach_error: true,
			retry_on_existing_dir: 0,
			skip_lock_for_schema_only: SchemaOnlyLockBypass::default(),
			restore_context_sync_on_disk_operation_threshold: 100,
			restore_context_path: PathBuf::from("/tmp/chbackup_restore_context.json"),
			relax_drop_guard: false,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchemaOnlyLockBypass {
	pub backup: bool,
	pub restore: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
	pub bucket: String,
	/// Custom S3 endpoint, for non-AWS object stores.
	pub endpoint: Option<String>,
	pub region: Option<String>,
	pub access_key_id: Option<String>,
	pub secret_access_key: Option<String>,

	/// Threshold and part size for multipart uploads, bytes.
	pub chunk_size: u64,

	/// How long a rate-limited multipart part may stall before it is retried, seconds.
	pub uploading_traffic_limit_retry_time: u64,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			bucket: String::new(),
			endpoint: None,
			region: None,
			access_key_id: None,
			secret_access_key: None,
			chunk_size: 5 * 1024 * 1024,
			uploading_traffic_limit_retry_time: 60,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimiterConfig {
	/// Upload rate cap in bytes per second. Zero disables the limiter.
	pub max_upload_rate: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EncryptionConfig {
	#[serde(rename = "type")]
	pub kind: EncryptionKind,
	/// Passphrase for the age scrypt recipient.
	pub key: Option<String>,
	pub is_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionKind {
	#[default]
	Age,
	None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CloudStorageConfig {
	/// Compress the object-storage key-list envelope.
	pub compression: bool,
	/// Apply the encryption envelope to object-storage metadata.
	pub encryption: bool,
	/// Remote location of each object-storage disk of the node, keyed by disk name. Needed
	/// to restore such disks: the server only reports local mount paths.
	pub disks: BTreeMap<String, DiskRemote>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DiskRemote {
	pub bucket: String,
	#[serde(default)]
	pub path: String,
}

impl Default for CloudStorageConfig {
	fn default() -> Self {
		Self {
			compression: true,
			encryption: true,
			disks: BTreeMap::new(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MultiprocessingConfig {
	pub freeze_threads: usize,
	pub upload_threads: usize,
	pub cloud_storage_restore_workers: usize,
}

impl Default for MultiprocessingConfig {
	fn default() -> Self {
		Self {
			freeze_threads: 4,
			upload_threads: 4,
			cloud_storage_restore_workers: 4,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LockConfig {
	pub flock: bool,
	pub zk_flock: bool,
	pub flock_path: PathBuf,
	pub zk_flock_path: String,
	/// How long to keep retrying lock acquisition before giving up.
	#[serde(deserialize_with = "duration_str")]
	pub timeout: Duration,
}

impl Default for LockConfig {
	fn default() -> Self {
		Self {
			flock: true,
			zk_flock: false,
			flock_path: PathBuf::from("/var/lock/chbackup.lock"),
			zk_flock_path: "/chbackup/lock".into(),
			timeout: Duration::from_secs(1),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClickHouseConfig {
	/// HTTP interface of the local node.
	pub url: String,
	pub user: Option<String>,
	pub password: Option<String>,
	#[serde(deserialize_with = "duration_str")]
	pub timeout: Duration,

	/// Local access-control storage, for ACL backup/restore.
	pub access_path: PathBuf,
	/// Local user-defined function storage.
	pub udf_path: PathBuf,
	/// Local named collections storage.
	pub named_collections_path: PathBuf,
}

impl Default for ClickHouseConfig {
	fn default() -> Self {
		Self {
			url: "http://localhost:8123".into(),
			user: None,
			password: None,
			timeout: Duration::from_secs(60),
			access_path: PathBuf::from("/var/lib/clickhouse/access"),
			udf_path: PathBuf::from("/var/lib/clickhouse/user_defined"),
			named_collections_path: PathBuf::from("/var/lib/clickhouse/named_collections"),
		}
	}
}

/// Read and parse the config file, or fall back to defaults if no path is given.
#[instrument(level = "debug")]
pub fn load_config(path: Option<&Path>) -> Result<Config> {
	let Some(path) = path else {
		debug!("no config file given, using defaults");
		return Ok(Config::default());
	};

	let text = std::fs::read_to_string(path)
		.into_diagnostic()
		.wrap_err_with(|| format!("reading config file {path:?}"))?;

	let de = serde_yaml::Deserializer::from_str(&text);
	let config: Config = serde_path_to_error::deserialize(de)
		.into_diagnostic()
		.wrap_err_with(|| format!("parsing config file {path:?}"))?;

	debug!(?config, "loaded config");
	Ok(config)
}

fn duration_str<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
	D: serde::Deserializer<'de>,
{
	let text = String::deserialize(deserializer)?;
	humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_complete() {
		let config = Config::default();
		assert!(config.backup.deduplicate_parts);
		assert_eq!(config.storage.chunk_size, 5 * 1024 * 1024);
		assert_eq!(config.multiprocessing.upload_threads, 4);
		assert_eq!(config.backup.retain_count, 7);
	}

	#[test]
	fn parses_a_full_file() {
		let text = r#"
backup:
  path_root: backups/ch
  deduplication_age_limit: 2d
  retain_time: 14d
  retain_count: 3
  min_interval: 30m
  labels:
    env: prod
storage:
  bucket: my-backups
  endpoint: https://storage.example.net
  chunk_size: 10485760
rate_limiter:
  max_upload_rate: 1048576
encryption:
  type: age
  key: opensesame
  is_enabled: true
multiprocessing:
  freeze_threads: 2
  upload_threads: 8
lock:
  flock_path: /tmp/test.lock
  zk_flock: true
clickhouse:
  url: http://ch01:8123
  user: backup
"#;
		let config: Config = serde_yaml::from_str(text).expect("parse");
		assert_eq!(config.backup.retain_count, 3);
		assert_eq!(
			config.backup.min_interval,
			std::time::Duration::from_secs(30 * 60)
		);
		assert_eq!(config.backup.labels["env"], "prod");
		assert_eq!(config.storage.chunk_size, 10 * 1024 * 1024);
		assert_eq!(config.rate_limiter.max_upload_rate, 1024 * 1024);
		assert!(config.lock.zk_flock);
		assert_eq!(config.multiprocessing.upload_threads, 8);
	}

	#[test]
	fn rejects_unknown_keys() {
		let text = "backup:\n  retain_cuont: 3\n";
		assert!(serde_yaml::from_str::<Config>(text).is_err());
	}
}
