use std::{
	collections::{BTreeMap, BTreeSet},
	fmt,
};

use chrono::{DateTime, FixedOffset, Local, SecondsFormat, Utc};
use miette::{bail, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::clickhouse::schema;

/// Format used for `start_time`/`end_time` in the backup document.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

/// Format used for generated backup names.
pub const NAME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Version string written into every document this tool produces.
pub const DOCUMENT_VERSION: &str = "1";

/// Alias accepted wherever a backup name is expected, resolving to the newest created backup.
pub const LAST: &str = "LAST";

/// Lifecycle state of a backup.
///
/// Documents written by other (possibly newer) versions of the tool may carry states we do not
/// know; those deserialize as [`Failed`](BackupState::Failed) so that every reader sees exactly
/// one of five states and never trusts a torn or foreign document as restorable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
	Creating,
	Created,
	Failed,
	Deleting,
	PartiallyDeleted,
}

impl BackupState {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Creating => "creating",
			Self::Created => "created",
			Self::Failed => "failed",
			Self::Deleting => "deleting",
			Self::PartiallyDeleted => "partially_deleted",
		}
	}
}

impl fmt::Display for BackupState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl Serialize for BackupState {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for BackupState {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let text = String::deserialize(deserializer)?;
		Ok(match text.as_str() {
			"creating" => Self::Creating,
			"created" => Self::Created,
			"deleting" => Self::Deleting,
			"partially_deleted" => Self::PartiallyDeleted,
			// "failed", and anything we don't recognise
			_ => Self::Failed,
		})
	}
}

/// What a backup contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
	Data,
	Access,
	Udf,
	NamedCollections,
	Schema,
}

impl SourceKind {
	pub fn all() -> BTreeSet<Self> {
		BTreeSet::from([
			Self::Data,
			Self::Access,
			Self::Udf,
			Self::NamedCollections,
			Self::Schema,
		])
	}
}

/// Where a part's bytes live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageClass {
	#[default]
	Local,
	ObjectStorage,
}

/// Reference from a deduplicated part to the backup actually holding its artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartLink {
	pub backup: String,
	pub database: String,
	pub table: String,
}

/// A single file inside a packed part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
	pub name: String,
	pub size: u64,
	pub checksum: String,
}

/// The unit of data I/O: one ClickHouse part, packed as a TAR artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMeta {
	pub database: String,
	pub table: String,
	pub name: String,
	#[serde(default = "default_disk")]
	pub disk_name: String,
	#[serde(default)]
	pub storage_class: StorageClass,
	/// Content hash of the packed artifact, `b3:<hex>`.
	pub checksum: String,
	/// Size of the stored artifact, after packing and codecs.
	pub size: u64,
	/// Sum of the file sizes before packing.
	pub raw_size: u64,
	pub files: Vec<FileEntry>,
	/// `None` for a fresh upload; a link for a deduplicated part.
	#[serde(default)]
	pub link: Option<PartLink>,
	#[serde(default = "default_true")]
	pub tarball: bool,
	/// Source bucket revision marker, for object-storage parts.
	#[serde(default)]
	pub disk_type: Option<String>,
}

fn default_disk() -> String {
	"default".into()
}

fn default_true() -> bool {
	true
}

impl PartMeta {
	/// The backup whose artifact holds this part's bytes.
	pub fn artifact_backup<'p>(&'p self, own: &'p str) -> &'p str {
		self.link.as_ref().map_or(own, |link| link.backup.as_str())
	}
}

/// Per-table section of the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
	pub name: String,
	/// May be missing from documents written by older versions; see [`TableMeta::engine`].
	#[serde(default, rename = "engine")]
	engine_field: Option<String>,
	#[serde(default)]
	pub uuid: Option<String>,
	pub create_statement: String,
	#[serde(default)]
	pub metadata_path: Option<String>,
	#[serde(default)]
	pub parts: BTreeMap<String, PartMeta>,
}

impl TableMeta {
	pub fn new(name: impl Into<String>, create_statement: impl Into<String>) -> Self {
		let create_statement = create_statement.into();
		Self {
			name: name.into(),
			engine_field: schema::engine_of(&create_statement).map(String::from),
			uuid: schema::uuid_of(&create_statement).map(String::from),
			create_statement,
			metadata_path: None,
			parts: BTreeMap::new(),
		}
	}

	/// Prefer the engine reported by the server over the one derived from the statement.
	pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
		self.engine_field = Some(engine.into());
		self
	}

	pub fn with_uuid(mut self, uuid: Option<String>) -> Self {
		if uuid.is_some() {
			self.uuid = uuid;
		}
		self
	}

	/// The table engine, falling back to deriving it from the CREATE statement for documents
	/// that predate the field.
	pub fn engine(&self) -> Option<&str> {
		self.engine_field
			.as_deref()
			.or_else(|| schema::engine_of(&self.create_statement))
	}

	pub fn is_merge_tree(&self) -> bool {
		self.engine().is_some_and(|e| e.ends_with("MergeTree"))
	}

	pub fn is_replicated(&self) -> bool {
		self.engine().is_some_and(|e| e.starts_with("Replicated"))
	}
}

/// Per-database section of the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseMeta {
	pub name: String,
	#[serde(default)]
	pub engine: Option<String>,
	#[serde(default)]
	pub uuid: Option<String>,
	pub metadata_sql: String,
	#[serde(default)]
	pub tables: BTreeMap<String, TableMeta>,
}

/// Cloud-storage (S3-backed MergeTree disk) section of the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudStorageMeta {
	/// Disk name to captured revision marker.
	pub revisions: BTreeMap<String, u64>,
	pub compression: bool,
	pub encryption: bool,
	/// Source bucket and prefix the object-storage parts live in.
	pub source_bucket: Option<String>,
	pub source_path: Option<String>,
}

/// The backup document, stored as `backup_struct.json` alongside the data.
///
/// Written in at most two whole-document replaces: a `creating` stub with the schema section,
/// then the final flip with the part catalog and terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMeta {
	pub name: String,
	pub version: String,
	pub state: BackupState,
	#[serde(with = "document_time")]
	pub start_time: DateTime<FixedOffset>,
	#[serde(default, with = "document_time_opt")]
	pub end_time: Option<DateTime<FixedOffset>>,
	pub hostname: String,
	pub ch_version: String,
	pub tool_version: String,
	#[serde(default)]
	pub labels: BTreeMap<String, String>,
	#[serde(default)]
	pub schema_only: bool,
	#[serde(default)]
	pub encryption_enabled: bool,
	#[serde(default)]
	pub compression_enabled: bool,
	pub sources: BTreeSet<SourceKind>,
	#[serde(default)]
	pub fail_reason: Option<String>,
	#[serde(default)]
	pub databases: BTreeMap<String, DatabaseMeta>,
	/// Uploaded access-control payload files.
	#[serde(default)]
	pub access: Vec<String>,
	#[serde(default)]
	pub udf: Vec<String>,
	#[serde(default)]
	pub named_collections: Vec<String>,
	#[serde(default)]
	pub cloud_storage: Option<CloudStorageMeta>,
}

impl BackupMeta {
	pub fn new(
		name: impl Into<String>,
		hostname: impl Into<String>,
		ch_version: impl Into<String>,
		sources: BTreeSet<SourceKind>,
	) -> Self {
		Self {
			name: name.into(),
			version: DOCUMENT_VERSION.into(),
			state: BackupState::Creating,
			start_time: Local::now().fixed_offset(),
			end_time: None,
			hostname: hostname.into(),
			ch_version: ch_version.into(),
			tool_version: env!("CARGO_PKG_VERSION").into(),
			labels: BTreeMap::new(),
			schema_only: false,
			encryption_enabled: false,
			compression_enabled: false,
			sources,
			fail_reason: None,
			databases: BTreeMap::new(),
			access: Vec::new(),
			udf: Vec::new(),
			named_collections: Vec::new(),
			cloud_storage: None,
		}
	}

	/// Record the first failure; later ones are logged by callers but never overwrite it.
	pub fn fail(&mut self, reason: impl Into<String>) {
		self.state = BackupState::Failed;
		if self.fail_reason.is_none() {
			self.fail_reason = Some(reason.into());
		}
		self.end_time = Some(Local::now().fixed_offset());
	}

	pub fn finalize(&mut self) {
		self.state = BackupState::Created;
		self.end_time = Some(Local::now().fixed_offset());
	}

	/// Append a part to the catalog. `(database, table, part name)` is unique within a backup.
	pub fn add_part(&mut self, part: PartMeta) -> Result<()> {
		let Some(db) = self.databases.get_mut(&part.database) else {
			bail!(
				"part {} belongs to database {} which is not in this backup",
				part.name,
				part.database
			);
		};
		let Some(table) = db.tables.get_mut(&part.table) else {
			bail!(
				"part {} belongs to table {}.{} which is not in this backup",
				part.name,
				part.database,
				part.table
			);
		};
		if table.parts.contains_key(&part.name) {
			bail!(
				"duplicate part {} for table {}.{}",
				part.name,
				part.database,
				part.table
			);
		}
		table.parts.insert(part.name.clone(), part);
		Ok(())
	}

	pub fn find_part(&self, database: &str, table: &str, part: &str) -> Option<&PartMeta> {
		self.databases
			.get(database)
			.and_then(|db| db.tables.get(table))
			.and_then(|t| t.parts.get(part))
	}

	pub fn iter_parts(&self) -> impl Iterator<Item = &PartMeta> {
		self.databases
			.values()
			.flat_map(|db| db.tables.values())
			.flat_map(|table| table.parts.values())
	}

	/// Parts whose artifact this backup owns (freshly uploaded, not linked).
	pub fn data_count(&self) -> usize {
		self.iter_parts().filter(|p| p.link.is_none()).count()
	}

	/// Parts deduplicated against another backup.
	pub fn link_count(&self) -> usize {
		self.iter_parts().filter(|p| p.link.is_some()).count()
	}

	/// Whether this backup may contribute entries to a dedup index.
	///
	/// `creating` and `failed` backups still amortize the next run; `deleting` and
	/// `partially_deleted` are skipped because their artifacts are going away.
	pub fn usable_for_dedup(&self) -> bool {
		!matches!(
			self.state,
			BackupState::Deleting | BackupState::PartiallyDeleted
		)
	}
}

/// Expand a requested backup name, or generate the timestamp default.
///
/// A literal `{uuid}` token expands to a freshly generated unique id.
pub fn resolve_name(requested: Option<&str>, now: DateTime<Utc>) -> String {
	match requested {
		None => now.format(NAME_FORMAT).to_string(),
		Some(name) => name.replace("{uuid}", &uuid::Uuid::new_v4().to_string()),
	}
}

mod document_time {
	use super::*;

	pub fn serialize<S: Serializer>(
		time: &DateTime<FixedOffset>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&time.format(TIME_FORMAT).to_string())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<DateTime<FixedOffset>, D::Error> {
		let text = String::deserialize(deserializer)?;
		DateTime::parse_from_str(&text, TIME_FORMAT).map_err(serde::de::Error::custom)
	}
}

mod document_time_opt {
	use super::*;

	pub fn serialize<S: Serializer>(
		time: &Option<DateTime<FixedOffset>>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match time {
			Some(time) => document_time::serialize(time, serializer),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<DateTime<FixedOffset>>, D::Error> {
		let text = Option::<String>::deserialize(deserializer)?;
		text.map(|text| {
			DateTime::parse_from_str(&text, TIME_FORMAT).map_err(serde::de::Error::custom)
		})
		.transpose()
	}
}

/// RFC-3339 instant for contexts outside the document (listings, logs).
pub fn rfc3339(time: &DateTime<FixedOffset>) -> String {
	time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn meta_with_table() -> BackupMeta {
		let mut meta = BackupMeta::new("b1", "host", "24.3", SourceKind::all());
		meta.databases.insert(
			"db".into(),
			DatabaseMeta {
				name: "db".into(),
				engine: Some("Atomic".into()),
				uuid: None,
				metadata_sql: "CREATE DATABASE db ENGINE = Atomic".into(),
				tables: BTreeMap::from([(
					"t".into(),
					TableMeta::new("t", "CREATE TABLE db.t (x Int32) ENGINE = MergeTree ORDER BY x"),
				)]),
			},
		);
		meta
	}

	fn part(name: &str, link: Option<PartLink>) -> PartMeta {
		PartMeta {
			database: "db".into(),
			table: "t".into(),
			name: name.into(),
			disk_name: "default".into(),
			storage_class: StorageClass::Local,
			checksum: "b3:00".into(),
			size: 10,
			raw_size: 20,
			files: vec![],
			link,
			tarball: true,
			disk_type: None,
		}
	}

	#[test]
	fn unknown_state_collapses_to_failed() {
		let state: BackupState = serde_json::from_str("\"paused_for_tea\"").expect("parse");
		assert_eq!(state, BackupState::Failed);
		let state: BackupState = serde_json::from_str("\"partially_deleted\"").expect("parse");
		assert_eq!(state, BackupState::PartiallyDeleted);
	}

	#[test]
	fn document_roundtrips() {
		let mut meta = meta_with_table();
		meta.add_part(part("0_1_1_0", None)).expect("add");
		meta.finalize();

		let text = serde_json::to_string_pretty(&meta).expect("serialize");
		let back: BackupMeta = serde_json::from_str(&text).expect("deserialize");
		assert_eq!(back.state, BackupState::Created);
		assert_eq!(back.data_count(), 1);
		assert_eq!(back.link_count(), 0);
		// the document format has second precision
		assert_eq!(
			back.start_time.format(TIME_FORMAT).to_string(),
			meta.start_time.format(TIME_FORMAT).to_string()
		);
	}

	#[test]
	fn part_names_are_unique_per_table() {
		let mut meta = meta_with_table();
		meta.add_part(part("0_1_1_0", None)).expect("add");
		assert!(meta.add_part(part("0_1_1_0", None)).is_err());
	}

	#[test]
	fn counts_split_links_from_data() {
		let mut meta = meta_with_table();
		meta.add_part(part("0_1_1_0", None)).expect("add");
		meta.add_part(part(
			"0_2_2_0",
			Some(PartLink {
				backup: "b0".into(),
				database: "db".into(),
				table: "t".into(),
			}),
		))
		.expect("add");
		assert_eq!(meta.data_count(), 1);
		assert_eq!(meta.link_count(), 1);
	}

	#[test]
	fn engine_is_derived_when_field_missing() {
		let text = r#"{
			"name": "t",
			"create_statement": "CREATE TABLE db.t (x Int32) ENGINE = ReplacingMergeTree ORDER BY x"
		}"#;
		let table: TableMeta = serde_json::from_str(text).expect("parse");
		assert_eq!(table.engine(), Some("ReplacingMergeTree"));
		assert!(table.is_merge_tree());
	}

	#[test]
	fn dedup_usability_follows_state() {
		let mut meta = meta_with_table();
		assert!(meta.usable_for_dedup()); // creating
		meta.finalize();
		assert!(meta.usable_for_dedup());
		meta.state = BackupState::Deleting;
		assert!(!meta.usable_for_dedup());
		meta.state = BackupState::PartiallyDeleted;
		assert!(!meta.usable_for_dedup());
		meta.state = BackupState::Failed;
		assert!(meta.usable_for_dedup());
	}

	#[test]
	fn name_resolution() {
		let now = Utc::now();
		let generated = resolve_name(None, now);
		assert_eq!(generated, now.format(NAME_FORMAT).to_string());

		let fixed = resolve_name(Some("nightly"), now);
		assert_eq!(fixed, "nightly");

		let a = resolve_name(Some("run-{uuid}"), now);
		let b = resolve_name(Some("run-{uuid}"), now);
		assert!(a.starts_with("run-"));
		assert_ne!(a, b);
	}
}
