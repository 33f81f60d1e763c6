use std::{collections::BTreeMap, path::PathBuf};

use async_trait::async_trait;
use miette::Result;
use serde::Deserialize;

pub use http::HttpClickHouse;

pub mod http;
pub mod schema;

/// Databases that belong to the server and are never backed up.
pub const SYSTEM_DATABASES: &[&str] = &[
	"system",
	"information_schema",
	"INFORMATION_SCHEMA",
	"_temporary_and_external_tables",
];

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseInfo {
	pub name: String,
	pub engine: String,
	#[serde(default)]
	pub uuid: Option<String>,
	pub create_statement: String,
}

impl DatabaseInfo {
	pub fn is_system(&self) -> bool {
		SYSTEM_DATABASES.contains(&self.name.as_str())
	}

	pub fn is_replicated(&self) -> bool {
		self.engine == "Replicated"
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableInfo {
	pub database: String,
	pub name: String,
	pub engine: String,
	#[serde(default)]
	pub uuid: Option<String>,
	pub create_statement: String,
	/// Data roots of the table, one per disk it spans.
	#[serde(default)]
	pub data_paths: Vec<PathBuf>,
}

impl TableInfo {
	pub fn is_merge_tree(&self) -> bool {
		self.engine.ends_with("MergeTree")
	}

	pub fn is_view(&self) -> bool {
		self.engine == "View" || self.engine == "MaterializedView" || self.engine == "LiveView"
	}

	pub fn is_dictionary(&self) -> bool {
		self.engine == "Dictionary"
	}

	pub fn is_external(&self) -> bool {
		schema::is_external_engine(&self.engine)
	}

	/// Tables with frozen local data to pack: MergeTree family, and not external.
	pub fn has_data_to_freeze(&self) -> bool {
		self.is_merge_tree() && !self.is_external()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskInfo {
	pub name: String,
	pub path: PathBuf,
	/// `local` or an object-storage type like `s3`.
	#[serde(rename = "type")]
	pub disk_type: String,
}

impl DiskInfo {
	pub fn is_object_storage(&self) -> bool {
		self.disk_type != "local"
	}
}

/// The surface of the ClickHouse node this tool drives.
///
/// Production uses the HTTP interface ([`HttpClickHouse`]); tests script it.
#[async_trait]
pub trait ClickHouse: Send + Sync {
	async fn version(&self) -> Result<String>;

	/// User databases only; system databases are filtered out.
	async fn list_databases(&self) -> Result<Vec<DatabaseInfo>>;

	async fn list_tables(&self, database: &str) -> Result<Vec<TableInfo>>;

	async fn list_disks(&self) -> Result<Vec<DiskInfo>>;

	/// The node's configured macro substitutions.
	async fn macros(&self) -> Result<BTreeMap<String, String>>;

	/// `ALTER TABLE .. FREEZE [PARTITION ..] WITH NAME <name>`.
	async fn freeze_table(
		&self,
		database: &str,
		table: &str,
		name: &str,
		partitions: &[String],
	) -> Result<()>;

	/// Whether the server supports `SYSTEM UNFREEZE WITH NAME`.
	async fn can_system_unfreeze(&self) -> Result<bool>;

	async fn system_unfreeze(&self, name: &str) -> Result<()>;

	async fn attach_part(&self, database: &str, table: &str, part: &str) -> Result<()>;

	/// Existing CREATE statement on the node, or `None` when the table is absent.
	async fn show_create_table(&self, database: &str, table: &str) -> Result<Option<String>>;

	async fn show_create_database(&self, database: &str) -> Result<Option<String>>;

	/// Arbitrary DDL (CREATE/DROP DATABASE/TABLE and friends).
	async fn execute(&self, sql: &str) -> Result<()>;
}

/// Quote an identifier for use in SQL.
pub fn quote_ident(name: &str) -> String {
	format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

/// Quote a string literal for use in SQL.
pub fn quote_str(value: &str) -> String {
	format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn quoting() {
		assert_eq!(quote_ident("plain"), "`plain`");
		assert_eq!(quote_ident("we`ird"), "`we\\`ird`");
		assert_eq!(quote_str("o'clock"), "'o\\'clock'");
	}

	#[test]
	fn table_classification() {
		let table = |engine: &str| TableInfo {
			database: "db".into(),
			name: "t".into(),
			engine: engine.into(),
			uuid: None,
			create_statement: String::new(),
			data_paths: vec![],
		};
		assert!(table("ReplacingMergeTree").has_data_to_freeze());
		assert!(table("ReplicatedMergeTree").has_data_to_freeze());
		assert!(!table("Kafka").has_data_to_freeze());
		assert!(!table("MaterializedView").has_data_to_freeze());
		assert!(table("MaterializedView").is_view());
		assert!(!table("Log").has_data_to_freeze());
	}
}
