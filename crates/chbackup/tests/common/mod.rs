//! Shared test bed: an in-memory object store plus a fake ClickHouse that keeps its
//! "server state" in a tempdir-backed disk, faithfully enough to exercise freeze, attach,
//! and schema recreation end to end.

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use async_trait::async_trait;
use miette::{IntoDiagnostic as _, Result, miette};
use tokio::sync::Mutex;

use chbackup::{
	clickhouse::{ClickHouse, DatabaseInfo, DiskInfo, TableInfo},
	config::Config,
	coord::InProcessCoordination,
	engine::Engine,
	storage::memory::MemoryStorage,
};

#[derive(Debug, Clone, Default)]
pub struct FakeTable {
	pub engine: String,
	pub create: String,
	/// part name -> file name -> contents
	pub parts: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

#[derive(Debug, Default)]
struct FakeState {
	databases: BTreeMap<String, String>,
	tables: BTreeMap<(String, String), FakeTable>,
}

/// A scripted ClickHouse node over a tempdir "disk".
pub struct FakeClickHouse {
	disk_root: PathBuf,
	state: Mutex<FakeState>,
	macros: BTreeMap<String, String>,
}

impl FakeClickHouse {
	pub fn new(disk_root: &Path) -> Self {
		Self {
			disk_root: disk_root.to_path_buf(),
			state: Mutex::default(),
			macros: BTreeMap::from([("replica".to_string(), "clickhouse02".to_string())]),
		}
	}

	pub async fn create_database(&self, name: &str) {
		self.state.lock().await.databases.insert(
			name.to_string(),
			format!("CREATE DATABASE {name} ENGINE = Atomic"),
		);
	}

	pub async fn create_table(&self, database: &str, table: &str, engine: &str, create: &str) {
		self.state.lock().await.tables.insert(
			(database.to_string(), table.to_string()),
			FakeTable {
				engine: engine.to_string(),
				create: create.to_string(),
				parts: BTreeMap::new(),
			},
		);
	}

	pub async fn insert_part(
		&self,
		database: &str,
		table: &str,
		part: &str,
		files: &[(&str, &[u8])],
	) {
		let mut state = self.state.lock().await;
		let entry = state
			.tables
			.get_mut(&(database.to_string(), table.to_string()))
			.expect("table must exist before inserting parts");
		entry.parts.insert(
			part.to_string(),
			files
				.iter()
				.map(|(name, data)| (name.to_string(), data.to_vec()))
				.collect(),
		);
	}

	pub async fn table_parts(
		&self,
		database: &str,
		table: &str,
	) -> BTreeMap<String, BTreeMap<String, Vec<u8>>> {
		self.state
			.lock()
			.await
			.tables
			.get(&(database.to_string(), table.to_string()))
			.map(|t| t.parts.clone())
			.unwrap_or_default()
	}

	pub async fn has_table(&self, database: &str, table: &str) -> bool {
		self.state
			.lock()
			.await
			.tables
			.contains_key(&(database.to_string(), table.to_string()))
	}

	pub async fn table_create_statement(&self, database: &str, table: &str) -> Option<String> {
		self.state
			.lock()
			.await
			.tables
			.get(&(database.to_string(), table.to_string()))
			.map(|t| t.create.clone())
	}

	fn strip_ident(raw: &str) -> String {
		raw.trim().trim_matches('`').to_string()
	}

	/// `db.t` or `` `db`.`t` `` from the token after CREATE/DROP TABLE.
	fn parse_qualified(token: &str) -> Option<(String, String)> {
		let token = token.trim_end_matches('(');
		let (db, table) = token.split_once('.')?;
		Some((Self::strip_ident(db), Self::strip_ident(table)))
	}
}

#[async_trait]
impl ClickHouse for FakeClickHouse {
	async fn version(&self) -> Result<String> {
		Ok("24.3.2.23".to_string())
	}

	async fn list_databases(&self) -> Result<Vec<DatabaseInfo>> {
		Ok(self
			.state
			.lock()
			.await
			.databases
			.iter()
			.map(|(name, create)| DatabaseInfo {
				name: name.clone(),
				engine: "Atomic".to_string(),
				uuid: None,
				create_statement: create.clone(),
			})
			.collect())
	}

	async fn list_tables(&self, database: &str) -> Result<Vec<TableInfo>> {
		Ok(self
			.state
			.lock()
			.await
			.tables
			.iter()
			.filter(|((db, _), _)| db == database)
			.map(|((db, name), table)| TableInfo {
				database: db.clone(),
				name: name.clone(),
				engine: table.engine.clone(),
				uuid: None,
				create_statement: table.create.clone(),
				data_paths: vec![self.disk_root.join("data").join(db).join(name)],
			})
			.collect())
	}

	async fn list_disks(&self) -> Result<Vec<DiskInfo>> {
		Ok(vec![DiskInfo {
			name: "default".to_string(),
			path: self.disk_root.clone(),
			disk_type: "local".to_string(),
		}])
	}

	async fn macros(&self) -> Result<BTreeMap<String, String>> {
		Ok(self.macros.clone())
	}

	async fn freeze_table(
		&self,
		database: &str,
		table: &str,
		name: &str,
		_partitions: &[String],
	) -> Result<()> {
		let state = self.state.lock().await;
		let entry = state
			.tables
			.get(&(database.to_string(), table.to_string()))
			.ok_or_else(|| miette!("no such table: {database}.{table}"))?;

		let shadow = self
			.disk_root
			.join("shadow")
			.join(name)
			.join("data")
			.join(database)
			.join(table);
		for (part, files) in &entry.parts {
			let part_dir = shadow.join(part);
			std::fs::create_dir_all(&part_dir).into_diagnostic()?;
			for (file, data) in files {
				std::fs::write(part_dir.join(file), data).into_diagnostic()?;
			}
		}
		Ok(())
	}

	async fn can_system_unfreeze(&self) -> Result<bool> {
		// forces the tool down the direct shadow-removal path
		Ok(false)
	}

	async fn system_unfreeze(&self, _name: &str) -> Result<()> {
		Ok(())
	}

	async fn attach_part(&self, database: &str, table: &str, part: &str) -> Result<()> {
		let detached = self
			.disk_root
			.join("data")
			.join(database)
			.join(table)
			.join("detached")
			.join(part);
		if !detached.is_dir() {
			return Err(miette!("no detached part at {detached:?}"));
		}

		let mut files = BTreeMap::new();
		for entry in std::fs::read_dir(&detached).into_diagnostic()? {
			let entry = entry.into_diagnostic()?;
			files.insert(
				entry.file_name().to_string_lossy().into_owned(),
				std::fs::read(entry.path()).into_diagnostic()?,
			);
		}

		let mut state = self.state.lock().await;
		let table_entry = state
			.tables
			.get_mut(&(database.to_string(), table.to_string()))
			.ok_or_else(|| miette!("no such table: {database}.{table}"))?;
		table_entry.parts.insert(part.to_string(), files);

		std::fs::remove_dir_all(&detached).into_diagnostic()?;
		Ok(())
	}

	async fn show_create_table(&self, database: &str, table: &str) -> Result<Option<String>> {
		Ok(self.table_create_statement(database, table).await)
	}

	async fn show_create_database(&self, database: &str) -> Result<Option<String>> {
		Ok(self.state.lock().await.databases.get(database).cloned())
	}

	async fn execute(&self, sql: &str) -> Result<()> {
		let trimmed = sql.trim();
		let upper = trimmed.to_uppercase();

		if upper.starts_with("CREATE DATABASE") {
			let name = trimmed
				.split_whitespace()
				.nth(2)
				.map(Self::strip_ident)
				.ok_or_else(|| miette!("unparseable: {trimmed}"))?;
			self.state
				.lock()
				.await
				.databases
				.insert(name, trimmed.to_string());
			return Ok(());
		}

		if upper.starts_with("CREATE TABLE") || upper.starts_with("CREATE MATERIALIZED VIEW") {
			let skip = if upper.starts_with("CREATE TABLE") { 2 } else { 3 };
			let token = trimmed
				.split_whitespace()
				.nth(skip)
				.ok_or_else(|| miette!("unparseable: {trimmed}"))?;
			let (db, table) = Self::parse_qualified(token)
				.ok_or_else(|| miette!("expected db.table in: {trimmed}"))?;
			let engine = chbackup::clickhouse::schema::engine_of(trimmed)
				.unwrap_or("View")
				.to_string();
			self.state.lock().await.tables.insert(
				(db, table),
				FakeTable {
					engine,
					create: trimmed.to_string(),
					parts: BTreeMap::new(),
				},
			);
			return Ok(());
		}

		if upper.starts_with("DROP TABLE") {
			let token = trimmed
				.split_whitespace()
				.find(|token| token.contains('.'))
				.ok_or_else(|| miette!("expected db.table in: {trimmed}"))?;
			let (db, table) = Self::parse_qualified(token)
				.ok_or_else(|| miette!("expected db.table in: {trimmed}"))?;
			self.state.lock().await.tables.remove(&(db, table));
			return Ok(());
		}

		Err(miette!("fake clickhouse cannot execute: {trimmed}"))
	}
}

/// A complete wired engine over the fakes.
pub struct TestBed {
	pub dir: tempfile::TempDir,
	pub storage: Arc<MemoryStorage>,
	pub ch: Arc<FakeClickHouse>,
	pub coord: Arc<InProcessCoordination>,
	pub engine: Engine,
}

/// Build a test bed; pass the same storage to simulate a second node against the same
/// bucket.
pub fn testbed_with_storage(storage: Arc<MemoryStorage>) -> TestBed {
	let dir = tempfile::tempdir().expect("tempdir");
	let ch = Arc::new(FakeClickHouse::new(&dir.path().join("disk")));
	let coord = Arc::new(InProcessCoordination::new());

	let mut config = Config::default();
	config.backup.path_root = "root".into();
	config.backup.min_interval = Duration::ZERO;
	config.backup.restore_context_path = dir.path().join("restore_context.json");
	config.lock.flock_path = dir.path().join("op.lock");
	config.lock.zk_flock = true;
	config.clickhouse.access_path = dir.path().join("access");
	config.clickhouse.udf_path = dir.path().join("udf");
	config.clickhouse.named_collections_path = dir.path().join("named_collections");
	config.multiprocessing.freeze_threads = 2;
	config.multiprocessing.upload_threads = 2;

	let engine = Engine::assemble(
		config,
		storage.clone(),
		ch.clone(),
		Some(coord.clone()),
	);
	TestBed {
		dir,
		storage,
		ch,
		coord,
		engine,
	}
}

pub fn testbed() -> TestBed {
	testbed_with_storage(Arc::new(MemoryStorage::new()))
}

pub const CREATE_EVENTS: &str =
	"CREATE TABLE db.events (d Date, x Int32) ENGINE = MergeTree PARTITION BY d ORDER BY x";
pub const CREATE_METRICS: &str =
	"CREATE TABLE db.metrics (d Date, v Float64) ENGINE = MergeTree PARTITION BY d ORDER BY v";

/// One database with one two-part table, as in the basic scenario.
pub async fn seed_basic(bed: &TestBed) {
	bed.ch.create_database("db").await;
	bed.ch
		.create_table("db", "events", "MergeTree", CREATE_EVENTS)
		.await;
	bed.ch
		.insert_part(
			"db",
			"events",
			"20260701_1_1_0",
			&[("columns.txt", b"d, x"), ("data.bin", &[1_u8; 512])],
		)
		.await;
	bed.ch
		.insert_part(
			"db",
			"events",
			"20260702_2_2_0",
			&[("columns.txt", b"d, x"), ("data.bin", &[2_u8; 512])],
		)
		.await;
}

/// The second table added for the incremental scenario.
pub async fn seed_metrics(bed: &TestBed) {
	bed.ch
		.create_table("db", "metrics", "MergeTree", CREATE_METRICS)
		.await;
	for (part, fill) in [
		("20260701_1_1_0", 7_u8),
		("20260702_2_2_0", 8),
		("20260703_3_3_0", 9),
	] {
		bed.ch
			.insert_part(
				"db",
				"metrics",
				part,
				&[("columns.txt", b"d, v"), ("data.bin", &[fill; 256])],
			)
			.await;
	}
}
