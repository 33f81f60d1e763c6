use std::collections::BTreeMap;

use async_trait::async_trait;
use miette::{IntoDiagnostic as _, Result, miette};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, trace};

use crate::config::ClickHouseConfig;

use super::{
	ClickHouse, DatabaseInfo, DiskInfo, SYSTEM_DATABASES, TableInfo, quote_ident, quote_str,
};

/// ClickHouse driven over its HTTP interface.
#[derive(Debug, Clone)]
pub struct HttpClickHouse {
	client: reqwest::Client,
	url: String,
	user: Option<String>,
	password: Option<String>,
}

impl HttpClickHouse {
	pub fn new(config: &ClickHouseConfig) -> Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(config.timeout)
			.build()
			.into_diagnostic()?;
		Ok(Self {
			client,
			url: config.url.clone(),
			user: config.user.clone(),
			password: config.password.clone(),
		})
	}

	#[instrument(skip(self), level = "debug")]
	async fn raw_query(&self, sql: &str) -> Result<String> {
		trace!(%sql, "sending query");
		let mut request = self.client.post(&self.url).body(sql.to_string());
		if let Some(user) = &self.user {
			request = request.header("X-ClickHouse-User", user);
		}
		if let Some(password) = &self.password {
			request = request.header("X-ClickHouse-Key", password);
		}

		let response = request.send().await.into_diagnostic()?;
		let status = response.status();
		let body = response.text().await.into_diagnostic()?;
		if !status.is_success() {
			return Err(miette!("clickhouse returned {status}: {}", body.trim()));
		}
		Ok(body)
	}

	async fn query_rows<T: DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
		let body = self.raw_query(&format!("{sql} FORMAT JSONEachRow")).await?;
		body.lines()
			.filter(|line| !line.trim().is_empty())
			.map(|line| serde_json::from_str(line).into_diagnostic())
			.collect()
	}

	async fn query_scalar(&self, sql: &str) -> Result<String> {
		let body = self.raw_query(sql).await?;
		Ok(body.trim().to_string())
	}
}

#[async_trait]
impl ClickHouse for HttpClickHouse {
	async fn version(&self) -> Result<String> {
		self.query_scalar("SELECT version()").await
	}

	async fn list_databases(&self) -> Result<Vec<DatabaseInfo>> {
		let excluded = SYSTEM_DATABASES
			.iter()
			.map(|name| quote_str(name))
			.collect::<Vec<_>>()
			.join(", ");
		self.query_rows(&format!(
			"SELECT name, engine, toString(uuid) AS uuid, \
			 metadata_path, engine_full, \
			 concat('CREATE DATABASE ', name, ' ENGINE = ', engine_full) AS create_statement \
			 FROM system.databases WHERE name NOT IN ({excluded})"
		))
		.await
	}

	async fn list_tables(&self, database: &str) -> Result<Vec<TableInfo>> {
		self.query_rows(&format!(
			"SELECT database, name, engine, toString(uuid) AS uuid, \
			 create_table_query AS create_statement, data_paths \
			 FROM system.tables WHERE database = {}",
			quote_str(database)
		))
		.await
	}

	async fn list_disks(&self) -> Result<Vec<DiskInfo>> {
		self.query_rows("SELECT name, path, type FROM system.disks")
			.await
	}

	async fn macros(&self) -> Result<BTreeMap<String, String>> {
		#[derive(serde::Deserialize)]
		struct Row {
			macro_name: String,
			substitution: String,
		}
		let rows: Vec<Row> = self
			.query_rows("SELECT macro AS macro_name, substitution FROM system.macros")
			.await?;
		Ok(rows
			.into_iter()
			.map(|row| (row.macro_name, row.substitution))
			.collect())
	}

	async fn freeze_table(
		&self,
		database: &str,
		table: &str,
		name: &str,
		partitions: &[String],
	) -> Result<()> {
		let target = format!("{}.{}", quote_ident(database), quote_ident(table));
		if partitions.is_empty() {
			self.raw_query(&format!(
				"ALTER TABLE {target} FREEZE WITH NAME {}",
				quote_str(name)
			))
			.await?;
		} else {
			for partition in partitions {
				self.raw_query(&format!(
					"ALTER TABLE {target} FREEZE PARTITION {partition} WITH NAME {}",
					quote_str(name)
				))
				.await?;
			}
		}
		Ok(())
	}

	async fn can_system_unfreeze(&self) -> Result<bool> {
		let version = self.version().await?;
		Ok(version_at_least(&version, 22, 6))
	}

	async fn system_unfreeze(&self, name: &str) -> Result<()> {
		self.raw_query(&format!("SYSTEM UNFREEZE WITH NAME {}", quote_str(name)))
			.await?;
		Ok(())
	}

	async fn attach_part(&self, database: &str, table: &str, part: &str) -> Result<()> {
		debug!(database, table, part, "attaching part");
		self.raw_query(&format!(
			"ALTER TABLE {}.{} ATTACH PART {}",
			quote_ident(database),
			quote_ident(table),
			quote_str(part)
		))
		.await?;
		Ok(())
	}

	async fn show_create_table(&self, database: &str, table: &str) -> Result<Option<String>> {
		#[derive(serde::Deserialize)]
		struct Row {
			statement: Option<String>,
		}
		let rows: Vec<Row> = self
			.query_rows(&format!(
				"SELECT create_table_query AS statement FROM system.tables \
				 WHERE database = {} AND name = {}",
				quote_str(database),
				quote_str(table)
			))
			.await?;
		Ok(rows.into_iter().next().and_then(|row| row.statement))
	}

	async fn show_create_database(&self, database: &str) -> Result<Option<String>> {
		#[derive(serde::Deserialize)]
		struct Row {
			engine_full: String,
			name: String,
		}
		let rows: Vec<Row> = self
			.query_rows(&format!(
				"SELECT name, engine_full FROM system.databases WHERE name = {}",
				quote_str(database)
			))
			.await?;
		Ok(rows.into_iter().next().map(|row| {
			format!(
				"CREATE DATABASE {} ENGINE = {}",
				quote_ident(&row.name),
				row.engine_full
			)
		}))
	}

	async fn execute(&self, sql: &str) -> Result<()> {
		self.raw_query(sql).await?;
		Ok(())
	}
}

/// Parse `major.minor[...]` and compare against a floor.
fn version_at_least(version: &str, major: u32, minor: u32) -> bool {
	let mut parts = version.split('.');
	let Some(have_major) = parts.next().and_then(|p| p.parse::<u32>().ok()) else {
		return false;
	};
	let have_minor = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);
	(have_major, have_minor) >= (major, minor)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn version_comparison() {
		assert!(version_at_least("22.6.1.1985", 22, 6));
		assert!(version_at_least("23.1", 22, 6));
		assert!(!version_at_least("22.3.2.2", 22, 6));
		assert!(!version_at_least("garbage", 22, 6));
	}
}
