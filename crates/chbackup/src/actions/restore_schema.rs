use std::sync::Arc;

use clap::Parser;
use miette::Result;
use tracing::instrument;

use crate::{
	actions::Context,
	clickhouse::HttpClickHouse,
	engine::TableFilter,
	restore,
};

/// Copy database and table schemas from another ClickHouse host to this one.
///
/// Reads the source host's CREATE statements, applies the configured normalizations
/// (replica rewrite, engine downgrade), and recreates missing databases and tables here.
/// Stale coordination entries for this replica are cleared so the server re-syncs from its
/// peers on startup.
#[derive(Debug, Clone, Parser)]
pub struct RestoreSchemaArgs {
	/// HTTP interface of the source host, e.g. 'http://clickhouse01:8123'.
	#[arg(long, value_name = "HOST")]
	pub source: String,

	/// Only copy these databases.
	#[arg(long, value_name = "DB", value_delimiter = ',')]
	pub databases: Vec<String>,

	/// Only copy these tables, as 'db.table'.
	#[arg(long, value_name = "TABLE", value_delimiter = ',')]
	pub tables: Vec<String>,
}

#[instrument(skip(ctx), level = "debug")]
pub async fn run(ctx: Context<RestoreSchemaArgs>) -> Result<()> {
	let args = &ctx.args_top;
	let engine = ctx.engine().await?;

	let mut source_config = ctx.config.clickhouse.clone();
	source_config.url = args.source.clone();
	let source = Arc::new(HttpClickHouse::new(&source_config)?);

	let filter = TableFilter::from_args(&args.databases, &args.tables)?;
	let created = restore::restore_schema_from(&engine, source, &filter).await?;
	println!("created {created} tables from {}", args.source);
	Ok(())
}
