use clap::{ArgAction, Parser};
use miette::Result;
use tracing::{instrument, warn};

use crate::{
	actions::Context,
	engine::TableFilter,
	restore::{self, CleanZookeeperMode, RestoreOptions},
};

/// Restore a backup onto the local ClickHouse node.
///
/// Recreates databases and tables from the backup's schema section, then downloads and
/// attaches data parts. The run is resumable: progress is tracked in a local restore
/// context, and re-running the same restore retries only what isn't attached yet.
#[derive(Debug, Clone, Parser)]
pub struct RestoreArgs {
	/// Backup to restore: a name, or 'LAST' for the most recent created backup.
	#[arg(value_name = "BACKUP")]
	pub backup: String,

	/// Only restore these databases.
	#[arg(long, value_name = "DB", value_delimiter = ',')]
	pub databases: Vec<String>,

	/// Only restore these tables, as 'db.table'.
	#[arg(long, value_name = "TABLE", value_delimiter = ',')]
	pub tables: Vec<String>,

	/// Restore schemas only, no data.
	#[arg(long)]
	pub schema_only: bool,

	/// Rewrite the replica token of Replicated engines.
	///
	/// Usually set to '{replica}' so the destination node's own macro applies.
	#[arg(long, value_name = "NAME")]
	pub override_replica_name: Option<String>,

	/// Downgrade Replicated engines to their plain equivalents.
	#[arg(long)]
	pub force_non_replicated: bool,

	/// Clear stale coordination entries for Replicated engines before recreating them.
	#[arg(long, value_enum, value_name = "MODE")]
	pub clean_zookeeper_mode: Option<CleanZookeeperMode>,

	/// Skip parts that fail to attach instead of aborting.
	#[arg(long)]
	pub keep_going: bool,

	/// Bucket the object-storage (cloud) parts were written from.
	#[arg(long, value_name = "BUCKET")]
	pub cloud_storage_source_bucket: Option<String>,

	/// Path prefix within the source bucket.
	#[arg(long, value_name = "PATH")]
	pub cloud_storage_source_path: Option<String>,

	/// Restore cloud parts from the bucket's current state instead of the captured revision.
	#[arg(long)]
	pub cloud_storage_latest: bool,

	/// Skip copying cloud objects when source and destination coincide; only rebuild the
	/// disk metadata.
	#[arg(long)]
	pub use_inplace_cloud_restore: bool,

	/// Recreate tables inside Replicated databases, rather than letting database
	/// replication sync them.
	#[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
	pub restore_tables_in_replicated_database: bool,
}

#[instrument(skip(ctx), level = "debug")]
pub async fn run(ctx: Context<RestoreArgs>) -> Result<()> {
	let args = &ctx.args_top;
	let engine = ctx.engine().await?;

	let mut options = RestoreOptions::new(&args.backup);
	options.filter = TableFilter::from_args(&args.databases, &args.tables)?;
	options.schema_only = args.schema_only;
	options.override_replica_name = args.override_replica_name.clone();
	options.force_non_replicated = args.force_non_replicated;
	options.clean_zookeeper_mode = args.clean_zookeeper_mode;
	options.keep_going = args.keep_going;
	options.restore_tables_in_replicated_database = args.restore_tables_in_replicated_database;
	options.cloud_source_bucket = args.cloud_storage_source_bucket.clone();
	options.cloud_source_path = args.cloud_storage_source_path.clone();
	options.cloud_latest = args.cloud_storage_latest;
	options.use_inplace_cloud_restore = args.use_inplace_cloud_restore;

	let report = restore::restore(&engine, options).await?;
	println!(
		"restored {} databases, {} tables, {} parts ({} skipped)",
		report.databases, report.tables, report.attached, report.skipped
	);
	if report.needs_restart {
		warn!("restart clickhouse-server to apply restored access control and named collections");
	}
	Ok(())
}
