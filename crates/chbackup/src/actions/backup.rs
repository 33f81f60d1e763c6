use std::collections::BTreeSet;

use clap::Parser;
use miette::Result;
use tracing::{info, instrument};

use crate::{
	actions::Context,
	engine::{TableFilter, parse_label},
	lifecycle::{self, BackupOptions},
	metadata::SourceKind,
};

/// Create a backup of the local ClickHouse node.
///
/// Snapshots table data via FREEZE, packs each part into a deterministic archive, and
/// uploads it to object storage with part-level deduplication against recent backups. The
/// backup document lands next to the data, so any node with the same configuration can list
/// and restore it.
///
/// Without any of '--data', '--schema', '--access', '--udf', '--named-collections', all
/// sources are included.
#[derive(Debug, Clone, Parser)]
pub struct BackupArgs {
	/// Name for the backup.
	///
	/// Defaults to a UTC timestamp like '20260801T031500'. A literal '{uuid}' token in the
	/// name expands to a freshly generated unique id.
	#[arg(long, value_name = "NAME")]
	pub name: Option<String>,

	/// Only back up these databases.
	#[arg(long, value_name = "DB", value_delimiter = ',')]
	pub databases: Vec<String>,

	/// Only back up these tables, as 'db.table'.
	#[arg(long, value_name = "TABLE", value_delimiter = ',')]
	pub tables: Vec<String>,

	/// Back up schemas only, no data.
	#[arg(long)]
	pub schema_only: bool,

	/// Include access control objects.
	#[arg(long)]
	pub access: bool,

	/// Include user defined functions.
	#[arg(long)]
	pub udf: bool,

	/// Include named collections.
	#[arg(long)]
	pub named_collections: bool,

	/// Include database and table schemas.
	#[arg(long)]
	pub schema: bool,

	/// Include table data.
	#[arg(long)]
	pub data: bool,

	/// Create the backup even if the last one is within the configured min interval.
	#[arg(long)]
	pub force: bool,

	/// Attach a label to the backup, as 'key=value'. May be repeated.
	///
	/// Labels from the configuration are applied first and can be overridden here.
	#[arg(long, value_name = "KEY=VALUE")]
	pub label: Vec<String>,
}

#[instrument(skip(ctx), level = "debug")]
pub async fn run(ctx: Context<BackupArgs>) -> Result<()> {
	let args = &ctx.args_top;
	let engine = ctx.engine().await?;

	let labels = args
		.label
		.iter()
		.map(|label| parse_label(label))
		.collect::<Result<Vec<_>>>()?;

	let options = BackupOptions {
		name: args.name.clone(),
		filter: TableFilter::from_args(&args.databases, &args.tables)?,
		schema_only: args.schema_only,
		sources: selected_sources(args),
		force: args.force,
		labels,
	};

	match lifecycle::create(&engine, options).await? {
		Some(name) => println!("{name}"),
		None => info!("skipped: most recent backup is within min_interval"),
	}
	Ok(())
}

fn selected_sources(args: &BackupArgs) -> BTreeSet<SourceKind> {
	let mut sources = BTreeSet::new();
	if args.data {
		sources.insert(SourceKind::Data);
		sources.insert(SourceKind::Schema); // data is unrestorable without schemas
	}
	if args.schema {
		sources.insert(SourceKind::Schema);
	}
	if args.access {
		sources.insert(SourceKind::Access);
	}
	if args.udf {
		sources.insert(SourceKind::Udf);
	}
	if args.named_collections {
		sources.insert(SourceKind::NamedCollections);
	}
	if sources.is_empty() {
		return SourceKind::all();
	}
	sources
}

#[cfg(test)]
mod tests {
	use super::*;

	fn args(flags: &[&str]) -> BackupArgs {
		let mut argv = vec!["backup"];
		argv.extend(flags);
		BackupArgs::parse_from(argv)
	}

	#[test]
	fn default_is_all_sources() {
		assert_eq!(selected_sources(&args(&[])), SourceKind::all());
	}

	#[test]
	fn data_implies_schema() {
		let sources = selected_sources(&args(&["--data"]));
		assert!(sources.contains(&SourceKind::Data));
		assert!(sources.contains(&SourceKind::Schema));
		assert!(!sources.contains(&SourceKind::Access));
	}

	#[test]
	fn explicit_sources_are_exact() {
		let sources = selected_sources(&args(&["--access", "--udf"]));
		assert_eq!(
			sources,
			BTreeSet::from([SourceKind::Access, SourceKind::Udf])
		);
	}
}
