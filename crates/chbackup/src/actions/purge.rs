use clap::Parser;
use miette::Result;
use tracing::instrument;

use crate::{actions::Context, lifecycle};

/// Apply the retention policy.
///
/// The newest 'backup.retain_count' created backups are always protected; others are
/// removed only once they are also older than 'backup.retain_time'. Leftover
/// partially-deleted backups are collected as soon as nothing references them.
#[derive(Debug, Clone, Parser)]
pub struct PurgeArgs {}

#[instrument(skip(ctx), level = "debug")]
pub async fn run(ctx: Context<PurgeArgs>) -> Result<()> {
	let engine = ctx.engine().await?;
	let report = lifecycle::purge(&engine).await?;
	for name in &report.removed {
		println!("deleted {name}");
	}
	for name in &report.partially_deleted {
		println!("partially deleted {name}");
	}
	if report.removed.is_empty() && report.partially_deleted.is_empty() {
		println!("nothing to purge");
	}
	Ok(())
}
