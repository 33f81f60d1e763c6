use clap::Parser;
use miette::Result;
use tracing::instrument;

use crate::{actions::Context, lifecycle};

/// Delete a backup.
///
/// Artifacts still referenced by other backups are kept, and the backup document stays
/// behind in 'partially_deleted' state until those references go away (a later purge
/// collects it).
#[derive(Debug, Clone, Parser)]
pub struct DeleteArgs {
	/// Name of the backup to delete.
	#[arg(value_name = "BACKUP")]
	pub backup: String,
}

#[instrument(skip(ctx), level = "debug")]
pub async fn run(ctx: Context<DeleteArgs>) -> Result<()> {
	let engine = ctx.engine().await?;
	match lifecycle::delete(&engine, &ctx.args_top.backup).await? {
		lifecycle::DeleteResult::Removed => println!("deleted {}", ctx.args_top.backup),
		lifecycle::DeleteResult::PartiallyDeleted { retained_parts } => println!(
			"partially deleted {} ({retained_parts} shared parts retained)",
			ctx.args_top.backup
		),
	}
	Ok(())
}
