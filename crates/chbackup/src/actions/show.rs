use clap::Parser;
use miette::{IntoDiagnostic as _, Result};
use tracing::instrument;

use crate::actions::Context;

/// Print the full document of one backup.
#[derive(Debug, Clone, Parser)]
pub struct ShowArgs {
	/// Backup to show: a name, or 'LAST' for the most recent created backup.
	#[arg(value_name = "BACKUP")]
	pub backup: String,
}

#[instrument(skip(ctx), level = "debug")]
pub async fn run(ctx: Context<ShowArgs>) -> Result<()> {
	let engine = ctx.engine().await?;
	let meta = engine.pipeline.resolve_backup(&ctx.args_top.backup).await?;
	println!(
		"{}",
		serde_json::to_string_pretty(&meta).into_diagnostic()?
	);
	Ok(())
}
