use clap::Parser;
use miette::Result;
use tracing::instrument;

use crate::{
	actions::Context,
	metadata::{BackupState, rfc3339},
};

/// List backups, newest first.
#[derive(Debug, Clone, Parser)]
pub struct ListArgs {
	/// Include backups in every state, not just created ones.
	#[arg(long)]
	pub all: bool,

	/// Print the listing as JSON.
	#[arg(long)]
	pub json: bool,
}

#[instrument(skip(ctx), level = "debug")]
pub async fn run(ctx: Context<ListArgs>) -> Result<()> {
	let engine = ctx.engine().await?;
	let backups: Vec<_> = engine
		.pipeline
		.list_backups()
		.await?
		.into_iter()
		.filter(|meta| ctx.args_top.all || meta.state == BackupState::Created)
		.collect();

	if ctx.args_top.json {
		let listing: Vec<serde_json::Value> = backups
			.iter()
			.map(|meta| {
				serde_json::json!({
					"name": meta.name,
					"state": meta.state.as_str(),
					"start_time": rfc3339(&meta.start_time),
					"end_time": meta.end_time.as_ref().map(rfc3339),
					"data_count": meta.data_count(),
					"link_count": meta.link_count(),
					"schema_only": meta.schema_only,
				})
			})
			.collect();
		println!("{}", serde_json::to_string_pretty(&listing).expect("BUG: plain values"));
	} else {
		for meta in backups {
			println!(
				"{}\t{}\t{}\tdata={} links={}",
				meta.name,
				meta.state,
				rfc3339(&meta.start_time),
				meta.data_count(),
				meta.link_count(),
			);
		}
	}
	Ok(())
}
