use std::path::PathBuf;

use clap::{Parser, ValueHint};
use miette::Result;
use tracing::instrument;

use crate::{actions::Context, restore::cloud};

/// Fetch the object-storage (cloud disk) metadata envelope of a backup.
///
/// The envelope records the captured disk revision and the inventory of objects the frozen
/// parts referenced; support tooling uses it to audit or repair cloud restores.
#[derive(Debug, Clone, Parser)]
pub struct GetCloudStorageMetadataArgs {
	/// Backup to read: a name, or 'LAST' for the most recent created backup.
	#[arg(value_name = "BACKUP")]
	pub backup: String,

	/// Which disk's envelope to fetch.
	#[arg(long, value_name = "DISK")]
	pub disk: String,

	/// Where to write the envelope.
	#[arg(long, value_hint = ValueHint::FilePath, value_name = "PATH")]
	pub local_path: Option<PathBuf>,
}

#[instrument(skip(ctx), level = "debug")]
pub async fn run(ctx: Context<GetCloudStorageMetadataArgs>) -> Result<()> {
	let args = &ctx.args_top;
	let engine = ctx.engine().await?;
	let meta = engine.pipeline.resolve_backup(&args.backup).await?;

	let local_path = args
		.local_path
		.clone()
		.unwrap_or_else(|| PathBuf::from(format!("{}-{}.envelope.json", meta.name, args.disk)));
	let envelope = cloud::fetch_envelope_to_file(&engine, &meta.name, &args.disk, &local_path).await?;
	println!(
		"disk {} revision {} with {} objects -> {}",
		envelope.disk,
		envelope.revision,
		envelope.objects.len(),
		local_path.display()
	);
	Ok(())
}
