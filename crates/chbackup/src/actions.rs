use clap::Subcommand;
use miette::Result;
use tracing::{debug, trace};

pub use context::Context;
pub mod context;

#[macro_export]
macro_rules! subcommands {
	(
		[$argtype:ty => $ctxcode:block]($ctxmethod:ident)
		$(
			$(#[$meta:meta])*
			$modname:ident => $enumname:ident($argname:ident)
		),+
	) => {
		$(
			$(#[$meta])*
			pub mod $modname;
		)*

		#[derive(Debug, Clone, Subcommand)]
		pub enum Action {
			$(
				$(#[$meta])*
				$enumname($modname::$argname),
			)*
		}

		pub async fn run(ctx: $argtype) -> Result<()> {
			let ctxfn = $ctxcode;
			match ctxfn(ctx)? {
				$(
					$(#[$meta])*
					(Action::$enumname(args), ctx) => $modname::run(ctx.$ctxmethod(args)).await,
				)*
			}
		}
	};
}
#[allow(unused_imports)]
pub(crate) use subcommands;

use crate::args::Args;

subcommands! {
	[Args => {|args: Args| -> Result<(Action, Context<()>)> {
		debug!(version=%env!("CARGO_PKG_VERSION"), "starting up");
		trace!(action=?args.action, "action");
		let config = crate::config::load_config(args.config.as_deref())?;
		Ok((args.action, Context::new(config)))
	}}](with_top)

	backup => Backup(BackupArgs),
	restore => Restore(RestoreArgs),
	restore_schema => RestoreSchema(RestoreSchemaArgs),
	list => List(ListArgs),
	show => Show(ShowArgs),
	delete => Delete(DeleteArgs),
	purge => Purge(PurgeArgs),
	get_cloud_storage_metadata => GetCloudStorageMetadata(GetCloudStorageMetadataArgs),
	version => Version(VersionArgs)
}
