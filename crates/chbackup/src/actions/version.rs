use clap::Parser;
use miette::Result;

use crate::actions::Context;

/// Print the tool version.
#[derive(Debug, Clone, Parser)]
pub struct VersionArgs {}

pub async fn run(_ctx: Context<VersionArgs>) -> Result<()> {
	println!("{}", env!("CARGO_PKG_VERSION"));
	Ok(())
}
