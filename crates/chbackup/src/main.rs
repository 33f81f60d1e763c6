use std::process::ExitCode;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> ExitCode {
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("BUG: runtime always builds")
		.block_on(async {
			let (args, _guard) = match chbackup::args() {
				Ok(parsed) => parsed,
				Err(report) => {
					eprintln!("{report:?}");
					return ExitCode::from(1);
				}
			};
			match chbackup::run(args).await {
				Ok(()) => ExitCode::SUCCESS,
				Err(report) => {
					eprintln!("{report:?}");
					ExitCode::from(chbackup::errors::exit_code(&report))
				}
			}
		})
}
