use crate::config::Config;

/// Arguments and loaded config, carried down through the subcommand tree.
#[derive(Clone, Debug)]
pub struct Context<A = (), B = ()> {
	pub args_top: A,
	pub args_sub: B,
	pub config: Config,
}

impl Context {
	pub fn new(config: Config) -> Self {
		Self {
			args_top: (),
			args_sub: (),
			config,
		}
	}
}

#[allow(dead_code)] // not every subcommand uses every shape
impl<A, B> Context<A, B> {
	pub fn with_top<C>(self, args_top: C) -> Context<C, B> {
		Context::<C, B> {
			args_top,
			args_sub: self.args_sub,
			config: self.config,
		}
	}

	pub fn with_sub<C>(self, args_sub: C) -> Context<A, C> {
		Context::<A, C> {
			args_top: self.args_top,
			args_sub,
			config: self.config,
		}
	}

	pub fn push<C>(self, new_sub: C) -> Context<B, C> {
		Context::<B, C> {
			args_top: self.args_sub,
			args_sub: new_sub,
			config: self.config,
		}
	}

	/// Spin up the engine with production collaborators for this invocation.
	pub async fn engine(&self) -> miette::Result<crate::engine::Engine> {
		crate::engine::Engine::from_config(self.config.clone()).await
	}
}
