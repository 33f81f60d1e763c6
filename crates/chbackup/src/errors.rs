use miette::Diagnostic;
use thiserror::Error;

/// Failure kinds with defined behaviour.
///
/// Most errors in this tool are ad-hoc [`miette`] diagnostics; the kinds here are the ones the
/// rest of the engine (or the process exit code) needs to tell apart. Transient storage errors
/// never surface as a kind of their own: they are retried inside the storage layer and come out
/// as plain diagnostics once retries are exhausted.
#[derive(Debug, Error, Diagnostic)]
pub enum ChError {
	/// Another process holds one of our locks. The command must abort without mutating anything.
	#[error("the {resource} lock is held by another process")]
	#[diagnostic(code(chbackup::locked))]
	Locked { resource: &'static str },

	/// The requested backup does not exist.
	#[error("backup not found: {0}")]
	#[diagnostic(code(chbackup::not_found))]
	NotFound(String),

	/// A checksum mismatch, truncated artifact, or a file that vanished mid-walk.
	#[error("integrity check failed: {0}")]
	#[diagnostic(code(chbackup::integrity))]
	Integrity(String),

	/// The destination has a table with the same name but a different schema.
	#[error("schema mismatch for {table}")]
	#[diagnostic(code(chbackup::schema_mismatch))]
	SchemaMismatch { table: String },

	/// A part failed to attach during restore.
	#[error("failed to attach part {part} to {table}: {message}")]
	#[diagnostic(code(chbackup::attach))]
	AttachFailure {
		table: String,
		part: String,
		message: String,
	},
}

/// Exit codes: 0 success, 1 operational failure, 2 bad arguments (clap owns that one),
/// 3 locked, 4 not found.
pub fn exit_code(error: &miette::Report) -> u8 {
	match error.downcast_ref::<ChError>() {
		Some(ChError::Locked { .. }) => 3,
		Some(ChError::NotFound(_)) => 4,
		_ => 1,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exit_codes_map_from_kinds() {
		assert_eq!(
			exit_code(&miette::Report::new(ChError::Locked { resource: "flock" })),
			3
		);
		assert_eq!(
			exit_code(&miette::Report::new(ChError::NotFound("nope".into()))),
			4
		);
		assert_eq!(
			exit_code(&miette::Report::new(ChError::Integrity("bad".into()))),
			1
		);
		assert_eq!(exit_code(&miette::miette!("anything else")), 1);
	}
}
