//! Minimal CREATE-statement surgery.
//!
//! Restore needs to rewrite the engine prefix, its parameters, and macro tokens of a CREATE
//! statement; nothing else. Full SQL parsing is fragile here, so this module is a small scanner
//! that understands ClickHouse quoting (single-quoted strings with backslash escapes, backticked
//! identifiers) just well enough to find and rebuild the ENGINE clause.

use std::collections::BTreeMap;

/// Engines that read from external systems and hold no local data.
const EXTERNAL_ENGINES: &[&str] = &[
	"Kafka",
	"RabbitMQ",
	"S3",
	"URL",
	"HDFS",
	"MySQL",
	"PostgreSQL",
	"ODBC",
	"JDBC",
	"ExternalDistributed",
];

/// Macro tokens the restore planner knows how to expand.
pub const KNOWN_MACROS: &[&str] = &["database", "table", "uuid", "shard", "replica"];

/// Scan past a quoted region starting at `i` (which must point at the opening quote).
/// Returns the index just past the closing quote.
fn skip_quoted(bytes: &[u8], i: usize) -> usize {
	let quote = bytes[i];
	let mut j = i + 1;
	while j < bytes.len() {
		match bytes[j] {
			b'\\' if quote == b'\'' => j += 2,
			b if b == quote => return j + 1,
			_ => j += 1,
		}
	}
	j
}

/// Find the byte range of the engine identifier in a CREATE statement.
fn engine_ident(create: &str) -> Option<(usize, usize)> {
	let bytes = create.as_bytes();
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			b'\'' | b'`' | b'"' => i = skip_quoted(bytes, i),
			b'E' | b'e' => {
				let rest = &bytes[i..];
				if rest.len() >= 6
					&& rest[..6].eq_ignore_ascii_case(b"ENGINE")
					&& (i == 0 || (!bytes[i - 1].is_ascii_alphanumeric() && bytes[i - 1] != b'_'))
					&& !rest
						.get(6)
						.is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
				{
					let mut j = i + 6;
					while j < bytes.len() && (bytes[j].is_ascii_whitespace() || bytes[j] == b'=') {
						j += 1;
					}
					let start = j;
					while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_')
					{
						j += 1;
					}
					if j > start {
						return Some((start, j));
					}
					return None;
				}
				i += 1;
			}
			_ => i += 1,
		}
	}
	None
}

/// The table or database engine name, if the statement has an ENGINE clause.
pub fn engine_of(create: &str) -> Option<&str> {
	engine_ident(create).map(|(start, end)| &create[start..end])
}

/// The byte range of the engine's argument list contents (between the parens), if present.
fn engine_args_span(create: &str) -> Option<(usize, usize)> {
	let (_, end) = engine_ident(create)?;
	let bytes = create.as_bytes();
	let mut i = end;
	while i < bytes.len() && bytes[i].is_ascii_whitespace() {
		i += 1;
	}
	if i >= bytes.len() || bytes[i] != b'(' {
		return None;
	}
	let start = i + 1;
	let mut depth = 1;
	i += 1;
	while i < bytes.len() {
		match bytes[i] {
			b'\'' | b'`' | b'"' => i = skip_quoted(bytes, i),
			b'(' => {
				depth += 1;
				i += 1;
			}
			b')' => {
				depth -= 1;
				if depth == 0 {
					return Some((start, i));
				}
				i += 1;
			}
			_ => i += 1,
		}
	}
	None
}

/// Split an engine argument list on top-level commas, trimming whitespace.
fn split_args(args: &str) -> Vec<&str> {
	let bytes = args.as_bytes();
	let mut out = Vec::new();
	let mut depth = 0;
	let mut start = 0;
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			b'\'' | b'`' | b'"' => i = skip_quoted(bytes, i),
			b'(' => {
				depth += 1;
				i += 1;
			}
			b')' => {
				depth -= 1;
				i += 1;
			}
			b',' if depth == 0 => {
				out.push(args[start..i].trim());
				start = i + 1;
				i += 1;
			}
			_ => i += 1,
		}
	}
	let last = args[start..].trim();
	if !last.is_empty() {
		out.push(last);
	}
	out
}

/// The engine arguments of a CREATE statement, as trimmed source fragments.
pub fn engine_args(create: &str) -> Vec<&str> {
	engine_args_span(create)
		.map(|(start, end)| split_args(&create[start..end]))
		.unwrap_or_default()
}

/// The `(zookeeper path, replica token)` of a Replicated* engine, when given explicitly.
pub fn replica_args(create: &str) -> Option<(String, String)> {
	if !engine_of(create)?.starts_with("Replicated") {
		return None;
	}
	let args = engine_args(create);
	match (args.first(), args.get(1)) {
		(Some(path), Some(replica)) => Some((unquote(path), unquote(replica))),
		_ => None,
	}
}

/// The explicit `UUID '...'` of an Atomic/Replicated CREATE, if present.
pub fn uuid_of(create: &str) -> Option<&str> {
	let bytes = create.as_bytes();
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			b'\'' | b'`' | b'"' => i = skip_quoted(bytes, i),
			b'U' | b'u' => {
				let rest = &bytes[i..];
				if rest.len() >= 4
					&& rest[..4].eq_ignore_ascii_case(b"UUID")
					&& (i == 0 || bytes[i - 1].is_ascii_whitespace())
				{
					let mut j = i + 4;
					while j < bytes.len() && bytes[j].is_ascii_whitespace() {
						j += 1;
					}
					if j < bytes.len() && bytes[j] == b'\'' {
						let end = skip_quoted(bytes, j);
						return Some(&create[j + 1..end - 1]);
					}
				}
				i += 1;
			}
			_ => i += 1,
		}
	}
	None
}

/// Strip one level of single quotes and unescape the contents.
fn unquote(fragment: &str) -> String {
	let trimmed = fragment.trim();
	if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
		trimmed[1..trimmed.len() - 1]
			.replace("\\'", "'")
			.replace("\\\\", "\\")
	} else {
		trimmed.to_string()
	}
}

fn quote(value: &str) -> String {
	format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Replace the whole engine clause (identifier plus argument list) with a new one.
fn replace_engine_clause(create: &str, engine: &str, args: &[String]) -> String {
	let Some((start, ident_end)) = engine_ident(create) else {
		return create.to_string();
	};
	let end = engine_args_span(create)
		.map(|(_, args_end)| args_end + 1)
		.unwrap_or(ident_end);

	let mut clause = engine.to_string();
	if !args.is_empty() {
		clause.push('(');
		clause.push_str(&args.join(", "));
		clause.push(')');
	}
	format!("{}{}{}", &create[..start], clause, &create[end..])
}

/// Rewrite the replica token of a `Replicated*` engine.
///
/// Statements without explicit engine arguments already rely on server-side macros and are
/// left alone.
pub fn override_replica(create: &str, replica: &str) -> String {
	let Some(engine) = engine_of(create) else {
		return create.to_string();
	};
	if !engine.starts_with("Replicated") {
		return create.to_string();
	}
	let args = engine_args(create);
	if args.len() < 2 {
		return create.to_string();
	}
	let engine = engine.to_string();
	let mut new_args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
	new_args[1] = quote(replica);
	replace_engine_clause(create, &engine, &new_args)
}

/// Downgrade a `Replicated*MergeTree` engine to its non-replicated equivalent, dropping the
/// coordination path and replica token arguments.
pub fn force_non_replicated(create: &str) -> String {
	let Some(engine) = engine_of(create) else {
		return create.to_string();
	};
	let Some(plain) = engine.strip_prefix("Replicated") else {
		return create.to_string();
	};
	if !plain.ends_with("MergeTree") {
		return create.to_string();
	}
	let plain = plain.to_string();
	let args = engine_args(create);
	let rest: Vec<String> = args.iter().skip(2).map(|a| a.to_string()).collect();
	replace_engine_clause(create, &plain, &rest)
}

/// Expand known macro tokens from the destination node's macro map.
///
/// Unknown tokens are left intact so the server can expand them itself.
pub fn expand_macros(text: &str, macros: &BTreeMap<String, String>) -> String {
	let mut out = text.to_string();
	for key in KNOWN_MACROS {
		if let Some(value) = macros.get(*key) {
			out = out.replace(&format!("{{{key}}}"), value);
		}
	}
	out
}

/// Whether the engine reads from an external system (no local parts to back up).
pub fn is_external_engine(engine: &str) -> bool {
	EXTERNAL_ENGINES.contains(&engine)
}

/// The `TO db.table` target of a materialized view, if any.
///
/// Keywords in server-normalized CREATE statements are always uppercase, so a plain search
/// is enough.
pub fn materialized_view_target(create: &str) -> Option<(String, String)> {
	if !create.contains("MATERIALIZED VIEW") {
		return None;
	}
	let to_pos = create.find(" TO ")?;
	let rest = create[to_pos + 4..].trim_start();
	let target: String = rest
		.chars()
		.take_while(|c| !c.is_whitespace() && *c != '(')
		.collect();
	let (db, table) = target.split_once('.')?;
	Some((
		db.trim_matches('`').to_string(),
		table.trim_matches('`').to_string(),
	))
}

#[cfg(test)]
mod tests {
	use super::*;

	const REPL: &str =
		"CREATE TABLE db.t (x Int32) ENGINE = ReplicatedMergeTree('/p', 'static') ORDER BY x";

	#[test]
	fn finds_engines() {
		assert_eq!(engine_of(REPL), Some("ReplicatedMergeTree"));
		assert_eq!(
			engine_of("CREATE TABLE t (x Int32) ENGINE=SummingMergeTree ORDER BY x"),
			Some("SummingMergeTree")
		);
		assert_eq!(engine_of("CREATE VIEW v AS SELECT 1"), None);
		// a column default mentioning the word must not confuse the scanner
		assert_eq!(
			engine_of("CREATE TABLE t (engine String DEFAULT 'ENGINE = Fake') ENGINE = Log"),
			Some("Log")
		);
	}

	#[test]
	fn splits_engine_args() {
		assert_eq!(engine_args(REPL), vec!["'/p'", "'static'"]);
		assert_eq!(
			engine_args(
				"CREATE TABLE t (x Int32) ENGINE = ReplicatedReplacingMergeTree('/p', 'r1', ver) ORDER BY x"
			),
			vec!["'/p'", "'r1'", "ver"]
		);
		assert!(engine_args("CREATE TABLE t (x Int32) ENGINE = MergeTree ORDER BY x").is_empty());
	}

	#[test]
	fn replica_token_extraction() {
		assert_eq!(
			replica_args(REPL),
			Some(("/p".to_string(), "static".to_string()))
		);
		assert_eq!(
			replica_args("CREATE TABLE t (x Int32) ENGINE = MergeTree ORDER BY x"),
			None
		);
	}

	#[test]
	fn overrides_replica_token() {
		let out = override_replica(REPL, "{replica}");
		assert_eq!(
			out,
			"CREATE TABLE db.t (x Int32) ENGINE = ReplicatedMergeTree('/p', '{replica}') ORDER BY x"
		);
	}

	#[test]
	fn override_leaves_macro_defaults_alone() {
		let bare = "CREATE TABLE db.t (x Int32) ENGINE = ReplicatedMergeTree ORDER BY x";
		assert_eq!(override_replica(bare, "r2"), bare);
	}

	#[test]
	fn downgrades_to_non_replicated() {
		assert_eq!(
			force_non_replicated(REPL),
			"CREATE TABLE db.t (x Int32) ENGINE = MergeTree ORDER BY x"
		);
		assert_eq!(
			force_non_replicated(
				"CREATE TABLE t (x Int32) ENGINE = ReplicatedReplacingMergeTree('/p', 'r1', ver) ORDER BY x"
			),
			"CREATE TABLE t (x Int32) ENGINE = ReplacingMergeTree(ver) ORDER BY x"
		);
		// non-MergeTree replicated engines are left alone
		let dist = "CREATE TABLE t (x Int32) ENGINE = Distributed(c, d, t)";
		assert_eq!(force_non_replicated(dist), dist);
	}

	#[test]
	fn extracts_uuid() {
		let create = "CREATE TABLE db.t UUID '123e4567-e89b-12d3-a456-426614174000' (x Int32) ENGINE = MergeTree ORDER BY x";
		assert_eq!(uuid_of(create), Some("123e4567-e89b-12d3-a456-426614174000"));
		assert_eq!(uuid_of(REPL), None);
	}

	#[test]
	fn expands_known_macros_only() {
		let macros = BTreeMap::from([
			("replica".to_string(), "clickhouse02".to_string()),
			("shard".to_string(), "01".to_string()),
		]);
		assert_eq!(
			expand_macros("/clickhouse/{shard}/{replica}/{custom}", &macros),
			"/clickhouse/01/clickhouse02/{custom}"
		);
	}

	#[test]
	fn external_engines() {
		assert!(is_external_engine("Kafka"));
		assert!(!is_external_engine("MergeTree"));
	}

	#[test]
	fn materialized_view_targets() {
		assert_eq!(
			materialized_view_target(
				"CREATE MATERIALIZED VIEW db.mv TO db.inner AS SELECT * FROM db.t"
			),
			Some(("db".to_string(), "inner".to_string()))
		);
		assert_eq!(materialized_view_target(REPL), None);
	}

	#[test]
	fn non_ascii_names_survive_rewrites() {
		let create =
			"CREATE TABLE `база`.`таблица` (x Int32) ENGINE = ReplicatedMergeTree('/p', 'static') ORDER BY x";
		let out = force_non_replicated(create);
		assert!(out.contains("`база`.`таблица`"));
		assert!(out.contains("ENGINE = MergeTree"));
	}
}
