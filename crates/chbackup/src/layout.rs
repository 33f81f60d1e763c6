/// Key layout of a backup in the bucket:
///
/// ```text
/// <path_root>/<backup_id>/
///     backup_struct.json
///     data/<db>/<table>/<part>.tar
///     access_control/<file>
///     user_defined_functions/<file>
///     named_collections/<file>
///     cloud_storage/<disk>/<file>
/// ```
#[derive(Debug, Clone)]
pub struct BackupLayout {
	root: String,
}

pub const DOCUMENT_FILE: &str = "backup_struct.json";

impl BackupLayout {
	pub fn new(path_root: impl Into<String>) -> Self {
		let mut root = path_root.into();
		while root.ends_with('/') {
			root.pop();
		}
		Self { root }
	}

	pub fn backup_prefix(&self, backup: &str) -> String {
		format!("{}/{}/", self.root, encode_segment(backup))
	}

	pub fn document_key(&self, backup: &str) -> String {
		format!("{}{DOCUMENT_FILE}", self.backup_prefix(backup))
	}

	pub fn data_prefix(&self, backup: &str) -> String {
		format!("{}data/", self.backup_prefix(backup))
	}

	pub fn part_key(&self, backup: &str, database: &str, table: &str, part: &str) -> String {
		format!(
			"{}{}/{}/{}.tar",
			self.data_prefix(backup),
			encode_segment(database),
			encode_segment(table),
			encode_segment(part),
		)
	}

	pub fn access_key(&self, backup: &str, file: &str) -> String {
		format!("{}access_control/{file}", self.backup_prefix(backup))
	}

	pub fn udf_key(&self, backup: &str, file: &str) -> String {
		format!(
			"{}user_defined_functions/{file}",
			self.backup_prefix(backup)
		)
	}

	pub fn named_collections_key(&self, backup: &str, file: &str) -> String {
		format!("{}named_collections/{file}", self.backup_prefix(backup))
	}

	pub fn cloud_storage_prefix(&self, backup: &str, disk: &str) -> String {
		format!(
			"{}cloud_storage/{}/",
			self.backup_prefix(backup),
			encode_segment(disk)
		)
	}

	/// Prefix listing all backups.
	pub fn root_prefix(&self) -> String {
		format!("{}/", self.root)
	}

	/// Extract the backup name from a document key, if the key is one.
	pub fn backup_name_of_document(&self, key: &str) -> Option<String> {
		let rest = key.strip_prefix(&self.root_prefix())?;
		let (name, file) = rest.split_once('/')?;
		(file == DOCUMENT_FILE).then(|| decode_segment(name))
	}
}

/// Database, table, and part names go into keys verbatim, except for the two bytes that
/// would break the key structure itself.
fn encode_segment(name: &str) -> String {
	name.replace('%', "%25").replace('/', "%2F")
}

fn decode_segment(segment: &str) -> String {
	segment.replace("%2F", "/").replace("%25", "%")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keys_are_structured() {
		let layout = BackupLayout::new("ch_backup/");
		assert_eq!(
			layout.document_key("20260801T000000"),
			"ch_backup/20260801T000000/backup_struct.json"
		);
		assert_eq!(
			layout.part_key("b1", "db", "t", "0_1_1_0"),
			"ch_backup/b1/data/db/t/0_1_1_0.tar"
		);
	}

	#[test]
	fn document_names_roundtrip() {
		let layout = BackupLayout::new("root");
		let key = layout.document_key("weird/name");
		assert_eq!(
			layout.backup_name_of_document(&key),
			Some("weird/name".to_string())
		);
		assert_eq!(layout.backup_name_of_document("root/b1/other.json"), None);
		assert_eq!(layout.backup_name_of_document("elsewhere/b1/x"), None);
	}

	#[test]
	fn non_ascii_segments_are_preserved() {
		let layout = BackupLayout::new("root");
		assert_eq!(
			layout.part_key("b1", "база", "таблица", "0_1_1_0"),
			"root/b1/data/база/таблица/0_1_1_0.tar"
		);
	}
}
