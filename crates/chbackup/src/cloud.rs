use miette::{Result, miette};
use serde::{Deserialize, Serialize};

/// One object referenced from a disk metadata stub, relative to the disk's remote prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
	pub key: String,
	pub size: u64,
}

/// A ClickHouse object-storage disk metadata file (format version 3).
///
/// These small local files stand in for the actual part data, which lives in the disk's
/// bucket. A frozen object-storage part is a directory of these stubs; backing it up means
/// packing the stubs, and restoring means putting the stubs back and making sure the objects
/// they reference exist in the destination bucket.
///
/// ```text
/// 3
/// <object count>\t<total size>
/// <size>\t<relative key>      (one per object)
/// <reference count>
/// <read only flag>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskMetadataFile {
	pub objects: Vec<ObjectRef>,
	pub ref_count: u64,
	pub read_only: bool,
}

impl DiskMetadataFile {
	pub fn parse(text: &str) -> Result<Self> {
		let mut lines = text.lines();
		let version: u32 = lines
			.next()
			.ok_or_else(|| miette!("empty disk metadata file"))?
			.trim()
			.parse()
			.map_err(|_| miette!("disk metadata file has no version line"))?;
		if version != 3 {
			return Err(miette!("unsupported disk metadata format version {version}"));
		}

		let counts = lines
			.next()
			.ok_or_else(|| miette!("disk metadata file truncated at counts"))?;
		let count: usize = counts
			.split_whitespace()
			.next()
			.and_then(|n| n.parse().ok())
			.ok_or_else(|| miette!("bad object count in disk metadata file"))?;

		let mut objects = Vec::with_capacity(count);
		for _ in 0..count {
			let line = lines
				.next()
				.ok_or_else(|| miette!("disk metadata file truncated at object list"))?;
			let mut fields = line.split_whitespace();
			let size: u64 = fields
				.next()
				.and_then(|n| n.parse().ok())
				.ok_or_else(|| miette!("bad object size in disk metadata file"))?;
			let key = fields
				.next()
				.ok_or_else(|| miette!("missing object key in disk metadata file"))?
				.to_string();
			objects.push(ObjectRef { key, size });
		}

		let ref_count: u64 = lines
			.next()
			.and_then(|n| n.trim().parse().ok())
			.unwrap_or(0);
		let read_only = lines
			.next()
			.is_some_and(|flag| flag.trim() == "1");

		Ok(Self {
			objects,
			ref_count,
			read_only,
		})
	}

	pub fn render(&self) -> String {
		let total: u64 = self.objects.iter().map(|o| o.size).sum();
		let mut out = format!("3\n{}\t{}\n", self.objects.len(), total);
		for object in &self.objects {
			out.push_str(&format!("{}\t{}\n", object.size, object.key));
		}
		out.push_str(&format!(
			"{}\n{}\n",
			self.ref_count,
			if self.read_only { 1 } else { 0 }
		));
		out
	}
}

/// The per-disk envelope stored under `cloud_storage/<disk>/` in the backup: the captured
/// revision marker and the inventory of referenced objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudEnvelope {
	pub disk: String,
	pub disk_type: String,
	pub revision: u64,
	pub objects: Vec<ObjectRef>,
}

pub const ENVELOPE_FILE: &str = "envelope.json";

/// Name of the revision marker ClickHouse leaves at the root of a frozen object-storage
/// disk's shadow directory.
pub const REVISION_FILE: &str = "revision.txt";

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stub_roundtrips() {
		let stub = DiskMetadataFile {
			objects: vec![
				ObjectRef {
					key: "abc/def".into(),
					size: 100,
				},
				ObjectRef {
					key: "abc/ghi".into(),
					size: 42,
				},
			],
			ref_count: 1,
			read_only: false,
		};
		let text = stub.render();
		assert_eq!(DiskMetadataFile::parse(&text).expect("parse"), stub);
	}

	#[test]
	fn parses_real_shape() {
		let text = "3\n1\t446\n446\tpyn/bkcgdznsuljbgmgiqfevmxupbwhk\n0\n0\n";
		let stub = DiskMetadataFile::parse(text).expect("parse");
		assert_eq!(stub.objects.len(), 1);
		assert_eq!(stub.objects[0].size, 446);
		assert_eq!(stub.objects[0].key, "pyn/bkcgdznsuljbgmgiqfevmxupbwhk");
		assert!(!stub.read_only);
	}

	#[test]
	fn rejects_other_versions() {
		assert!(DiskMetadataFile::parse("5\n0\t0\n0\n0\n").is_err());
		assert!(DiskMetadataFile::parse("").is_err());
	}
}
