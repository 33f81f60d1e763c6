use std::path::{Path, PathBuf};

use miette::{Context as _, IntoDiagnostic as _, Result, miette};
use tokio::{
	io::{AsyncWriteExt as _, duplex},
	task::JoinHandle,
};
use tokio_util::io::InspectReader;
use tracing::trace;

use crate::metadata::FileEntry;

use super::ByteReader;

/// What came out of packing one part directory.
#[derive(Debug, Clone)]
pub struct PackOutput {
	/// Files in archive order, with their pre-pack sizes and checksums.
	pub files: Vec<FileEntry>,
	/// Sum of file sizes before packing.
	pub raw_size: u64,
}

/// `b3:<hex>` label for a hash, as stored in catalogs and metadata files.
pub fn checksum_label(hash: &blake3::Hash) -> String {
	format!("b3:{}", hash.to_hex())
}

/// The part checksum: a hash over the sorted per-file manifest (name, size, content hash).
///
/// Because packing is deterministic, two parts with equal manifests produce identical
/// artifacts, so this is the dedup identity. Crucially it can be computed from the part
/// directory alone, before deciding whether the part needs uploading at all.
pub fn manifest_checksum(files: &[FileEntry]) -> String {
	let mut hasher = blake3::Hasher::new();
	for file in files {
		hasher.update(file.name.as_bytes());
		hasher.update(&[0]);
		hasher.update(&file.size.to_le_bytes());
		hasher.update(file.checksum.as_bytes());
		hasher.update(&[b'\n']);
	}
	checksum_label(&hasher.finalize())
}

/// Read a part directory and produce its manifest without packing anything.
pub async fn manifest_of_dir(dir: &Path) -> Result<PackOutput> {
	let mut output = PackOutput {
		files: Vec::new(),
		raw_size: 0,
	};
	for relative in sorted_files(dir)? {
		let full = dir.join(&relative);
		let mut file = tokio::fs::File::open(&full)
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("part file vanished during scan: {full:?}"))?;

		let mut hasher = blake3::Hasher::new();
		let mut size = 0_u64;
		let mut buffer = vec![0_u8; 64 * 1024];
		loop {
			let read = tokio::io::AsyncReadExt::read(&mut file, &mut buffer)
				.await
				.into_diagnostic()?;
			if read == 0 {
				break;
			}
			hasher.update(&buffer[..read]);
			size += read as u64;
		}

		output.raw_size += size;
		output.files.push(FileEntry {
			name: relative.to_string_lossy().into_owned(),
			size,
			checksum: checksum_label(&hasher.finalize()),
		});
	}
	Ok(output)
}

/// Pack a part directory into a TAR stream.
///
/// The archive is deterministic: members in sorted relative-path order, mtime/uid/gid zeroed,
/// fixed mode. Identical directory contents always produce identical bytes, which is what lets
/// the artifact checksum double as the dedup identity. TAR member names also sidestep any
/// filename length limits of the destination filesystem.
///
/// Returns the stream plus a handle resolving to the per-file manifest once the whole
/// directory has been read.
pub fn pack_dir(dir: &Path) -> (ByteReader, JoinHandle<Result<PackOutput>>) {
	let dir = dir.to_path_buf();
	let (tx, rx) = duplex(64 * 1024);

	let task = tokio::spawn(async move {
		let mut builder = tokio_tar::Builder::new(tx);
		let mut output = PackOutput {
			files: Vec::new(),
			raw_size: 0,
		};

		for relative in sorted_files(&dir)? {
			let full = dir.join(&relative);
			let meta = tokio::fs::metadata(&full)
				.await
				.into_diagnostic()
				.wrap_err_with(|| format!("part file vanished during packing: {full:?}"))?;

			let mut header = tokio_tar::Header::new_gnu();
			header.set_size(meta.len());
			header.set_mode(0o644);
			header.set_mtime(0);
			header.set_uid(0);
			header.set_gid(0);

			let file = tokio::fs::File::open(&full)
				.await
				.into_diagnostic()
				.wrap_err_with(|| format!("opening part file {full:?}"))?;
			let mut hasher = blake3::Hasher::new();
			let reader = InspectReader::new(file, |bytes| {
				hasher.update(bytes);
			});

			builder
				.append_data(&mut header, &relative, reader)
				.await
				.into_diagnostic()
				.wrap_err_with(|| format!("archiving part file {full:?}"))?;

			trace!(?relative, size = meta.len(), "archived part file");
			output.raw_size += meta.len();
			output.files.push(FileEntry {
				name: relative.to_string_lossy().into_owned(),
				size: meta.len(),
				checksum: checksum_label(&hasher.finalize()),
			});
		}

		let mut tx = builder
			.into_inner()
			.await
			.into_diagnostic()
			.wrap_err("finishing archive")?;
		tx.shutdown().await.into_diagnostic()?;
		Ok(output)
	});

	(Box::new(rx), task)
}

/// Unpack a TAR stream into a directory, creating it as needed.
pub async fn unpack_into(reader: ByteReader, dest: &Path) -> Result<()> {
	tokio::fs::create_dir_all(dest)
		.await
		.into_diagnostic()
		.wrap_err_with(|| format!("creating unpack destination {dest:?}"))?;
	let mut archive = tokio_tar::Archive::new(reader);
	archive
		.unpack(dest)
		.await
		.into_diagnostic()
		.wrap_err_with(|| format!("unpacking archive into {dest:?}"))
}

/// Regular files under `dir`, as relative paths in stable order.
fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
	let mut files = Vec::new();
	for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
		let entry = entry
			.into_diagnostic()
			.wrap_err_with(|| miette!("walking part directory {dir:?}"))?;
		if entry.file_type().is_file() {
			let relative = entry
				.path()
				.strip_prefix(dir)
				.expect("BUG: walkdir yields paths under its root")
				.to_path_buf();
			files.push(relative);
		}
	}
	files.sort();
	Ok(files)
}
