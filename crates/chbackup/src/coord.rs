use std::collections::BTreeSet;

use async_trait::async_trait;
use miette::Result;
use tokio::sync::Mutex;

/// Coordination-service surface: the distributed lock plus the node cleanup restore needs.
///
/// The live client (ZooKeeper or compatible) is wired in by the deployment; this repo ships
/// the trait and an in-process implementation for tests and single-node setups.
#[async_trait]
pub trait Coordination: Send + Sync {
	/// Create an ephemeral node, failing softly if it already exists.
	async fn try_create_ephemeral(&self, path: &str) -> Result<bool>;

	async fn delete(&self, path: &str) -> Result<()>;

	/// Immediate child names of a node. Empty when the node is absent.
	async fn list_children(&self, path: &str) -> Result<Vec<String>>;

	/// Delete a node and everything under it.
	async fn delete_recursive(&self, path: &str) -> Result<()>;

	async fn exists(&self, path: &str) -> Result<bool>;
}

/// Coordination for a single process: real semantics, no network.
#[derive(Debug, Default)]
pub struct InProcessCoordination {
	nodes: Mutex<BTreeSet<String>>,
}

impl InProcessCoordination {
	pub fn new() -> Self {
		Self::default()
	}

	/// Pre-seed a node, for tests setting up pre-existing replica entries.
	pub async fn create(&self, path: &str) {
		self.nodes.lock().await.insert(normalize(path));
	}
}

fn normalize(path: &str) -> String {
	let trimmed = path.trim_end_matches('/');
	if trimmed.is_empty() {
		"/".to_string()
	} else {
		trimmed.to_string()
	}
}

#[async_trait]
impl Coordination for InProcessCoordination {
	async fn try_create_ephemeral(&self, path: &str) -> Result<bool> {
		Ok(self.nodes.lock().await.insert(normalize(path)))
	}

	async fn delete(&self, path: &str) -> Result<()> {
		self.nodes.lock().await.remove(&normalize(path));
		Ok(())
	}

	async fn list_children(&self, path: &str) -> Result<Vec<String>> {
		let prefix = format!("{}/", normalize(path));
		Ok(self
			.nodes
			.lock()
			.await
			.iter()
			.filter_map(|node| node.strip_prefix(&prefix))
			.filter(|rest| !rest.is_empty() && !rest.contains('/'))
			.map(String::from)
			.collect())
	}

	async fn delete_recursive(&self, path: &str) -> Result<()> {
		let target = normalize(path);
		let prefix = format!("{target}/");
		self.nodes
			.lock()
			.await
			.retain(|node| node != &target && !node.starts_with(&prefix));
		Ok(())
	}

	async fn exists(&self, path: &str) -> Result<bool> {
		Ok(self.nodes.lock().await.contains(&normalize(path)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn ephemeral_create_is_exclusive() {
		let coord = InProcessCoordination::new();
		assert!(coord.try_create_ephemeral("/lock").await.expect("create"));
		assert!(!coord.try_create_ephemeral("/lock").await.expect("create"));
		coord.delete("/lock").await.expect("delete");
		assert!(coord.try_create_ephemeral("/lock").await.expect("create"));
	}

	#[tokio::test]
	async fn children_and_recursive_delete() {
		let coord = InProcessCoordination::new();
		coord.create("/tables/t1/replicas/r1").await;
		coord.create("/tables/t1/replicas/r2").await;
		coord.create("/tables/t1/replicas/r2/queue").await;

		let mut children = coord
			.list_children("/tables/t1/replicas")
			.await
			.expect("list");
		children.sort();
		assert_eq!(children, vec!["r1", "r2"]);

		coord
			.delete_recursive("/tables/t1/replicas/r2")
			.await
			.expect("delete");
		assert!(!coord.exists("/tables/t1/replicas/r2").await.expect("ex"));
		assert!(
			!coord
				.exists("/tables/t1/replicas/r2/queue")
				.await
				.expect("ex")
		);
		assert!(coord.exists("/tables/t1/replicas/r1").await.expect("ex"));
	}
}
