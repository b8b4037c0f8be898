use super::error::{self, Result};
use super::fs::write_private_file;
use super::StateStore;
use crate::image::ImageAsset;
use crate::node::NodeRecord;
use crate::secrets::SecretsBundle;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::ResultExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::instrument;

const SECRETS_FILE: &str = "secrets.json";
const NODES_DIR: &str = "nodes";
const IMAGES_DIR: &str = "images";

/// Keeps state as JSON documents in `<root>/<cluster>/`.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        FileStateStore { root: root.into() }
    }

    fn cluster_dir(&self, cluster: &str) -> PathBuf {
        self.root.join(cluster)
    }

    async fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let contents = match tokio::fs::read(path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).context(error::StateReadSnafu {
                    path: path.to_path_buf(),
                })
            }
        };
        let value = serde_json::from_slice(&contents).context(error::StateParseSnafu {
            path: path.to_path_buf(),
        })?;
        Ok(Some(value))
    }

    /// Writes to a sibling temporary file first so that an interrupted run never leaves a truncated document.
    async fn write<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        let contents = serde_json::to_vec_pretty(value).context(error::StateSerializeSnafu {
            key: path.display().to_string(),
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(error::StateWriteSnafu {
                    path: parent.to_path_buf(),
                })?;
        }

        let tmp = path.with_extension("json.tmp");
        write_private_file(&tmp, &contents)
            .await
            .context(error::StateWriteSnafu { path: tmp.clone() })?;
        tokio::fs::rename(&tmp, path)
            .await
            .context(error::StateWriteSnafu {
                path: path.to_path_buf(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_secrets(&self, cluster: &str) -> Result<Option<SecretsBundle>> {
        Self::read(&self.cluster_dir(cluster).join(SECRETS_FILE)).await
    }

    #[instrument(skip(self, bundle), fields(cluster = %bundle.cluster_name), err)]
    async fn save_secrets(&self, bundle: &SecretsBundle) -> Result<()> {
        Self::write(
            &self.cluster_dir(&bundle.cluster_name).join(SECRETS_FILE),
            bundle,
        )
        .await
    }

    async fn load_node(&self, cluster: &str, node: &str) -> Result<NodeRecord> {
        let path = self
            .cluster_dir(cluster)
            .join(NODES_DIR)
            .join(format!("{}.json", node));
        Ok(Self::read::<NodeRecord>(&path).await?.unwrap_or_default())
    }

    #[instrument(skip(self, record), err)]
    async fn save_node(&self, cluster: &str, node: &str, record: &NodeRecord) -> Result<()> {
        let path = self
            .cluster_dir(cluster)
            .join(NODES_DIR)
            .join(format!("{}.json", node));
        Self::write(&path, record).await
    }

    async fn load_image(&self, cluster: &str, profile: &str) -> Result<Option<ImageAsset>> {
        let path = self
            .cluster_dir(cluster)
            .join(IMAGES_DIR)
            .join(format!("{}.json", profile));
        Self::read(&path).await
    }

    #[instrument(skip(self, asset), fields(profile = %asset.profile), err)]
    async fn save_image(&self, cluster: &str, asset: &ImageAsset) -> Result<()> {
        let path = self
            .cluster_dir(cluster)
            .join(IMAGES_DIR)
            .join(format!("{}.json", asset.profile));
        Self::write(&path, asset).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    secrets: HashMap<String, SecretsBundle>,
    nodes: HashMap<(String, String), NodeRecord>,
    images: HashMap<(String, String), ImageAsset>,
}

/// Keeps state in process memory only. Used for dry renders and tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryStateStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        // Every update is a single insert, so a poisoned lock still guards consistent maps.
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_secrets(&self, cluster: &str) -> Result<Option<SecretsBundle>> {
        Ok(self.with_state(|state| state.secrets.get(cluster).cloned()))
    }

    async fn save_secrets(&self, bundle: &SecretsBundle) -> Result<()> {
        self.with_state(|state| {
            state
                .secrets
                .insert(bundle.cluster_name.clone(), bundle.clone())
        });
        Ok(())
    }

    async fn load_node(&self, cluster: &str, node: &str) -> Result<NodeRecord> {
        Ok(self.with_state(|state| {
            state
                .nodes
                .get(&(cluster.to_string(), node.to_string()))
                .cloned()
                .unwrap_or_default()
        }))
    }

    async fn save_node(&self, cluster: &str, node: &str, record: &NodeRecord) -> Result<()> {
        self.with_state(|state| {
            state
                .nodes
                .insert((cluster.to_string(), node.to_string()), record.clone())
        });
        Ok(())
    }

    async fn load_image(&self, cluster: &str, profile: &str) -> Result<Option<ImageAsset>> {
        Ok(self.with_state(|state| {
            state
                .images
                .get(&(cluster.to_string(), profile.to_string()))
                .cloned()
        }))
    }

    async fn save_image(&self, cluster: &str, asset: &ImageAsset) -> Result<()> {
        self.with_state(|state| {
            state
                .images
                .insert((cluster.to_string(), asset.profile.clone()), asset.clone())
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::PRIVATE_FILE_MODE;
    use std::os::unix::fs::PermissionsExt;

    fn temp_root(test: &str) -> PathBuf {
        std::env::temp_dir().join(format!("talosforge-state-{}-{}", test, std::process::id()))
    }

    #[tokio::test]
    async fn test_file_store_node_records() {
        let root = temp_root("nodes");
        let store = FileStateStore::new(&root);

        assert_eq!(
            store.load_node("homelab", "cp-1").await.unwrap(),
            NodeRecord::default()
        );

        let mut record = NodeRecord {
            vm_id: Some(101),
            applied_config: Some("machine: {}\n".to_string()),
            ..Default::default()
        };
        record.touch();
        store.save_node("homelab", "cp-1", &record).await.unwrap();

        assert_eq!(store.load_node("homelab", "cp-1").await.unwrap(), record);
        assert!(root.join("homelab/nodes/cp-1.json").exists());
        assert!(!root.join("homelab/nodes/cp-1.json.tmp").exists());
        let mode = std::fs::metadata(root.join("homelab/nodes/cp-1.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, PRIVATE_FILE_MODE);
        assert!(store.load_image("homelab", "default").await.unwrap().is_none());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_state() {
        let root = temp_root("corrupt");
        std::fs::create_dir_all(root.join("homelab")).unwrap();
        std::fs::write(root.join("homelab/secrets.json"), "{not json").unwrap();

        let store = FileStateStore::new(&root);
        assert!(matches!(
            store.load_secrets("homelab").await,
            Err(error::ClientError::StateParse { .. })
        ));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStateStore::new();
        let record = NodeRecord {
            bootstrapped: true,
            ..Default::default()
        };
        store.save_node("homelab", "cp-1", &record).await.unwrap();
        assert_eq!(store.load_node("homelab", "cp-1").await.unwrap(), record);
        assert_eq!(
            store.load_node("other", "cp-1").await.unwrap(),
            NodeRecord::default()
        );
    }
}
