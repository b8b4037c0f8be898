use crate::error::{self, Error, Result};
use models::client::{HypervisorClient, ImageFactoryClient, StateStore};
use models::cluster::{ClusterSpec, HypervisorSettings};
use models::deferred::Deferred;
use models::image::{ImageAsset, ImageRequest};
use models::node::DownloadRequest;

use snafu::ResultExt;
use tracing::{event, instrument, Level};

const ISO_CONTENT_TYPE: &str = "iso";

/// The outputs of resolving one image profile. The factory only computes the schematic id after accepting a
/// request, so each output becomes known asynchronously.
#[derive(Clone, Debug)]
pub struct ResolvedImage {
    pub profile: String,
    pub asset: Deferred<ImageAsset, Error>,
    pub iso_url: Deferred<String, Error>,
    pub installer_image: Deferred<String, Error>,
    /// The hypervisor volume holding the ISO, if it was downloaded there.
    pub iso_file_id: Deferred<Option<String>, Error>,
}

/// Turns image profiles into image assets through the image factory, and optionally places the resulting ISO
/// in hypervisor storage.
#[derive(Clone, Debug)]
pub struct ImageAssetResolver<F, H, S>
where
    F: ImageFactoryClient,
    H: HypervisorClient,
    S: StateStore,
{
    factory: F,
    hypervisor: H,
    store: S,
    cluster_name: String,
    settings: HypervisorSettings,
}

impl<F, H, S> ImageAssetResolver<F, H, S>
where
    F: ImageFactoryClient + 'static,
    H: HypervisorClient + 'static,
    S: StateStore + 'static,
{
    pub fn new(factory: F, hypervisor: H, store: S, cluster: &ClusterSpec) -> Self {
        ImageAssetResolver {
            factory,
            hypervisor,
            store,
            cluster_name: cluster.name.clone(),
            settings: cluster.hypervisor.clone(),
        }
    }

    /// Resolves the image for `request`, reusing a previously resolved asset built from the same inputs.
    ///
    /// Extensions are submitted in the order given. The factory addresses schematics by content, so reordering
    /// extensions may yield a different id for an identical image; this is not canonicalized here.
    #[instrument(skip(self, request), fields(profile = %request.profile), err)]
    pub async fn resolve(&self, request: &ImageRequest, upload: bool) -> Result<ImageAsset> {
        let stored = self
            .store
            .load_image(&self.cluster_name, &request.profile)
            .await
            .context(error::LoadStateSnafu {
                key: format!("image/{}", request.profile),
            })?;

        let mut asset = match stored {
            Some(asset) if asset.matches(request) => {
                event!(Level::INFO, schematic = %asset.schematic_id, "Reusing resolved image.");
                asset
            }
            _ => {
                let schematic_id = self
                    .factory
                    .submit_schematic(&request.schematic())
                    .await
                    .context(error::ResolveImageSnafu {
                        profile: request.profile.clone(),
                    })?;
                event!(Level::INFO, schematic = %schematic_id, "Image factory accepted schematic.");
                ImageAsset::from_schematic(request, &self.factory.base_url(), schematic_id)
            }
        };

        if upload && asset.iso_file_id.is_none() {
            let download = DownloadRequest {
                hypervisor_node: self.settings.node_name.clone(),
                datastore: self.settings.iso_datastore.clone(),
                content_type: ISO_CONTENT_TYPE.to_string(),
                file_name: asset.iso_file_name(),
                url: asset.iso_url.clone(),
                // The slot is named after version and schematic, so stale media under the same name is replaced.
                overwrite: true,
            };
            let file_id = self
                .hypervisor
                .download_file(&download)
                .await
                .context(error::ResolveImageSnafu {
                    profile: request.profile.clone(),
                })?;
            event!(Level::INFO, file_id = %file_id, "Downloaded ISO to hypervisor storage.");
            asset.iso_file_id = Some(file_id);
        }

        self.store
            .save_image(&self.cluster_name, &asset)
            .await
            .context(error::SaveStateSnafu {
                key: format!("image/{}", request.profile),
            })?;
        Ok(asset)
    }

    /// Starts resolving `request` and returns its outputs as deferred values.
    ///
    /// Resolution is driven by whichever consumer awaits first and happens at most once.
    pub fn resolve_deferred(&self, request: ImageRequest, upload: bool) -> ResolvedImage {
        let resolver = self.clone();
        let profile = request.profile.clone();
        ResolvedImage::from_deferred(
            profile,
            Deferred::new(async move { resolver.resolve(&request, upload).await }),
        )
    }
}

impl ResolvedImage {
    fn from_deferred(profile: String, asset: Deferred<ImageAsset, Error>) -> Self {
        ResolvedImage {
            profile,
            iso_url: asset.map(|asset| asset.iso_url),
            installer_image: asset.map(|asset| asset.installer_image),
            iso_file_id: asset.map(|asset| asset.iso_file_id),
            asset,
        }
    }

    /// Outputs of an asset which is already known, such as one loaded from state.
    pub fn ready(asset: ImageAsset) -> Self {
        ResolvedImage::from_deferred(asset.profile.clone(), Deferred::ready(asset))
    }
}

/// The image request for each profile referenced by at least one node of the cluster.
pub fn image_requests(cluster: &ClusterSpec) -> Vec<(ImageRequest, bool)> {
    let mut profiles: Vec<&str> = cluster
        .nodes
        .iter()
        .map(|node| node.image_profile.as_str())
        .collect();
    profiles.sort_unstable();
    profiles.dedup();

    profiles
        .into_iter()
        .filter_map(|key| {
            cluster.image_profiles.get(key).map(|profile| {
                (
                    ImageRequest {
                        profile: key.to_string(),
                        talos_version: cluster.talos_version.clone(),
                        platform: profile.platform.clone(),
                        arch: profile.arch.clone(),
                        extensions: profile.extensions.clone(),
                    },
                    profile.upload_to_hypervisor,
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::fake_cluster;
    use models::client::{MemoryStateStore, MockHypervisorClient, MockImageFactoryClient};
    use models::image::SchematicId;
    use std::sync::Arc;

    const SCHEMATIC: &str = "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba";

    fn request(version: &str) -> ImageRequest {
        ImageRequest {
            profile: "default".to_string(),
            talos_version: version.to_string(),
            platform: "nocloud".to_string(),
            arch: "amd64".to_string(),
            extensions: vec!["siderolabs/qemu-guest-agent".to_string()],
        }
    }

    fn factory(submissions: usize) -> MockImageFactoryClient {
        let mut factory = MockImageFactoryClient::new();
        factory
            .expect_base_url()
            .returning(|| "https://factory.talos.dev".to_string());
        factory
            .expect_submit_schematic()
            .times(submissions)
            .returning(|_| Ok(SchematicId::new(SCHEMATIC)));
        factory
    }

    #[tokio::test]
    async fn test_resolve_and_download() {
        let mut hypervisor = MockHypervisorClient::new();
        hypervisor
            .expect_download_file()
            .times(1)
            .withf(|download| {
                download.overwrite
                    && download.file_name == "talos-v1.9.0-376567988ad3-nocloud-amd64.iso"
                    && download.datastore == "local"
                    && download.url
                        == format!(
                            "https://factory.talos.dev/image/{}/v1.9.0/nocloud-amd64.iso",
                            SCHEMATIC
                        )
            })
            .returning(|download| Ok(download.file_id()));

        let store = MemoryStateStore::new();
        let cluster = fake_cluster();
        let resolver = ImageAssetResolver::new(
            Arc::new(factory(1)),
            Arc::new(hypervisor),
            store.clone(),
            &cluster,
        );

        let resolved = resolver.resolve_deferred(request("v1.9.0"), true);
        assert_eq!(
            resolved.installer_image.resolve().await.unwrap(),
            format!("factory.talos.dev/nocloud-installer/{}:v1.9.0", SCHEMATIC)
        );
        assert_eq!(
            resolved.iso_file_id.resolve().await.unwrap().as_deref(),
            Some("local:iso/talos-v1.9.0-376567988ad3-nocloud-amd64.iso")
        );

        // A second resolution of the same inputs reuses the stored asset.
        let again = resolver.resolve(&request("v1.9.0"), true).await.unwrap();
        assert_eq!(again, resolved.asset.resolve().await.unwrap());
    }

    #[tokio::test]
    async fn test_version_change_resolves_again() {
        let mut hypervisor = MockHypervisorClient::new();
        hypervisor
            .expect_download_file()
            .times(2)
            .returning(|download| Ok(download.file_id()));

        let cluster = fake_cluster();
        let resolver = ImageAssetResolver::new(
            Arc::new(factory(2)),
            Arc::new(hypervisor),
            MemoryStateStore::new(),
            &cluster,
        );

        let old = resolver.resolve(&request("v1.8.3"), true).await.unwrap();
        let new = resolver.resolve(&request("v1.9.0"), true).await.unwrap();
        assert_ne!(old.iso_file_id, new.iso_file_id);
        assert!(new.installer_image.ends_with(":v1.9.0"));
    }

    #[tokio::test]
    async fn test_factory_failure_propagates() {
        let mut factory = MockImageFactoryClient::new();
        factory.expect_submit_schematic().returning(|_| {
            Err(models::client::ClientError::FactoryResponse {
                status_code: reqwest::StatusCode::BAD_REQUEST,
                response: "bad schematic".to_string(),
            })
        });
        let mut hypervisor = MockHypervisorClient::new();
        hypervisor.expect_download_file().times(0);

        let cluster = fake_cluster();
        let resolver = ImageAssetResolver::new(
            Arc::new(factory),
            Arc::new(hypervisor),
            MemoryStateStore::new(),
            &cluster,
        );
        let resolved = resolver.resolve_deferred(request("v1.9.0"), true);
        let err = resolved.iso_url.resolve().await.unwrap_err();
        assert!(matches!(*err, Error::ResolveImage { .. }));
    }

    #[test]
    fn test_image_requests_cover_referenced_profiles() {
        let cluster = fake_cluster();
        let requests = image_requests(&cluster);
        let profiles: Vec<_> = requests.iter().map(|(r, _)| r.profile.as_str()).collect();
        assert_eq!(profiles, vec!["default", "gpu"]);
        assert!(requests.iter().all(|(r, _)| r.talos_version == "v1.9.0"));
    }
}
