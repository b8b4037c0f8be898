/*!
Build requests for the OS image factory and the artifacts derived from them.

A schematic describes the system extensions baked into an image. The factory answers a schematic with a
content-addressed id, from which the ISO download URL and the installer image reference follow by fixed
templates.
*/

use crate::constants::SCHEMATIC_SLOT_PREFIX_LEN;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfficialExtensions {
    pub official_extensions: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customization {
    pub system_extensions: OfficialExtensions,
}

/// The document submitted to the image factory.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Schematic {
    pub customization: Customization,
}

impl Schematic {
    /// Extensions are submitted in the order given. The factory hashes the content it receives, so two lists with
    /// the same members in different orders may produce different ids that describe identical images.
    pub fn new(extensions: &[String]) -> Self {
        Schematic {
            customization: Customization {
                system_extensions: OfficialExtensions {
                    official_extensions: extensions.to_vec(),
                },
            },
        }
    }

    pub fn extensions(&self) -> &[String] {
        &self.customization.system_extensions.official_extensions
    }
}

/// The content hash returned by the factory for a schematic.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchematicId(String);

impl SchematicId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        SchematicId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The leading characters of the id, used to keep ISO file names short but distinct.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(SCHEMATIC_SLOT_PREFIX_LEN) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for SchematicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The inputs that fully determine an image asset.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub profile: String,
    pub talos_version: String,
    pub platform: String,
    pub arch: String,
    pub extensions: Vec<String>,
}

impl ImageRequest {
    pub fn schematic(&self) -> Schematic {
        Schematic::new(&self.extensions)
    }
}

/// A resolved OS image variant.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub profile: String,
    pub schematic_id: SchematicId,
    pub talos_version: String,
    pub platform: String,
    pub arch: String,
    pub extensions: Vec<String>,
    pub iso_url: String,
    pub installer_image: String,
    /// The hypervisor storage volume holding the ISO, when it was downloaded there.
    pub iso_file_id: Option<String>,
}

impl ImageAsset {
    pub fn from_schematic(request: &ImageRequest, factory_url: &str, schematic_id: SchematicId) -> Self {
        ImageAsset {
            profile: request.profile.clone(),
            iso_url: iso_url(
                factory_url,
                &schematic_id,
                &request.talos_version,
                &request.platform,
                &request.arch,
            ),
            installer_image: installer_image(
                factory_url,
                &schematic_id,
                &request.talos_version,
                &request.platform,
            ),
            schematic_id,
            talos_version: request.talos_version.clone(),
            platform: request.platform.clone(),
            arch: request.arch.clone(),
            extensions: request.extensions.clone(),
            iso_file_id: None,
        }
    }

    /// Whether this asset was produced from exactly these inputs.
    pub fn matches(&self, request: &ImageRequest) -> bool {
        self.profile == request.profile
            && self.talos_version == request.talos_version
            && self.platform == request.platform
            && self.arch == request.arch
            && self.extensions == request.extensions
    }

    /// The file name of the ISO in hypervisor storage. One slot per (version, schematic, platform, arch).
    pub fn iso_file_name(&self) -> String {
        format!(
            "talos-{}-{}-{}-{}.iso",
            self.talos_version,
            self.schematic_id.short(),
            self.platform,
            self.arch
        )
    }
}

pub fn iso_url(factory_url: &str, schematic_id: &SchematicId, version: &str, platform: &str, arch: &str) -> String {
    format!(
        "{}/image/{}/{}/{}-{}.iso",
        factory_url.trim_end_matches('/'),
        schematic_id,
        version,
        platform,
        arch
    )
}

/// The factory serves installer images from its own host, so the registry is the factory URL without scheme.
pub fn installer_image(factory_url: &str, schematic_id: &SchematicId, version: &str, platform: &str) -> String {
    format!(
        "{}/{}-installer/{}:{}",
        registry_host(factory_url),
        platform,
        schematic_id,
        version
    )
}

fn registry_host(factory_url: &str) -> &str {
    let host = factory_url
        .strip_prefix("https://")
        .or_else(|| factory_url.strip_prefix("http://"))
        .unwrap_or(factory_url);
    host.trim_end_matches('/')
}

/// The tag of an image reference, e.g. `v1.9.0` for `factory.talos.dev/nocloud-installer/abc:v1.9.0`.
pub fn image_tag(image: &str) -> Option<&str> {
    let (name, tag) = image.rsplit_once(':')?;
    // The colon of a registry port is not a tag separator.
    if tag.contains('/') || name.is_empty() {
        None
    } else {
        Some(tag)
    }
}
