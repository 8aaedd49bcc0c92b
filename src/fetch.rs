//! Retrieval of the deployed artifact's bytes or content address.

use crate::digest::ArtifactDigest;
use crate::model::{ArtifactLocator, ImageReference};
use crate::registry::ImageRegistry;
use crate::store::ObjectStore;
use crate::{EngineError, Result};
use log::{debug, warn};

/// The artifact as retrieved, ready for digesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedArtifact {
    CodePackage {
        bytes: Vec<u8>,
    },
    /// Images are content-addressed; the manifest digest has been checked
    /// against the manifest bytes.
    ContainerImage {
        manifest_digest: ArtifactDigest,
        image: ImageReference,
    },
}

pub struct ArtifactFetcher<'a> {
    objects: &'a dyn ObjectStore,
    registry: &'a dyn ImageRegistry,
}

impl<'a> ArtifactFetcher<'a> {
    pub fn new(objects: &'a dyn ObjectStore, registry: &'a dyn ImageRegistry) -> Self {
        Self { objects, registry }
    }

    pub async fn fetch(&self, locator: &ArtifactLocator) -> Result<FetchedArtifact> {
        match locator {
            ArtifactLocator::CodePackage {
                location,
                reported_sha256,
            } => self.fetch_package(location, reported_sha256.as_deref()).await,
            ArtifactLocator::ContainerImage(image) => self.resolve_image(image).await,
        }
    }

    async fn fetch_package(
        &self,
        location: &str,
        reported_sha256: Option<&str>,
    ) -> Result<FetchedArtifact> {
        debug!(
            "Fetching code package from {} store",
            self.objects.store_type()
        );
        let bytes = self.objects.get(location).await?.ok_or_else(|| {
            EngineError::ArtifactNotFound(format!("code package {} does not exist", location))
        })?;

        if let Some(reported) = reported_sha256 {
            match ArtifactDigest::from_base64(reported) {
                Ok(expected) => {
                    let actual = ArtifactDigest::of_bytes(&bytes);
                    if actual != expected {
                        return Err(EngineError::ArtifactUnavailable(format!(
                            "code package changed while fetching: platform reports {}, got {}",
                            expected, actual
                        )));
                    }
                }
                Err(e) => warn!("Ignoring unparseable platform package hash: {}", e),
            }
        }

        Ok(FetchedArtifact::CodePackage { bytes })
    }

    async fn resolve_image(&self, image: &ImageReference) -> Result<FetchedArtifact> {
        let reference = image.reference();
        let manifest = self
            .registry
            .manifest(image, &reference)
            .await?
            .ok_or_else(|| {
                EngineError::ArtifactNotFound(format!("image {} does not exist", image))
            })?;

        let computed = ArtifactDigest::of_bytes(&manifest.bytes);
        for (source, claimed) in [
            ("registry", manifest.reported_digest.as_ref()),
            ("reference", image.digest.as_ref()),
        ] {
            if let Some(claimed) = claimed {
                if *claimed != computed {
                    return Err(EngineError::ArtifactUnavailable(format!(
                        "manifest for {} hashes to {} but {} says {}",
                        image, computed, source, claimed
                    )));
                }
            }
        }

        debug!("Resolved {} to {}", image, computed);
        Ok(FetchedArtifact::ContainerImage {
            manifest_digest: computed,
            image: image.clone(),
        })
    }
}
