//! Registry capability contract consumed by the engine.

use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::image::{Descriptor, ImageConfiguration};

use crate::error::Result;
use crate::manifest::Manifest;
use crate::reference::ImageRef;

/// The narrow registry interface the engine drives. Implementations cover
/// the distribution API ([`crate::registry::HttpRegistryClient`]) and local
/// OCI layout directories ([`crate::ocidir::OciDirClient`]).
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetch and parse the manifest at a reference. The hint, when present,
    /// pins the digest and media type to fetch.
    async fn manifest_get(&self, r: &ImageRef, hint: Option<&Descriptor>) -> Result<Manifest>;

    /// Upload a manifest under the reference's digest or tag. `child` marks
    /// manifests below the top of a tree; those are stored by digest only
    /// and never resolve or update tags.
    async fn manifest_put(&self, r: &ImageRef, manifest: &Manifest, child: bool) -> Result<()>;

    /// Delete a manifest. With `check_referrers`, fallback referrer metadata
    /// for the manifest's subject is updated as well.
    async fn manifest_delete(&self, r: &ImageRef, check_referrers: bool) -> Result<()>;

    /// Fetch a blob's content.
    async fn blob_get(&self, r: &ImageRef, desc: &Descriptor) -> Result<Bytes>;

    /// Fetch and parse an image configuration blob.
    async fn config_get(&self, r: &ImageRef, desc: &Descriptor) -> Result<ImageConfiguration>;

    /// Upload a blob.
    async fn blob_put(&self, r: &ImageRef, desc: &Descriptor, blob: Bytes) -> Result<()>;

    /// Copy a blob between repositories, cheaply when the backend allows.
    async fn blob_copy(&self, src: &ImageRef, tgt: &ImageRef, desc: &Descriptor) -> Result<()>;

    /// Enumerate referrer descriptors for the manifest at `r`.
    async fn referrer_list(&self, r: &ImageRef) -> Result<Vec<Descriptor>>;
}
