//! The in-memory image DAG: manifests, configs, and layers with their
//! modification state, plus the graph builder that populates it.

use std::str::FromStr;

use async_recursion::async_recursion;
use oci_spec::image::{
    Descriptor, Digest, ImageConfiguration, Platform, PlatformBuilder,
};
use tracing::debug;

use crate::client::RegistryClient;
use crate::error::Result;
use crate::manifest::Manifest;
use crate::mediatype;
use crate::reference::ImageRef;

/// Modification state of a DAG node. `Unchanged < Replaced` is the only
/// legal in-place transition; `Added` and `Deleted` are terminal states set
/// at creation or by an explicit removal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModFlag {
    #[default]
    Unchanged,
    Added,
    Replaced,
    Deleted,
}

impl ModFlag {
    /// Promote an unchanged node to replaced; added/deleted stay put.
    pub fn mark_replaced(&mut self) {
        if *self == ModFlag::Unchanged {
            *self = ModFlag::Replaced;
        }
    }

    pub fn is_deleted(&self) -> bool {
        *self == ModFlag::Deleted
    }
}

#[derive(Clone, Debug)]
pub struct ConfigNode {
    pub config: ImageConfiguration,
    /// Most recent descriptor; recomputed when the config is re-serialized.
    pub desc: Descriptor,
    pub modified: bool,
}

#[derive(Clone, Debug)]
pub struct LayerNode {
    /// Descriptor of the compressed blob as fetched.
    pub desc: Descriptor,
    /// Digest of the uncompressed tar, from the config's rootfs.
    pub diff_id: Option<Digest>,
    /// Replacement descriptor recorded by the layer phase.
    pub new_desc: Option<Descriptor>,
    pub new_diff_id: Option<Digest>,
    pub flag: ModFlag,
    /// Repository to copy this blob from when it is not in the source
    /// repository (set by rebase).
    pub source: Option<ImageRef>,
    /// Pending blob content for added layers, pushed by the layer phase.
    pub blob: Option<bytes::Bytes>,
}

impl LayerNode {
    pub fn new(desc: Descriptor, diff_id: Option<Digest>) -> Self {
        LayerNode {
            desc,
            diff_id,
            new_desc: None,
            new_diff_id: None,
            flag: ModFlag::Unchanged,
            source: None,
            blob: None,
        }
    }

    /// True when the descriptor carries external URLs (foreign layer).
    pub fn is_external(&self) -> bool {
        self.desc.urls().as_ref().is_some_and(|u| !u.is_empty())
    }

    /// The descriptor the written manifest should carry.
    pub fn current_desc(&self) -> &Descriptor {
        self.new_desc.as_ref().unwrap_or(&self.desc)
    }
}

#[derive(Debug)]
pub struct ManifestNode {
    pub manifest: Manifest,
    /// Descriptor before any mutation, for change detection.
    pub orig_desc: Descriptor,
    pub flag: ModFlag,
    /// Marks the root of the fetched tree.
    pub top: bool,
    /// Platform from the parent index entry, or from the config.
    pub platform: Option<Platform>,
    pub config: Option<ConfigNode>,
    pub layers: Vec<LayerNode>,
    /// Child manifests, for indexes, in entry order.
    pub children: Vec<ManifestNode>,
    /// Manifests in the same repository whose subject points here.
    pub referrers: Vec<ManifestNode>,
}

impl ManifestNode {
    pub fn desc_changed(&self) -> bool {
        self.manifest.descriptor().digest() != self.orig_desc.digest()
    }
}

/// Post-order walk over manifest nodes: children, then referrers, then the
/// node itself.
pub fn walk_post<F>(node: &mut ManifestNode, f: &mut F) -> Result<()>
where
    F: FnMut(&mut ManifestNode) -> Result<()>,
{
    for child in &mut node.children {
        walk_post(child, f)?;
    }
    for referrer in &mut node.referrers {
        walk_post(referrer, f)?;
    }
    f(node)
}

/// Fetch the manifest tree at `r` into a DAG: index children by digest,
/// configs for recognized image-config types, layer descriptors (blobs are
/// not fetched here), and referrers as sibling manifest nodes.
pub async fn build_graph(
    client: &dyn RegistryClient,
    r: &ImageRef,
    hint: Option<&Descriptor>,
) -> Result<ManifestNode> {
    let mut node = fetch_node(client, r, hint, None).await?;
    node.top = true;
    Ok(node)
}

#[async_recursion]
async fn fetch_node(
    client: &dyn RegistryClient,
    r: &ImageRef,
    hint: Option<&Descriptor>,
    platform: Option<Platform>,
) -> Result<ManifestNode> {
    let manifest = client.manifest_get(r, hint).await?;
    debug!("fetched manifest {} from {r}", manifest.descriptor().digest());
    let orig_desc = manifest.descriptor().clone();
    let mut node = ManifestNode {
        manifest,
        orig_desc,
        flag: ModFlag::Unchanged,
        top: false,
        platform,
        config: None,
        layers: Vec::new(),
        children: Vec::new(),
        referrers: Vec::new(),
    };

    if node.manifest.is_index() {
        let entries = node.manifest.as_index()?.manifests().clone();
        for entry in entries {
            let child_ref = r.to_repository().with_digest(entry.digest().clone());
            let child =
                fetch_node(client, &child_ref, Some(&entry), entry.platform().clone()).await?;
            node.children.push(child);
        }
    } else {
        let image = node.manifest.as_image()?;
        let config_desc = image.config().clone();
        let layer_descs = image.layers().clone();
        let mut diff_ids: Vec<Option<Digest>> = vec![None; layer_descs.len()];
        if mediatype::is_image_config(config_desc.media_type()) {
            let config = client.config_get(r, &config_desc).await?;
            let ids = config.rootfs().diff_ids();
            if ids.len() == layer_descs.len() {
                for (slot, id) in diff_ids.iter_mut().zip(ids) {
                    *slot = Digest::from_str(id).ok();
                }
            }
            if node.platform.is_none() {
                node.platform = Some(config_platform(&config));
            }
            node.config = Some(ConfigNode {
                config,
                desc: config_desc,
                modified: false,
            });
        }
        node.layers = layer_descs
            .into_iter()
            .zip(diff_ids)
            .map(|(desc, diff_id)| LayerNode::new(desc, diff_id))
            .collect();
    }

    for mut rdesc in client.referrer_list(r).await? {
        // Artifact type and annotations on the listed descriptor are list
        // metadata, not properties of the referrer manifest itself.
        rdesc.set_artifact_type(None);
        rdesc.set_annotations(None);
        let rref = r.to_repository().with_digest(rdesc.digest().clone());
        let referrer = fetch_node(client, &rref, Some(&rdesc), None).await?;
        node.referrers.push(referrer);
    }

    Ok(node)
}

pub(crate) fn config_platform(config: &ImageConfiguration) -> Platform {
    let mut b = PlatformBuilder::default()
        .architecture(config.architecture().clone())
        .os(config.os().clone());
    if let Some(variant) = config.variant() {
        b = b.variant(variant.clone());
    }
    b.build().expect("architecture and os are set")
}

/// Render a platform as the canonical `os/arch[/variant]` string.
pub(crate) fn platform_string(p: &Platform) -> String {
    match p.variant() {
        Some(v) => format!("{}/{}/{}", p.os(), p.architecture(), v),
        None => format!("{}/{}", p.os(), p.architecture()),
    }
}
