//! Manifest-phase steps: annotation edits, media-type conversion, referrer
//! conversion, layer removal and addition, external-URL stripping.

use std::str::FromStr;

use oci_spec::image::{Digest, MediaType};

use crate::dag::{ManifestNode, ModFlag};
use crate::digest::DigestAlgorithm;
use crate::error::{ModError, Result};
use crate::mediatype;
use crate::options::{ManifestStep, PlatformSelector};

/// Apply one synchronous manifest step to a node. Rebase is handled by the
/// executor because it performs registry i/o.
pub(crate) fn apply(node: &mut ManifestNode, step: &ManifestStep) -> Result<()> {
    match step {
        ManifestStep::Annotation {
            selector,
            key,
            value,
        } => annotation(node, selector, key, value.as_deref()),
        ManifestStep::AnnotationPromote => annotation_promote(node),
        ManifestStep::AnnotationBase { name, digest } => annotation_base(node, name, digest.as_deref()),
        ManifestStep::LabelToAnnotation => label_to_annotation(node),
        ManifestStep::ToOci => to_oci(node),
        ManifestStep::ToDocker => to_docker(node),
        ManifestStep::ToOciReferrers => to_oci_referrers(node),
        ManifestStep::ExternalUrlsRm => external_urls_rm(node),
        ManifestStep::DigestAlgo(algo) => digest_algo(node, *algo),
        ManifestStep::LayerRmIndex(index) => layer_rm_index(node, *index),
        ManifestStep::LayerRmCreatedBy(re) => layer_rm_created_by(node, re),
        ManifestStep::LayerAdd {
            blob,
            desc,
            diff_id,
            platforms,
        } => layer_add(node, blob, desc, diff_id, platforms.as_deref()),
        ManifestStep::Rebase(_) => unreachable!("rebase runs in the executor"),
    }
}

fn annotation(
    node: &mut ManifestNode,
    selector: &PlatformSelector,
    key: &str,
    value: Option<&str>,
) -> Result<()> {
    if !selector.matches(node.top, node.platform.as_ref()) {
        return Ok(());
    }
    if node.manifest.set_annotation(key, value) {
        node.flag.mark_replaced();
    }
    Ok(())
}

fn annotation_promote(node: &mut ManifestNode) -> Result<()> {
    if !node.manifest.is_index() {
        return Ok(());
    }
    let common = node
        .children
        .iter()
        .filter(|c| !c.flag.is_deleted())
        .map(|c| c.manifest.annotations().cloned().unwrap_or_default())
        .reduce(|mut acc, m| {
            acc.retain(|k, v| m.get(k) == Some(v));
            acc
        });
    let Some(common) = common else { return Ok(()) };
    let mut changed = false;
    let mut pairs: Vec<_> = common.into_iter().collect();
    pairs.sort();
    for (k, v) in pairs {
        changed |= node.manifest.set_annotation(&k, Some(&v));
    }
    if changed {
        node.flag.mark_replaced();
    }
    Ok(())
}

fn annotation_base(node: &mut ManifestNode, name: &str, digest: Option<&str>) -> Result<()> {
    if !node.top {
        return Ok(());
    }
    let mut changed = node
        .manifest
        .set_annotation(mediatype::ANNOT_BASE_NAME, Some(name));
    if let Some(d) = digest {
        changed |= node
            .manifest
            .set_annotation(mediatype::ANNOT_BASE_DIGEST, Some(d));
    }
    if changed {
        node.flag.mark_replaced();
    }
    Ok(())
}

fn label_to_annotation(node: &mut ManifestNode) -> Result<()> {
    let Some(cfg) = node.config.as_ref() else {
        return Ok(());
    };
    let labels = cfg
        .config
        .config()
        .as_ref()
        .and_then(|c| c.labels().clone());
    let Some(labels) = labels else { return Ok(()) };
    let mut changed = false;
    let mut pairs: Vec<_> = labels.into_iter().collect();
    pairs.sort();
    for (k, v) in pairs {
        changed |= node.manifest.set_annotation(&k, Some(&v));
    }
    if changed {
        node.flag.mark_replaced();
    }
    Ok(())
}

fn to_oci(node: &mut ManifestNode) -> Result<()> {
    if node.manifest.convert_to_oci()? {
        node.flag.mark_replaced();
    }
    // Keep the detached config and layer descriptors in step with the body.
    if let Some(cfg) = node.config.as_mut() {
        if cfg.desc.media_type().to_string() == mediatype::DOCKER_CONFIG {
            cfg.desc.set_media_type(MediaType::ImageConfig);
        }
    }
    for layer in &mut node.layers {
        let mapped = mediatype::layer_to_oci(layer.desc.media_type());
        if &mapped != layer.desc.media_type() {
            layer.desc.set_media_type(mapped);
        }
    }
    Ok(())
}

fn to_docker(node: &mut ManifestNode) -> Result<()> {
    if node.manifest.convert_to_docker()? {
        node.flag.mark_replaced();
    }
    if let Some(cfg) = node.config.as_mut() {
        if *cfg.desc.media_type() == MediaType::ImageConfig {
            cfg.desc
                .set_media_type(mediatype::docker(mediatype::DOCKER_CONFIG));
        }
    }
    for layer in &mut node.layers {
        let mapped = mediatype::layer_to_docker(layer.desc.media_type())?;
        if &mapped != layer.desc.media_type() {
            layer.desc.set_media_type(mapped);
        }
    }
    Ok(())
}

/// Rewrite Docker reference-type index entries into subject/referrer
/// relationships: the entry leaves the index and its manifest attaches to
/// the referenced child's referrer list.
fn to_oci_referrers(node: &mut ManifestNode) -> Result<()> {
    if !node.manifest.is_index() {
        return Ok(());
    }
    let entries = node.manifest.as_index()?.manifests().clone();
    let mut refs: Vec<(usize, Digest, String)> = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        let Some(ann) = entry.annotations() else { continue };
        let (Some(rtype), Some(rdigest)) = (
            ann.get(mediatype::ANNOT_REF_TYPE),
            ann.get(mediatype::ANNOT_REF_DIGEST),
        ) else {
            continue;
        };
        let digest = Digest::from_str(rdigest).map_err(|e| {
            ModError::parsing(format!("reference digest annotation {rdigest}: {e}"))
        })?;
        refs.push((i, digest, rtype.clone()));
    }
    if refs.is_empty() {
        return Ok(());
    }

    let mut remaining = entries;
    let mut moved = Vec::new();
    for (i, digest, rtype) in refs.into_iter().rev() {
        remaining.remove(i);
        let child = node.children.remove(i);
        moved.push((child, digest, rtype));
    }
    moved.reverse();
    node.manifest.as_index_mut()?.set_manifests(remaining);

    for (mut child, digest, rtype) in moved {
        let target = node
            .children
            .iter_mut()
            .find(|c| c.manifest.descriptor().digest() == &digest)
            .ok_or_else(|| {
                ModError::not_found(format!("reference subject {digest} is not in the index"))
            })?;
        child
            .manifest
            .set_subject(Some(target.manifest.descriptor().clone()));
        child
            .manifest
            .set_annotation(mediatype::ANNOT_REF_TYPE, Some(&rtype));
        child.flag = ModFlag::Added;
        target.referrers.push(child);
    }
    node.flag.mark_replaced();
    Ok(())
}

fn external_urls_rm(node: &mut ManifestNode) -> Result<()> {
    let Ok(image) = node.manifest.as_image_mut() else {
        return Ok(());
    };
    let mut changed = false;
    for layer in image.layers_mut() {
        if layer.urls().as_ref().is_some_and(|u| !u.is_empty()) {
            layer.set_urls(None);
            layer.set_media_type(mediatype::layer_unforeign(layer.media_type()));
            changed = true;
        }
    }
    if changed {
        node.flag.mark_replaced();
    }
    Ok(())
}

fn digest_algo(node: &mut ManifestNode, algo: DigestAlgorithm) -> Result<()> {
    if DigestAlgorithm::from_digest(node.manifest.descriptor().digest())? != algo {
        node.flag.mark_replaced();
    }
    Ok(())
}

fn layer_rm_index(node: &mut ManifestNode, index: usize) -> Result<()> {
    if node.manifest.is_index() {
        return Err(ModError::unsupported_media_type(
            "remove layer by index requires an image manifest, not an index",
        ));
    }
    if index >= node.layers.len() {
        return Err(ModError::not_found(format!(
            "layer index {index} out of range ({} layers)",
            node.layers.len()
        )));
    }
    let layer = &mut node.layers[index];
    match layer.flag {
        ModFlag::Deleted => {}
        ModFlag::Added => {
            node.layers.remove(index);
        }
        _ => layer.flag = ModFlag::Deleted,
    }
    Ok(())
}

fn layer_rm_created_by(node: &mut ManifestNode, re: &regex::Regex) -> Result<()> {
    if node.manifest.is_index() {
        return Ok(());
    }
    let Some(cfg) = node.config.as_ref() else {
        return Ok(());
    };
    let mut layer_idx = 0usize;
    let mut found = false;
    for entry in cfg.config.history() {
        if entry.empty_layer().unwrap_or(false) {
            continue;
        }
        if layer_idx >= node.layers.len() {
            break;
        }
        let matched = entry
            .created_by()
            .as_ref()
            .is_some_and(|cb| re.is_match(cb));
        if matched {
            found = true;
            // first deletion wins; deleted layers are skipped afterwards
            if node.layers[layer_idx].flag != ModFlag::Deleted {
                node.layers[layer_idx].flag = ModFlag::Deleted;
            }
        }
        layer_idx += 1;
    }
    if !found {
        return Err(ModError::not_found(format!(
            "no layer history matched {:?}",
            re.as_str()
        )));
    }
    Ok(())
}

fn layer_add(
    node: &mut ManifestNode,
    blob: &bytes::Bytes,
    desc: &oci_spec::image::Descriptor,
    diff_id: &Digest,
    platforms: Option<&[String]>,
) -> Result<()> {
    if node.manifest.is_index() {
        return Ok(());
    }
    if let Some(platforms) = platforms {
        let matched = node.platform.as_ref().is_some_and(|p| {
            platforms
                .iter()
                .any(|sel| crate::options::platform_matches(sel, p))
        });
        if !matched {
            return Ok(());
        }
    }
    let mut layer = crate::dag::LayerNode::new(desc.clone(), Some(diff_id.clone()));
    layer.flag = ModFlag::Added;
    layer.blob = Some(blob.clone());
    node.layers.push(layer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{ConfigNode, LayerNode, ManifestNode};
    use crate::digest::sha256_digest;
    use crate::manifest::Manifest;
    use bytes::Bytes;
    use oci_spec::image::{
        Descriptor, HistoryBuilder, ImageConfiguration, MediaType,
    };

    fn layer_desc(content: &[u8]) -> Descriptor {
        Descriptor::new(
            MediaType::ImageLayerGzip,
            content.len() as u64,
            sha256_digest(content),
        )
    }

    fn image_node(history: Vec<oci_spec::image::History>, layers: Vec<Descriptor>) -> ManifestNode {
        let manifest_json = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:1010101010101010101010101010101010101010101010101010101010101010",
                "size": 2
            },
            "layers": &layers,
        });
        let raw = Bytes::from(serde_json::to_vec(&manifest_json).unwrap());
        let manifest = Manifest::parse_with_media_type(
            raw,
            &MediaType::ImageManifest.to_string(),
        )
        .unwrap();
        let mut config = {
            use oci_spec::image::{Arch, ImageConfigurationBuilder, Os, RootFsBuilder};
            ImageConfigurationBuilder::default()
                .architecture(Arch::Amd64)
                .os(Os::Linux)
                .rootfs(
                    RootFsBuilder::default()
                        .typ("layers")
                        .diff_ids(Vec::<String>::new())
                        .build()
                        .unwrap(),
                )
                .build()
                .unwrap()
        };
        config.set_history(history);
        let orig_desc = manifest.descriptor().clone();
        let config_desc = manifest.as_image().unwrap().config().clone();
        ManifestNode {
            manifest,
            orig_desc,
            flag: ModFlag::Unchanged,
            top: true,
            platform: None,
            config: Some(ConfigNode {
                config,
                desc: config_desc,
                modified: false,
            }),
            layers: layers_from(layers),
            children: Vec::new(),
            referrers: Vec::new(),
        }
    }

    fn layers_from(descs: Vec<Descriptor>) -> Vec<LayerNode> {
        descs.into_iter().map(|d| LayerNode::new(d, None)).collect()
    }

    fn history(created_by: &str, empty: bool) -> oci_spec::image::History {
        let mut b = HistoryBuilder::default().created_by(created_by);
        if empty {
            b = b.empty_layer(true);
        }
        b.build().unwrap()
    }

    #[test]
    fn test_layer_rm_index_out_of_range() {
        let mut node = image_node(vec![], vec![layer_desc(b"a")]);
        assert!(matches!(
            apply(&mut node, &ManifestStep::LayerRmIndex(3)),
            Err(ModError::NotFound(_))
        ));
    }

    #[test]
    fn test_layer_rm_created_by_marks_aligned_layer() {
        let mut node = image_node(
            vec![
                history("ADD rootfs", false),
                history("ENV x=1", true),
                history("RUN build-tool install", false),
            ],
            vec![layer_desc(b"a"), layer_desc(b"b")],
        );
        let re = regex::Regex::new("build-tool").unwrap();
        apply(&mut node, &ManifestStep::LayerRmCreatedBy(re)).unwrap();
        assert_eq!(node.layers[0].flag, ModFlag::Unchanged);
        assert_eq!(node.layers[1].flag, ModFlag::Deleted);
    }

    #[test]
    fn test_layer_rm_created_by_no_match_errors() {
        let mut node = image_node(
            vec![history("ADD rootfs", false)],
            vec![layer_desc(b"a")],
        );
        let re = regex::Regex::new("nothing-here").unwrap();
        assert!(matches!(
            apply(&mut node, &ManifestStep::LayerRmCreatedBy(re)),
            Err(ModError::NotFound(_))
        ));
    }

    #[test]
    fn test_annotation_top_scope() {
        let mut node = image_node(vec![], vec![]);
        let step = ManifestStep::Annotation {
            selector: PlatformSelector::Top,
            key: "k".into(),
            value: Some("v".into()),
        };
        apply(&mut node, &step).unwrap();
        assert_eq!(node.flag, ModFlag::Replaced);
        assert_eq!(
            node.manifest.annotations().unwrap().get("k").map(String::as_str),
            Some("v")
        );

        // same value again: no further change, flag already replaced
        node.flag = ModFlag::Unchanged;
        apply(&mut node, &step).unwrap();
        assert_eq!(node.flag, ModFlag::Unchanged);
    }

    #[test]
    fn test_external_urls_rm() {
        let mut desc = layer_desc(b"a");
        desc.set_media_type(MediaType::ImageLayerNonDistributableGzip);
        desc.set_urls(Some(vec!["https://example.com/blob".into()]));
        let mut node = image_node(vec![], vec![desc]);
        apply(&mut node, &ManifestStep::ExternalUrlsRm).unwrap();
        let img = node.manifest.as_image().unwrap();
        assert!(img.layers()[0].urls().is_none());
        assert_eq!(img.layers()[0].media_type(), &MediaType::ImageLayerGzip);
        assert_eq!(node.flag, ModFlag::Replaced);
    }
}
