//! Base-image rebase: verify the old base is a strict prefix of the image,
//! then splice in the new base's layers, history, and diff-ids.

use std::str::FromStr;

use oci_spec::image::{Descriptor, Digest, ImageConfiguration, Platform};
use tracing::{debug, info};

use crate::apply::ApplyCtx;
use crate::dag::{platform_string, LayerNode, ManifestNode, ModFlag};
use crate::error::{ModError, Result};
use crate::manifest::Manifest;
use crate::mediatype;
use crate::options::RebaseSource;
use crate::reference::ImageRef;

pub(crate) async fn rebase_node(
    ctx: &ApplyCtx<'_>,
    node: &mut ManifestNode,
    source: &RebaseSource,
) -> Result<()> {
    if node.manifest.is_index() {
        // children rebase themselves during the walk
        return Ok(());
    }
    if node.config.is_none() {
        // opaque artifacts (attestations and the like) carry no rootfs
        return Ok(());
    }

    let (old_ref, new_ref) = match source {
        RebaseSource::Refs { old, new } => (old.clone(), new.clone()),
        RebaseSource::Annotations => refs_from_annotations(node)?,
    };
    info!("rebasing {} -> {}", old_ref, new_ref);

    let platform = node.platform.clone();
    let (old_manifest, old_config) = base_image(ctx, &old_ref, platform.as_ref()).await?;
    let (new_manifest, new_config) = base_image(ctx, &new_ref, platform.as_ref()).await?;

    let old_layers = old_manifest.as_image()?.layers().clone();
    let new_layers = new_manifest.as_image()?.layers().clone();
    validate_base(&old_config, &old_layers, "old base")?;
    validate_base(&new_config, &new_layers, "new base")?;

    let cfg = node.config.as_ref().expect("checked above");
    validate_prefix(node, &cfg.config, &old_config, &old_layers)?;

    splice(node, &old_config, &old_layers, &new_config, &new_layers, &new_ref)?;
    Ok(())
}

fn refs_from_annotations(node: &ManifestNode) -> Result<(ImageRef, ImageRef)> {
    let annotations = node.manifest.annotations();
    let name = annotations
        .and_then(|a| a.get(mediatype::ANNOT_BASE_NAME))
        .ok_or_else(|| {
            ModError::not_found(format!(
                "missing annotation {}",
                mediatype::ANNOT_BASE_NAME
            ))
        })?;
    let digest = annotations
        .and_then(|a| a.get(mediatype::ANNOT_BASE_DIGEST))
        .ok_or_else(|| {
            ModError::not_found(format!(
                "missing annotation {}",
                mediatype::ANNOT_BASE_DIGEST
            ))
        })?;
    let new_ref: ImageRef = name.parse()?;
    let digest = Digest::from_str(digest)
        .map_err(|e| ModError::parsing(format!("base digest annotation: {e}")))?;
    let old_ref = new_ref.to_repository().with_digest(digest);
    Ok((old_ref, new_ref))
}

/// Fetch a base image's manifest and config, selecting the platform child
/// when the base reference resolves to an index. Results are memoized for
/// the lifetime of the apply.
async fn base_image(
    ctx: &ApplyCtx<'_>,
    r: &ImageRef,
    platform: Option<&Platform>,
) -> Result<(Manifest, ImageConfiguration)> {
    let mut manifest = cached_manifest_get(ctx, r).await?;
    if manifest.is_index() {
        let platform = platform.ok_or_else(|| {
            ModError::mismatch(format!("base {r} is an index but the image has no platform"))
        })?;
        let want = platform_string(platform);
        let entry = manifest
            .as_index()?
            .manifests()
            .iter()
            .find(|e| {
                e.platform()
                    .as_ref()
                    .is_some_and(|p| platform_string(p) == want)
            })
            .cloned()
            .ok_or_else(|| {
                ModError::not_found(format!("base {r} has no manifest for {want}"))
            })?;
        let child_ref = r.to_repository().with_digest(entry.digest().clone());
        manifest = cached_manifest_get(ctx, &child_ref).await?;
    }
    let config_desc = manifest.as_image()?.config().clone();
    if !mediatype::is_image_config(config_desc.media_type()) {
        return Err(ModError::unsupported_media_type(format!(
            "base {r} config is {}",
            config_desc.media_type()
        )));
    }
    let config = ctx.client.config_get(r, &config_desc).await?;
    Ok((manifest, config))
}

async fn cached_manifest_get(ctx: &ApplyCtx<'_>, r: &ImageRef) -> Result<Manifest> {
    let key = r.to_string();
    if let Some(m) = ctx.base_cache.lock().expect("cache lock").get(&key) {
        debug!("base manifest {key} from cache");
        return Ok(m.clone());
    }
    let m = ctx.client.manifest_get(r, None).await?;
    ctx.base_cache
        .lock()
        .expect("cache lock")
        .insert(key, m.clone());
    Ok(m)
}

/// A base image must be internally aligned before it can take part.
fn validate_base(
    config: &ImageConfiguration,
    layers: &[Descriptor],
    which: &str,
) -> Result<()> {
    let non_empty = config
        .history()
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .filter(|h| !h.empty_layer().unwrap_or(false))
        .count();
    let diff_ids = config.rootfs().diff_ids().len();
    if non_empty != layers.len() || diff_ids != layers.len() {
        return Err(ModError::mismatch(format!(
            "{which}: {} layers, {non_empty} non-empty history entries, {diff_ids} diff-ids",
            layers.len()
        )));
    }
    Ok(())
}

fn validate_prefix(
    node: &ManifestNode,
    image_config: &ImageConfiguration,
    old_config: &ImageConfiguration,
    old_layers: &[Descriptor],
) -> Result<()> {
    if old_layers.len() > node.layers.len() {
        return Err(ModError::mismatch(format!(
            "old base has {} layers, image has {}",
            old_layers.len(),
            node.layers.len()
        )));
    }
    for (i, old) in old_layers.iter().enumerate() {
        let image = &node.layers[i].desc;
        if image.digest() != old.digest() || image.size() != old.size() {
            return Err(ModError::mismatch(format!(
                "layer {i}: image has {}, old base has {}",
                image.digest(),
                old.digest()
            )));
        }
    }
    let old_history = old_config.history().as_deref().unwrap_or(&[]);
    let image_history = image_config.history().as_deref().unwrap_or(&[]);
    if old_history.len() > image_history.len() {
        return Err(ModError::mismatch(format!(
            "old base has {} history entries, image has {}",
            old_history.len(),
            image_history.len()
        )));
    }
    for (i, old) in old_history.iter().enumerate() {
        if &image_history[i] != old {
            return Err(ModError::mismatch(format!(
                "history entry {i} differs from the old base"
            )));
        }
    }
    let old_ids = old_config.rootfs().diff_ids();
    let image_ids = image_config.rootfs().diff_ids();
    if old_ids.len() > image_ids.len() || image_ids[..old_ids.len()] != old_ids[..] {
        return Err(ModError::mismatch(
            "old base diff-ids are not a prefix of the image's",
        ));
    }
    Ok(())
}

fn splice(
    node: &mut ManifestNode,
    old_config: &ImageConfiguration,
    old_layers: &[Descriptor],
    new_config: &ImageConfiguration,
    new_layers: &[Descriptor],
    new_ref: &ImageRef,
) -> Result<()> {
    let n_old = old_layers.len();
    let n_old_history = old_config.history().as_deref().unwrap_or(&[]).len();

    // drop the old base prefix: the first n_old non-added layer nodes
    let mut removed = 0usize;
    node.layers.retain(|l| {
        if removed < n_old && l.flag != ModFlag::Added {
            removed += 1;
            false
        } else {
            true
        }
    });

    // prepend the new base's layers, sourced from its repository
    let new_ids = new_config.rootfs().diff_ids();
    let mut prefix: Vec<LayerNode> = Vec::with_capacity(new_layers.len());
    for (desc, id) in new_layers.iter().zip(new_ids) {
        let mut layer = LayerNode::new(desc.clone(), Digest::from_str(id).ok());
        layer.source = Some(new_ref.to_repository());
        prefix.push(layer);
    }
    prefix.append(&mut node.layers);
    node.layers = prefix;

    // mirror the splice in the manifest body
    {
        let image = node.manifest.as_image_mut()?;
        let mut entries: Vec<Descriptor> = new_layers.to_vec();
        entries.extend(image.layers().iter().skip(n_old).cloned());
        image.set_layers(entries);
    }

    // and in the config: history and diff-ids
    let cfg = node.config.as_mut().expect("rebase requires a config");
    let mut history = new_config.history().clone().unwrap_or_default();
    history.extend(
        cfg.config
            .history()
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .skip(n_old_history)
            .cloned(),
    );
    cfg.config.set_history(Some(history));

    let mut diff_ids = new_config.rootfs().diff_ids().clone();
    diff_ids.extend(cfg.config.rootfs().diff_ids().iter().skip(n_old).cloned());
    *cfg.config.rootfs_mut().diff_ids_mut() = diff_ids;
    cfg.modified = true;

    node.flag.mark_replaced();
    Ok(())
}
