//! Graph writer: reconcile modification flags across manifest, config, and
//! layer arrays, push changed blobs and manifests to the target, and keep
//! referrer subjects pointing at the rewritten descriptors.

use async_recursion::async_recursion;
use bytes::Bytes;
use oci_spec::image::{Descriptor, HistoryBuilder};
use tracing::{debug, info};

use crate::apply::ApplyCtx;
use crate::dag::{ManifestNode, ModFlag};
use crate::digest::{canonical_json, encode_data, DigestAlgorithm};
use crate::error::{ModError, Result};
use crate::reference::ImageRef;

/// Post-order write of the DAG: children, the node itself, then its
/// referrers, finishing with the node's own push.
#[async_recursion]
pub(crate) async fn write_graph(ctx: &ApplyCtx<'_>, node: &mut ManifestNode) -> Result<()> {
    for child in &mut node.children {
        if child.flag == ModFlag::Deleted {
            continue;
        }
        write_graph(ctx, child).await?;
    }

    if node.manifest.is_index() {
        write_index(ctx, node).await?;
    } else {
        write_image(ctx, node).await?;
    }

    if matches!(node.flag, ModFlag::Replaced | ModFlag::Added) {
        let algo = match ctx.manifest_algo {
            Some(algo) => algo,
            None => DigestAlgorithm::from_digest(node.orig_desc.digest())?,
        };
        node.manifest.refresh(algo)?;
    }

    write_referrers(ctx, node).await?;

    let needs_push = matches!(node.flag, ModFlag::Replaced | ModFlag::Added) || !ctx.same_repo();
    if needs_push {
        let digest = node.manifest.descriptor().digest().clone();
        let push_ref = if node.top && ctx.r_tgt.tag().is_some() {
            ctx.r_tgt.clone()
        } else {
            ctx.r_tgt.to_repository().with_digest(digest.clone())
        };
        info!("pushing manifest {digest} to {push_ref}");
        ctx.client
            .manifest_put(&push_ref, &node.manifest, !node.top)
            .await?;
    }
    Ok(())
}

/// Rebuild an index's child descriptor array: a forward pass updates and
/// appends, a reverse pass applies deletions so live indices stay valid.
async fn write_index(ctx: &ApplyCtx<'_>, node: &mut ManifestNode) -> Result<()> {
    let mut entries = node.manifest.as_index()?.manifests().clone();
    let mut changed = false;
    let mut deletions: Vec<usize> = Vec::new();
    let mut ei = 0usize;

    for child in &node.children {
        match child.flag {
            ModFlag::Unchanged => ei += 1,
            ModFlag::Replaced => {
                let entry = entries.get_mut(ei).ok_or_else(|| {
                    ModError::mismatch("index entries out of sync with children")
                })?;
                let desc = child.manifest.descriptor();
                entry.set_digest(desc.digest().clone());
                entry.set_size(desc.size());
                entry.set_media_type(desc.media_type().clone());
                changed = true;
                ei += 1;
            }
            ModFlag::Added => {
                let mut entry = child.manifest.descriptor().clone();
                if entry.platform().is_none() {
                    entry.set_platform(child.platform.clone());
                }
                entries.push(entry);
                changed = true;
            }
            ModFlag::Deleted => {
                deletions.push(ei);
                ei += 1;
                changed = true;
            }
        }
    }
    for i in deletions.iter().rev() {
        if *i >= entries.len() {
            return Err(ModError::mismatch("index entries out of sync with children"));
        }
        entries.remove(*i);
    }

    // inline data per entry, non-added children first to mirror entry order
    let mut live: Vec<&ManifestNode> = node
        .children
        .iter()
        .filter(|c| !matches!(c.flag, ModFlag::Deleted | ModFlag::Added))
        .collect();
    live.extend(node.children.iter().filter(|c| c.flag == ModFlag::Added));
    for (entry, child) in entries.iter_mut().zip(&live) {
        changed |= reconcile_data(
            ctx,
            entry,
            Some(child.manifest.raw()),
            ctx.r_src,
            child.flag != ModFlag::Unchanged,
        )
        .await?;
    }

    if changed {
        node.manifest.as_index_mut()?.set_manifests(entries);
        node.flag.mark_replaced();
    }
    Ok(())
}

/// Reconcile an image manifest's layers against config history and rootfs
/// diff-ids, then push the config if it changed.
async fn write_image(ctx: &ApplyCtx<'_>, node: &mut ManifestNode) -> Result<()> {
    let mut entries = node.manifest.as_image()?.layers().clone();
    let has_config = node.config.is_some();
    let (mut history, mut diff_ids) = match &node.config {
        Some(c) => (
            c.config.history().clone().unwrap_or_default(),
            c.config.rootfs().diff_ids().clone(),
        ),
        None => (Vec::new(), Vec::new()),
    };
    let mut changed = false;
    // (layer index, aligned history index) collected for the reverse pass
    let mut deletions: Vec<(usize, usize)> = Vec::new();
    let mut h = 0usize;

    for (i, layer) in node.layers.iter().enumerate() {
        if has_config && layer.flag != ModFlag::Added {
            // empty-layer history entries do not consume a layer slot
            while history
                .get(h)
                .is_some_and(|e| e.empty_layer().unwrap_or(false))
            {
                h += 1;
            }
        }
        match layer.flag {
            ModFlag::Unchanged => {
                if has_config {
                    h += 1;
                }
            }
            ModFlag::Replaced => {
                let entry = entries.get_mut(i).ok_or_else(|| {
                    ModError::mismatch("layer entries out of sync with layer nodes")
                })?;
                let desc = layer.current_desc();
                entry.set_digest(desc.digest().clone());
                entry.set_size(desc.size());
                entry.set_media_type(desc.media_type().clone());
                if has_config {
                    if let Some(id) = &layer.new_diff_id {
                        let slot = diff_ids.get_mut(i).ok_or_else(|| {
                            ModError::mismatch("rootfs diff-ids shorter than layers")
                        })?;
                        *slot = id.to_string();
                    }
                    h += 1;
                }
                changed = true;
            }
            ModFlag::Added => {
                entries.push(layer.current_desc().clone());
                if has_config {
                    let id = layer
                        .new_diff_id
                        .as_ref()
                        .or(layer.diff_id.as_ref())
                        .ok_or_else(|| {
                            ModError::mismatch("added layer has no uncompressed digest")
                        })?;
                    diff_ids.push(id.to_string());
                    history.push(
                        HistoryBuilder::default()
                            .created(
                                ctx.now
                                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                            )
                            .comment("ocimod")
                            .build()
                            .expect("synthetic history entry"),
                    );
                }
                changed = true;
            }
            ModFlag::Deleted => {
                if has_config {
                    deletions.push((i, h));
                    h += 1;
                } else {
                    deletions.push((i, usize::MAX));
                }
                changed = true;
            }
        }
    }

    for (i, h) in deletions.iter().rev() {
        if *i >= entries.len() {
            return Err(ModError::mismatch("layer entries out of sync with layer nodes"));
        }
        entries.remove(*i);
        if has_config {
            if *i >= diff_ids.len() {
                return Err(ModError::mismatch("rootfs diff-ids shorter than layers"));
            }
            diff_ids.remove(*i);
            if *h >= history.len() {
                return Err(ModError::mismatch(
                    "deleted layer has no aligned history entry",
                ));
            }
            history.remove(*h);
        }
    }

    if changed {
        node.manifest.as_image_mut()?.set_layers(entries);
        if let Some(cfg) = node.config.as_mut() {
            // only re-serialize the config when its arrays actually moved
            if cfg.config.history().as_ref() != Some(&history)
                || cfg.config.rootfs().diff_ids() != &diff_ids
            {
                cfg.config.set_history(Some(history));
                *cfg.config.rootfs_mut().diff_ids_mut() = diff_ids;
                cfg.modified = true;
            }
        }
        node.flag.mark_replaced();
    }

    write_config(ctx, node).await?;
    layer_entry_data(ctx, node).await?;
    Ok(())
}

/// Re-serialize a modified config, push it ahead of its manifest, and keep
/// the manifest's config descriptor (and its inline data) current.
async fn write_config(ctx: &ApplyCtx<'_>, node: &mut ManifestNode) -> Result<()> {
    let Some(cfg) = node.config.as_mut() else {
        return Ok(());
    };
    let mut config_bytes: Option<Bytes> = None;
    if cfg.modified {
        let raw = canonical_json(&cfg.config)?;
        let algo = match ctx.config_algo {
            Some(algo) => algo,
            None => DigestAlgorithm::from_digest(cfg.desc.digest())?,
        };
        cfg.desc.set_digest(algo.digest(&raw));
        cfg.desc.set_size(raw.len() as u64);
        let bytes = Bytes::from(raw);
        debug!("pushing config {} to {}", cfg.desc.digest(), ctx.r_tgt);
        ctx.client
            .blob_put(&ctx.r_tgt, &cfg.desc, bytes.clone())
            .await?;
        config_bytes = Some(bytes);
    } else if !ctx.same_repo() {
        ctx.client.blob_copy(ctx.r_src, &ctx.r_tgt, &cfg.desc).await?;
    }

    let modified = cfg.modified;
    let desc = cfg.desc.clone();
    let image = node.manifest.as_image_mut()?;
    let mut entry = image.config().clone();
    let mut entry_changed = false;
    if entry.digest() != desc.digest() || entry.size() != desc.size() {
        entry.set_digest(desc.digest().clone());
        entry.set_size(desc.size());
        entry_changed = true;
    }
    if entry.media_type() != desc.media_type() {
        entry.set_media_type(desc.media_type().clone());
        entry_changed = true;
    }
    entry_changed |= reconcile_data(ctx, &mut entry, config_bytes.as_ref(), ctx.r_src, modified).await?;
    if entry_changed {
        node.manifest.as_image_mut()?.set_config(entry);
        node.flag.mark_replaced();
    }
    Ok(())
}

/// Apply the inline-data policy to the manifest's layer descriptors.
async fn layer_entry_data(ctx: &ApplyCtx<'_>, node: &mut ManifestNode) -> Result<()> {
    let mut live: Vec<(Option<Bytes>, bool, Option<ImageRef>)> = node
        .layers
        .iter()
        .filter(|l| !matches!(l.flag, ModFlag::Deleted | ModFlag::Added))
        .map(|l| (l.blob.clone(), l.flag != ModFlag::Unchanged, l.source.clone()))
        .collect();
    live.extend(
        node.layers
            .iter()
            .filter(|l| l.flag == ModFlag::Added)
            .map(|l| (l.blob.clone(), true, l.source.clone())),
    );

    let mut entries = node.manifest.as_image()?.layers().clone();
    let mut changed = false;
    for (entry, (blob, entry_changed, source)) in entries.iter_mut().zip(&live) {
        if entry.urls().as_ref().is_some_and(|u| !u.is_empty()) {
            continue;
        }
        let from = source.clone().unwrap_or_else(|| ctx.r_src.clone());
        changed |= reconcile_data(ctx, entry, blob.as_ref(), &from, *entry_changed).await?;
    }
    if changed {
        node.manifest.as_image_mut()?.set_layers(entries);
        node.flag.mark_replaced();
    }
    Ok(())
}

/// Rewrite referrer subjects to the node's final descriptor, push live
/// referrers, and delete deleted ones (with the referrer-check flag).
async fn write_referrers(ctx: &ApplyCtx<'_>, node: &mut ManifestNode) -> Result<()> {
    if node.referrers.is_empty() {
        return Ok(());
    }
    let desc_changed = node.desc_changed();
    let subject = node.manifest.descriptor().clone();
    for referrer in &mut node.referrers {
        match referrer.flag {
            ModFlag::Deleted => {
                if ctx.same_repo() {
                    let rref = ctx
                        .r_tgt
                        .to_repository()
                        .with_digest(referrer.manifest.descriptor().digest().clone());
                    debug!("deleting referrer {rref}");
                    ctx.client.manifest_delete(&rref, true).await?;
                }
            }
            _ => {
                if desc_changed {
                    referrer.manifest.set_subject(Some(subject.clone()));
                    referrer.flag.mark_replaced();
                }
                write_graph(ctx, referrer).await?;
            }
        }
    }
    Ok(())
}

/// Inline `data` policy for one descriptor. With a non-negative limit,
/// fitting blobs are inlined and oversized fields stripped; with the
/// default −1, existing fields are kept current but never added.
async fn reconcile_data(
    ctx: &ApplyCtx<'_>,
    desc: &mut Descriptor,
    known: Option<&Bytes>,
    from: &ImageRef,
    content_changed: bool,
) -> Result<bool> {
    if ctx.data_max < 0 {
        if desc.data().is_none() || !content_changed {
            return Ok(false);
        }
        match known {
            Some(bytes) => {
                desc.set_data(Some(encode_data(bytes)));
            }
            None => {
                desc.set_data(None);
            }
        }
        return Ok(true);
    }
    if desc.size() as i64 <= ctx.data_max {
        let bytes = match known {
            Some(b) => b.clone(),
            None => {
                let mut fetch_desc = desc.clone();
                fetch_desc.set_data(None);
                ctx.client.blob_get(from, &fetch_desc).await?
            }
        };
        let encoded = encode_data(&bytes);
        if desc.data().as_deref() == Some(encoded.as_str()) {
            return Ok(false);
        }
        desc.set_data(Some(encoded));
        Ok(true)
    } else if desc.data().is_some() {
        desc.set_data(None);
        Ok(true)
    } else {
        Ok(false)
    }
}
