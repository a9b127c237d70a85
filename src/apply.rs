//! Engine entry point: build the DAG, run the manifest, config, and layer
//! phases in their fixed order, then hand the graph to the writer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_recursion::async_recursion;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::client::RegistryClient;
use crate::dag::{build_graph, walk_post, ManifestNode, ModFlag};
use crate::digest::DigestAlgorithm;
use crate::error::{ModError, Result};
use crate::manifest::Manifest;
use crate::mediatype::{self, Compression};
use crate::options::{LayerBlobStep, ManifestStep, ModOption, Pipelines};
use crate::reference::ImageRef;
use crate::steps;
use crate::steps::layer::ResolvedFileStep;
use crate::{rebase, writer};

/// Environment variable overriding the engine's wall clock (Unix seconds),
/// so synthetic history timestamps are reproducible.
pub const SOURCE_DATE_EPOC: &str = "SOURCE_DATE_EPOC";

pub(crate) struct ApplyCtx<'a> {
    pub client: &'a dyn RegistryClient,
    pub r_src: &'a ImageRef,
    pub r_tgt: ImageRef,
    /// Engine start time, minted into synthetic history entries.
    pub now: DateTime<Utc>,
    pub data_max: i64,
    pub manifest_algo: Option<DigestAlgorithm>,
    pub config_algo: Option<DigestAlgorithm>,
    pub base_cache: Mutex<HashMap<String, Manifest>>,
}

impl ApplyCtx<'_> {
    pub fn same_repo(&self) -> bool {
        self.r_src.same_repository(&self.r_tgt)
    }
}

/// Apply a set of modifications to the image at `source`, returning the
/// target reference pinned by the new top-level digest. With no options the
/// source digest comes back unchanged.
#[tracing::instrument(skip_all, fields(source = %source))]
pub async fn apply(
    client: &dyn RegistryClient,
    source: &ImageRef,
    options: Vec<ModOption>,
) -> Result<ImageRef> {
    let mut pipelines = Pipelines::default();
    for opt in options {
        pipelines.register(opt);
    }

    let target = pipelines
        .target
        .clone()
        .unwrap_or_else(|| source.to_repository());
    let ctx = ApplyCtx {
        client,
        r_src: source,
        r_tgt: target,
        now: engine_time(),
        data_max: pipelines.data_max,
        manifest_algo: pipelines.manifest_algo,
        config_algo: pipelines.config_algo,
        base_cache: Mutex::new(HashMap::new()),
    };

    info!("building image graph for {source}");
    let mut root = build_graph(client, source, None).await?;

    manifest_phase(&ctx, &mut root, &pipelines.manifest).await?;

    walk_post(&mut root, &mut |node| {
        for step in &pipelines.config {
            steps::config::apply(node, step)?;
        }
        Ok(())
    })?;

    let walk_layers = !pipelines.layer_blob.is_empty()
        || !pipelines.layer_file.is_empty()
        || pipelines.force_layer_walk
        || !ctx.same_repo();
    if walk_layers {
        layer_phase(&ctx, &mut root, &pipelines).await?;
    }

    writer::write_graph(&ctx, &mut root).await?;

    let digest = root.manifest.descriptor().digest().clone();
    info!("apply finished at {digest}");
    Ok(ctx.r_tgt.with_digest(digest))
}

fn engine_time() -> DateTime<Utc> {
    if let Ok(value) = std::env::var(SOURCE_DATE_EPOC) {
        if let Some(t) = value
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
        {
            debug!("using {SOURCE_DATE_EPOC}={t} as engine time");
            return t;
        }
    }
    Utc::now()
}

#[async_recursion]
async fn manifest_phase(
    ctx: &ApplyCtx<'_>,
    node: &mut ManifestNode,
    phase: &[ManifestStep],
) -> Result<()> {
    for child in &mut node.children {
        manifest_phase(ctx, child, phase).await?;
    }
    for referrer in &mut node.referrers {
        manifest_phase(ctx, referrer, phase).await?;
    }
    for step in phase {
        match step {
            ManifestStep::Rebase(source) => rebase::rebase_node(ctx, node, source).await?,
            other => steps::manifest::apply(node, other)?,
        }
    }
    Ok(())
}

/// Walk every image manifest's layers: stream, rewrite, push or copy.
#[async_recursion]
async fn layer_phase(
    ctx: &ApplyCtx<'_>,
    node: &mut ManifestNode,
    pipelines: &Pipelines,
) -> Result<()> {
    for child in &mut node.children {
        if child.flag == ModFlag::Deleted {
            continue;
        }
        layer_phase(ctx, child, pipelines).await?;
    }
    for referrer in &mut node.referrers {
        if referrer.flag == ModFlag::Deleted {
            continue;
        }
        layer_phase(ctx, referrer, pipelines).await?;
    }
    if node.manifest.is_index() {
        return Ok(());
    }

    // timestamp rules resolve against this manifest's (final) config labels
    let labels = node
        .config
        .as_ref()
        .and_then(|c| c.config.config().as_ref())
        .and_then(|c| c.labels().clone());
    let file_steps: Arc<Vec<ResolvedFileStep>> = Arc::new(
        pipelines
            .layer_file
            .iter()
            .map(|s| ResolvedFileStep::resolve(s, labels.as_ref()))
            .collect::<Result<_>>()?,
    );
    let compression: Option<Compression> =
        pipelines.layer_blob.iter().fold(None, |acc, s| match s {
            LayerBlobStep::Compress(c) => Some(*c),
            LayerBlobStep::DigestAlgo(_) => acc,
        });
    let algo = pipelines.layer_algo;

    for layer in &mut node.layers {
        match layer.flag {
            ModFlag::Deleted => continue,
            ModFlag::Added => {
                if let Some(blob) = layer.blob.clone() {
                    debug!("pushing added layer {}", layer.current_desc().digest());
                    ctx.client
                        .blob_put(&ctx.r_tgt, layer.current_desc(), blob)
                        .await?;
                }
                continue;
            }
            _ => {}
        }
        if layer.is_external() {
            continue;
        }
        let from = layer.source.clone().unwrap_or_else(|| ctx.r_src.clone());
        if !mediatype::is_tar_layer(layer.desc.media_type()) {
            // opaque artifact blobs are never rewritten, only carried over
            if !ctx.same_repo() || layer.source.is_some() {
                ctx.client.blob_copy(&from, &ctx.r_tgt, &layer.desc).await?;
            }
            continue;
        }

        let rework = compression.is_some() || algo.is_some() || !file_steps.is_empty();
        let outcome = if rework {
            let blob = ctx.client.blob_get(&from, &layer.desc).await?;
            let desc = layer.desc.clone();
            let task_steps = Arc::clone(&file_steps);
            tokio::task::spawn_blocking(move || {
                steps::layer::rework_layer(&blob, &desc, compression, algo, &task_steps)
            })
            .await
            .map_err(|e| ModError::Io(std::io::Error::other(e)))??
        } else {
            None
        };

        match outcome {
            Some(out) if out.deleted => {
                debug!("layer {} emptied, deleting", layer.desc.digest());
                layer.flag = ModFlag::Deleted;
            }
            Some(out) => {
                ctx.client
                    .blob_put(&ctx.r_tgt, &out.desc, out.blob.clone())
                    .await?;
                layer.new_desc = Some(out.desc);
                layer.new_diff_id = Some(out.diff_id);
                layer.blob = Some(out.blob);
                layer.flag.mark_replaced();
            }
            None => {
                if !ctx.same_repo() || layer.source.is_some() {
                    ctx.client.blob_copy(&from, &ctx.r_tgt, &layer.desc).await?;
                }
            }
        }
    }
    Ok(())
}
