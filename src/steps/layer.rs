//! Layer stream processing: decompress a layer tar, run every entry through
//! the file-step chain, rebuild the archive into a scratch file, recompress,
//! and hash both the compressed blob and the uncompressed tar.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use oci_spec::image::Descriptor;
use tar::EntryType;
use tracing::debug;

use crate::digest::{DigestAlgorithm, HashingWriter};
use crate::error::{ModError, Result};
use crate::mediatype::Compression;
use crate::options::{LayerFileStep, ResolvedTimestamp};

/// Per-entry outcome of the file-step chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryChange {
    Unchanged,
    Replaced,
    Deleted,
}

/// A file step with its timestamp rule resolved against the owning
/// manifest's config labels.
pub(crate) enum ResolvedFileStep {
    StripFile(String),
    Timestamp(ResolvedTimestamp),
    Reproducible,
    NestedTarTimestamp { path: String, spec: ResolvedTimestamp },
}

impl ResolvedFileStep {
    pub fn resolve(
        step: &LayerFileStep,
        labels: Option<&std::collections::HashMap<String, String>>,
    ) -> Result<Self> {
        Ok(match step {
            LayerFileStep::StripFile(p) => ResolvedFileStep::StripFile(p.clone()),
            LayerFileStep::Timestamp(spec) => {
                ResolvedFileStep::Timestamp(spec.resolve(labels)?)
            }
            LayerFileStep::Reproducible => ResolvedFileStep::Reproducible,
            LayerFileStep::NestedTarTimestamp { path, spec } => {
                ResolvedFileStep::NestedTarTimestamp {
                    path: path.clone(),
                    spec: spec.resolve(labels)?,
                }
            }
        })
    }
}

/// Result of rewriting one layer.
pub(crate) struct ReworkOutcome {
    /// The rewritten tar had no entries left.
    pub deleted: bool,
    pub blob: Bytes,
    pub desc: Descriptor,
    pub diff_id: oci_spec::image::Digest,
}

/// Rewrite a layer blob. Returns `None` when nothing changed (same
/// compression, same digest algorithm, no entry modified), in which case
/// the original blob remains valid.
pub(crate) fn rework_layer(
    blob: &[u8],
    desc: &Descriptor,
    target_compression: Option<Compression>,
    algo_override: Option<DigestAlgorithm>,
    steps: &[ResolvedFileStep],
) -> Result<Option<ReworkOutcome>> {
    let current = Compression::from_media_type(desc.media_type())?;
    let target = target_compression.unwrap_or(current);
    let current_algo = DigestAlgorithm::from_digest(desc.digest())?;
    let algo = algo_override.unwrap_or(current_algo);
    let recompress = target != current || algo != current_algo;
    if steps.is_empty() && !recompress {
        return Ok(None);
    }

    let media_type = target.relabel(desc.media_type())?;
    let mut scratch = tempfile::tempfile()?;
    let compressed_hash = HashingWriter::new(&mut scratch, algo);
    let encoder = LayerEncoder::new(compressed_hash, target)?;
    let uncompressed_hash = HashingWriter::new(encoder, algo);

    let reader = decoder(blob, current)?;
    let (entries, changed, uncompressed_hash) = if steps.is_empty() {
        let mut w = uncompressed_hash;
        let mut r = reader;
        std::io::copy(&mut r, &mut w)?;
        // entry count is irrelevant on the copy path
        (1, false, w)
    } else {
        copy_entries(reader, uncompressed_hash, steps)?
    };

    if !changed && !recompress {
        return Ok(None);
    }

    let (encoder, diff_id, _) = uncompressed_hash.finish();
    let compressed_hash = encoder.finish()?;
    let (_, digest, size) = compressed_hash.finish();

    scratch.seek(SeekFrom::Start(0))?;
    let mut out = Vec::with_capacity(size as usize);
    scratch.read_to_end(&mut out)?;
    debug!("reworked layer {}: {} -> {digest}", desc.digest(), size);

    Ok(Some(ReworkOutcome {
        deleted: entries == 0,
        blob: Bytes::from(out),
        desc: Descriptor::new(media_type, size, digest),
        diff_id,
    }))
}

/// Iterate tar entries through the step chain, re-emitting survivors.
/// Returns the surviving entry count and whether anything changed.
fn copy_entries<R: Read, W: Write>(
    reader: R,
    writer: W,
    steps: &[ResolvedFileStep],
) -> Result<(usize, bool, W)> {
    let mut archive = tar::Archive::new(reader);
    let mut builder = tar::Builder::new(writer);
    let mut kept = 0usize;
    let mut changed = false;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path: PathBuf = entry.path()?.into_owned();
        let link_name = entry.link_name()?.map(|l| l.into_owned());
        let mut header = entry.header().clone();
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;

        let mut entry_change = EntryChange::Unchanged;
        for step in steps {
            match apply_file_step(step, &mut header, &mut content, &path)? {
                EntryChange::Deleted => {
                    entry_change = EntryChange::Deleted;
                    break;
                }
                EntryChange::Replaced => entry_change = EntryChange::Replaced,
                EntryChange::Unchanged => {}
            }
        }
        match entry_change {
            EntryChange::Deleted => {
                changed = true;
                continue;
            }
            EntryChange::Replaced => changed = true,
            EntryChange::Unchanged => {}
        }

        kept += 1;
        match header.entry_type() {
            EntryType::Link | EntryType::Symlink => {
                let target = link_name.ok_or_else(|| {
                    ModError::parsing(format!("link entry {} has no target", path.display()))
                })?;
                builder.append_link(&mut header, &path, &target)?;
            }
            _ => {
                header.set_size(content.len() as u64);
                builder.append_data(&mut header, &path, content.as_slice())?;
            }
        }
    }

    let writer = builder.into_inner()?;
    Ok((kept, changed, writer))
}

fn apply_file_step(
    step: &ResolvedFileStep,
    header: &mut tar::Header,
    content: &mut Vec<u8>,
    path: &Path,
) -> Result<EntryChange> {
    match step {
        ResolvedFileStep::StripFile(prefix) => {
            if path_has_prefix(path, prefix) {
                return Ok(EntryChange::Deleted);
            }
            Ok(EntryChange::Unchanged)
        }
        ResolvedFileStep::Timestamp(spec) => {
            let mut changed = false;
            if let Ok(mtime) = header.mtime() {
                if let Some(new) = spec.adjust_epoch(mtime) {
                    header.set_mtime(new);
                    changed = true;
                }
            }
            if let Some(gnu) = header.as_gnu_mut() {
                if let Ok(atime) = gnu.atime() {
                    if let Some(new) = spec.adjust_epoch(atime) {
                        gnu.set_atime(new);
                        changed = true;
                    }
                }
                if let Ok(ctime) = gnu.ctime() {
                    if let Some(new) = spec.adjust_epoch(ctime) {
                        gnu.set_ctime(new);
                        changed = true;
                    }
                }
            }
            Ok(if changed {
                EntryChange::Replaced
            } else {
                EntryChange::Unchanged
            })
        }
        ResolvedFileStep::Reproducible => {
            let mut changed = false;
            if header.username().ok().flatten().is_some_and(|u| !u.is_empty()) {
                header
                    .set_username("")
                    .map_err(|e| ModError::parsing(format!("clearing username: {e}")))?;
                changed = true;
            }
            if header.groupname().ok().flatten().is_some_and(|g| !g.is_empty()) {
                header
                    .set_groupname("")
                    .map_err(|e| ModError::parsing(format!("clearing groupname: {e}")))?;
                changed = true;
            }
            Ok(if changed {
                EntryChange::Replaced
            } else {
                EntryChange::Unchanged
            })
        }
        ResolvedFileStep::NestedTarTimestamp { path: tar_path, spec } => {
            if !path_matches(path, tar_path) || header.entry_type() != EntryType::Regular {
                return Ok(EntryChange::Unchanged);
            }
            match rework_nested_tar(content, spec)? {
                Some(new_content) => {
                    *content = new_content;
                    header.set_size(content.len() as u64);
                    Ok(EntryChange::Replaced)
                }
                None => Ok(EntryChange::Unchanged),
            }
        }
    }
}

/// Rewrite timestamps inside a tar (optionally gzipped) stored as a layer
/// entry. Returns the rebuilt bytes when anything changed.
fn rework_nested_tar(content: &[u8], spec: &ResolvedTimestamp) -> Result<Option<Vec<u8>>> {
    let gzipped = content.starts_with(&[0x1f, 0x8b]);
    let raw = if gzipped {
        decompress_bytes(content, Compression::Gzip)?
    } else {
        content.to_vec()
    };

    let mut archive = tar::Archive::new(raw.as_slice());
    let mut builder = tar::Builder::new(Vec::new());
    let mut changed = false;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path: PathBuf = entry.path()?.into_owned();
        let link_name = entry.link_name()?.map(|l| l.into_owned());
        let mut header = entry.header().clone();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        if let Ok(mtime) = header.mtime() {
            if let Some(new) = spec.adjust_epoch(mtime) {
                header.set_mtime(new);
                changed = true;
            }
        }
        match header.entry_type() {
            EntryType::Link | EntryType::Symlink => {
                let target = link_name.ok_or_else(|| {
                    ModError::parsing(format!("link entry {} has no target", path.display()))
                })?;
                builder.append_link(&mut header, &path, &target)?;
            }
            _ => {
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, &path, data.as_slice())?;
            }
        }
    }
    if !changed {
        return Ok(None);
    }
    let rebuilt = builder.into_inner()?;
    if gzipped {
        Ok(Some(compress_bytes(&rebuilt, Compression::Gzip)?))
    } else {
        Ok(Some(rebuilt))
    }
}

/// Prefix match on normalized paths: `/layer2` matches `layer2` and
/// `layer2/nested`, not `layer20`.
fn path_has_prefix(path: &Path, prefix: &str) -> bool {
    let path = normalize(&path.to_string_lossy());
    let prefix = normalize(prefix);
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

fn path_matches(path: &Path, other: &str) -> bool {
    normalize(&path.to_string_lossy()) == normalize(other)
}

fn normalize(p: &str) -> String {
    p.trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}

enum LayerEncoder<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> LayerEncoder<W> {
    fn new(writer: W, compression: Compression) -> Result<Self> {
        Ok(match compression {
            Compression::None => LayerEncoder::Plain(writer),
            Compression::Gzip => {
                LayerEncoder::Gzip(GzEncoder::new(writer, flate2::Compression::default()))
            }
            Compression::Zstd => LayerEncoder::Zstd(zstd::stream::write::Encoder::new(
                writer,
                zstd::DEFAULT_COMPRESSION_LEVEL,
            )?),
        })
    }

    fn finish(self) -> std::io::Result<W> {
        match self {
            LayerEncoder::Plain(w) => Ok(w),
            LayerEncoder::Gzip(e) => e.finish(),
            LayerEncoder::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for LayerEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            LayerEncoder::Plain(w) => w.write(buf),
            LayerEncoder::Gzip(e) => e.write(buf),
            LayerEncoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            LayerEncoder::Plain(w) => w.flush(),
            LayerEncoder::Gzip(e) => e.flush(),
            LayerEncoder::Zstd(e) => e.flush(),
        }
    }
}

fn decoder<'a>(data: &'a [u8], compression: Compression) -> Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        Compression::None => Box::new(data),
        Compression::Gzip => Box::new(GzDecoder::new(data)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(data)?),
    })
}

pub(crate) fn compress_bytes(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let mut encoder = LayerEncoder::new(Vec::new(), compression)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub(crate) fn decompress_bytes(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    decoder(data, compression)?.read_to_end(&mut out)?;
    Ok(out)
}
