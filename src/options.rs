//! The mutation catalog: each `with_*` constructor yields a [`ModOption`]
//! that, at registration time, appends one or more steps to the four
//! per-phase pipelines. Options compose; steps within a phase run in
//! registration order.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use oci_spec::image::{Descriptor, Digest, MediaType, Platform};
use regex::Regex;

use crate::dag::platform_string;
use crate::digest::DigestAlgorithm;
use crate::error::{ModError, Result};
use crate::mediatype::Compression;
use crate::reference::ImageRef;
use crate::steps::layer::compress_bytes;

/// A single declarative edit, constructed by one of the `with_*` functions.
pub struct ModOption(pub(crate) OptKind);

pub(crate) enum OptKind {
    Manifest(ManifestStep),
    Config(ConfigStep),
    LayerBlob(LayerBlobStep),
    LayerFile(LayerFileStep),
    DataMaxSize(i64),
    TargetRef(ImageRef),
}

pub(crate) enum ManifestStep {
    Annotation {
        selector: PlatformSelector,
        key: String,
        value: Option<String>,
    },
    AnnotationPromote,
    AnnotationBase {
        name: String,
        digest: Option<String>,
    },
    LabelToAnnotation,
    ToOci,
    ToDocker,
    ToOciReferrers,
    ExternalUrlsRm,
    DigestAlgo(DigestAlgorithm),
    LayerRmIndex(usize),
    LayerRmCreatedBy(Regex),
    LayerAdd {
        blob: Bytes,
        desc: Descriptor,
        diff_id: Digest,
        platforms: Option<Vec<String>>,
    },
    Rebase(RebaseSource),
}

pub(crate) enum ConfigStep {
    Label {
        selector: PlatformSelector,
        key: String,
        value: Option<String>,
    },
    Cmd(Option<Vec<String>>),
    Entrypoint(Option<Vec<String>>),
    ExposedPorts(Option<Vec<String>>),
    Volumes(Option<Vec<String>>),
    Platform {
        os: String,
        architecture: String,
        variant: Option<String>,
    },
    Timestamp(TimestampSpec),
    BuildArgRm {
        name: String,
        value: Option<Regex>,
    },
    DigestAlgo(DigestAlgorithm),
}

pub(crate) enum LayerBlobStep {
    Compress(Compression),
    DigestAlgo(DigestAlgorithm),
}

pub(crate) enum LayerFileStep {
    StripFile(String),
    Timestamp(TimestampSpec),
    Reproducible,
    NestedTarTimestamp { path: String, spec: TimestampSpec },
}

#[derive(Clone)]
pub(crate) enum RebaseSource {
    Annotations,
    Refs { old: ImageRef, new: ImageRef },
}

/// Timestamp rewrite rule: values later than `after` (or all values, when
/// `after` is unset) are replaced with `set`. `from_label` resolves `set`
/// from a named config label at run time.
///
/// The deprecated "cap at t" shape maps to `{set: t, after: t}`.
#[derive(Clone, Debug, Default)]
pub struct TimestampSpec {
    pub set: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub from_label: Option<String>,
}

impl TimestampSpec {
    pub fn cap(t: DateTime<Utc>) -> Self {
        TimestampSpec {
            set: Some(t),
            after: Some(t),
            from_label: None,
        }
    }

    /// Resolve `from_label` against a config's labels, yielding the
    /// effective rule. Errors when the label is missing or not RFC3339.
    pub(crate) fn resolve(
        &self,
        labels: Option<&std::collections::HashMap<String, String>>,
    ) -> Result<ResolvedTimestamp> {
        let set = match &self.from_label {
            Some(label) => {
                let value = labels
                    .and_then(|l| l.get(label))
                    .ok_or_else(|| {
                        ModError::not_found(format!("timestamp label {label} not found"))
                    })?;
                DateTime::parse_from_rfc3339(value)
                    .map_err(|e| {
                        ModError::parsing(format!("label {label} is not RFC3339: {e}"))
                    })?
                    .with_timezone(&Utc)
            }
            None => self
                .set
                .ok_or_else(|| ModError::invalid_input("timestamp option without a value"))?,
        };
        Ok(ResolvedTimestamp {
            set,
            after: self.after,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolvedTimestamp {
    pub set: DateTime<Utc>,
    pub after: Option<DateTime<Utc>>,
}

impl ResolvedTimestamp {
    fn applies(&self, t: DateTime<Utc>) -> bool {
        t != self.set && self.after.map_or(true, |after| t > after)
    }

    /// Rewrite an RFC3339 timestamp, returning the new value when changed.
    pub fn adjust_rfc3339(&self, ts: &str) -> Result<Option<String>> {
        let t = DateTime::parse_from_rfc3339(ts)?.with_timezone(&Utc);
        Ok(self
            .applies(t)
            .then(|| self.set.to_rfc3339_opts(SecondsFormat::Secs, true)))
    }

    /// Rewrite a Unix-seconds timestamp, returning the new value when changed.
    pub fn adjust_epoch(&self, secs: u64) -> Option<u64> {
        let t = DateTime::from_timestamp(secs as i64, 0)?;
        self.applies(t).then(|| self.set.timestamp().max(0) as u64)
    }
}

/// Which manifests a scoped option applies to.
#[derive(Clone, Debug)]
pub(crate) enum PlatformSelector {
    /// No selector prefix: the top-level manifest only.
    Top,
    /// `[*]`: every manifest in the tree.
    All,
    /// `[p1,p2]`: manifests whose platform matches one of the entries.
    Platforms(Vec<String>),
}

impl PlatformSelector {
    /// Split an optionally scoped name, e.g. `[linux/amd64,linux/arm64]key`.
    pub fn parse_scoped(name: &str) -> Result<(PlatformSelector, String)> {
        let Some(rest) = name.strip_prefix('[') else {
            return Ok((PlatformSelector::Top, name.to_string()));
        };
        let (list, key) = rest.split_once(']').ok_or_else(|| {
            ModError::invalid_input(format!("platform selector in {name:?} is not terminated"))
        })?;
        if key.is_empty() {
            return Err(ModError::invalid_input(format!(
                "platform selector {name:?} has no name after it"
            )));
        }
        let entries: Vec<String> = list
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if entries.is_empty() {
            return Err(ModError::invalid_input(format!(
                "platform selector in {name:?} is empty"
            )));
        }
        if entries.iter().any(|p| p == "*") {
            return Ok((PlatformSelector::All, key.to_string()));
        }
        Ok((PlatformSelector::Platforms(entries), key.to_string()))
    }

    pub fn matches(&self, top: bool, platform: Option<&Platform>) -> bool {
        match self {
            PlatformSelector::Top => top,
            PlatformSelector::All => true,
            PlatformSelector::Platforms(list) => {
                let Some(p) = platform else { return false };
                list.iter().any(|sel| platform_matches(sel, p))
            }
        }
    }
}

pub(crate) fn platform_matches(selector: &str, p: &Platform) -> bool {
    let full = platform_string(p);
    if selector == full {
        return true;
    }
    // A two-part selector matches any variant of the same os/arch.
    selector.matches('/').count() == 1 && full.starts_with(&format!("{selector}/"))
}

/// Set (`value = Some`) or delete (`value = None`) a manifest annotation.
/// The name may carry a platform selector prefix: `[p1,p2]name`, with `*`
/// selecting every manifest; without a prefix the top manifest is targeted.
pub fn with_annotation(name: &str, value: Option<&str>) -> Result<ModOption> {
    let (selector, key) = PlatformSelector::parse_scoped(name)?;
    Ok(ModOption(OptKind::Manifest(ManifestStep::Annotation {
        selector,
        key,
        value: value.map(str::to_string),
    })))
}

/// Promote annotations shared by every child of an index up to the index.
pub fn with_annotation_promote() -> ModOption {
    ModOption(OptKind::Manifest(ManifestStep::AnnotationPromote))
}

/// Record the base image in the standard OCI base-image annotations.
pub fn with_annotation_oci_base(base: &ImageRef, digest: Option<&Digest>) -> ModOption {
    ModOption(OptKind::Manifest(ManifestStep::AnnotationBase {
        name: base.to_string(),
        digest: digest.map(|d| d.to_string()),
    }))
}

/// Copy config labels onto the manifest's annotations.
pub fn with_label_to_annotation() -> ModOption {
    ModOption(OptKind::Manifest(ManifestStep::LabelToAnnotation))
}

/// Set (`value = Some`) or delete (`value = None`) a config label. The name
/// accepts the same platform selector prefix as [`with_annotation`].
pub fn with_label(name: &str, value: Option<&str>) -> Result<ModOption> {
    let (selector, key) = PlatformSelector::parse_scoped(name)?;
    Ok(ModOption(OptKind::Config(ConfigStep::Label {
        selector,
        key,
        value: value.map(str::to_string),
    })))
}

/// Convert the manifest tree to the OCI media-type family.
pub fn with_manifest_to_oci() -> ModOption {
    ModOption(OptKind::Manifest(ManifestStep::ToOci))
}

/// Convert the manifest tree to the Docker schema-2 media-type family.
pub fn with_manifest_to_docker() -> ModOption {
    ModOption(OptKind::Manifest(ManifestStep::ToDocker))
}

/// Convert Docker reference-type index entries into OCI subject/referrer
/// relationships. Register this before other structural edits; it changes
/// the index's child list.
pub fn with_manifest_to_oci_referrers() -> ModOption {
    ModOption(OptKind::Manifest(ManifestStep::ToOciReferrers))
}

/// Strip external URL lists from foreign layers and relabel their media
/// types to the distributable variants.
pub fn with_external_urls_rm() -> ModOption {
    ModOption(OptKind::Manifest(ManifestStep::ExternalUrlsRm))
}

/// Re-hash manifests with the given digest algorithm.
pub fn with_manifest_digest_algorithm(algo: DigestAlgorithm) -> ModOption {
    ModOption(OptKind::Manifest(ManifestStep::DigestAlgo(algo)))
}

/// Re-hash configs with the given digest algorithm.
pub fn with_config_digest_algorithm(algo: DigestAlgorithm) -> ModOption {
    ModOption(OptKind::Config(ConfigStep::DigestAlgo(algo)))
}

/// Re-hash (and rewrite) layers with the given digest algorithm.
pub fn with_layer_digest_algorithm(algo: DigestAlgorithm) -> ModOption {
    ModOption(OptKind::LayerBlob(LayerBlobStep::DigestAlgo(algo)))
}

/// Set (`Some`) or clear (`None`) the config command.
pub fn with_config_cmd(cmd: Option<Vec<String>>) -> ModOption {
    ModOption(OptKind::Config(ConfigStep::Cmd(cmd)))
}

/// Set (`Some`) or clear (`None`) the config entrypoint.
pub fn with_config_entrypoint(entrypoint: Option<Vec<String>>) -> ModOption {
    ModOption(OptKind::Config(ConfigStep::Entrypoint(entrypoint)))
}

/// Set (`Some`) or clear (`None`) the exposed ports.
pub fn with_config_exposed_ports(ports: Option<Vec<String>>) -> ModOption {
    ModOption(OptKind::Config(ConfigStep::ExposedPorts(ports)))
}

/// Set (`Some`) or clear (`None`) the volume list.
pub fn with_config_volumes(volumes: Option<Vec<String>>) -> ModOption {
    ModOption(OptKind::Config(ConfigStep::Volumes(volumes)))
}

/// Override the config platform.
pub fn with_config_platform(os: &str, architecture: &str, variant: Option<&str>) -> ModOption {
    ModOption(OptKind::Config(ConfigStep::Platform {
        os: os.to_string(),
        architecture: architecture.to_string(),
        variant: variant.map(str::to_string),
    }))
}

/// Rewrite the config `created` timestamp and each history entry's
/// `created` per the given rule.
pub fn with_config_timestamp(spec: TimestampSpec) -> Result<ModOption> {
    if spec.set.is_none() && spec.from_label.is_none() {
        return Err(ModError::invalid_input(
            "config timestamp option needs a value or a label",
        ));
    }
    Ok(ModOption(OptKind::Config(ConfigStep::Timestamp(spec))))
}

/// Cap config and history timestamps at `t`.
#[deprecated(note = "use with_config_timestamp with TimestampSpec::cap")]
pub fn with_config_timestamp_max(t: DateTime<Utc>) -> ModOption {
    ModOption(OptKind::Config(ConfigStep::Timestamp(TimestampSpec::cap(t))))
}

/// Remove build-arg history entries for `name`, optionally requiring the
/// value to match a pattern.
pub fn with_build_arg_rm(name: &str, value_pattern: Option<&str>) -> Result<ModOption> {
    let value = value_pattern
        .map(Regex::new)
        .transpose()
        .map_err(|e| ModError::invalid_input(format!("build arg pattern: {e}")))?;
    Ok(ModOption(OptKind::Config(ConfigStep::BuildArgRm {
        name: name.to_string(),
        value,
    })))
}

/// Remove files whose path starts with `path` from every layer.
pub fn with_layer_strip_file(path: &str) -> ModOption {
    ModOption(OptKind::LayerFile(LayerFileStep::StripFile(
        path.to_string(),
    )))
}

/// Rewrite file timestamps in every layer per the given rule.
pub fn with_layer_timestamp(spec: TimestampSpec) -> Result<ModOption> {
    if spec.set.is_none() && spec.from_label.is_none() {
        return Err(ModError::invalid_input(
            "layer timestamp option needs a value or a label",
        ));
    }
    Ok(ModOption(OptKind::LayerFile(LayerFileStep::Timestamp(spec))))
}

/// Cap file timestamps in every layer at `t`.
#[deprecated(note = "use with_layer_timestamp with TimestampSpec::cap")]
pub fn with_layer_timestamp_max(t: DateTime<Utc>) -> ModOption {
    ModOption(OptKind::LayerFile(LayerFileStep::Timestamp(
        TimestampSpec::cap(t),
    )))
}

/// Clear user and group names from layer tar headers.
pub fn with_layer_reproducible() -> ModOption {
    ModOption(OptKind::LayerFile(LayerFileStep::Reproducible))
}

/// Remove the layer at `index`. Requires a single-platform image manifest.
pub fn with_layer_rm_index(index: usize) -> ModOption {
    ModOption(OptKind::Manifest(ManifestStep::LayerRmIndex(index)))
}

/// Remove layers whose history `created_by` matches `pattern`.
pub fn with_layer_rm_created_by(pattern: &str) -> Result<ModOption> {
    let re = Regex::new(pattern)
        .map_err(|e| ModError::invalid_input(format!("created_by pattern: {e}")))?;
    Ok(ModOption(OptKind::Manifest(ManifestStep::LayerRmCreatedBy(
        re,
    ))))
}

/// Recompress every layer to the given compression, updating media types.
pub fn with_layer_compression(compression: Compression) -> ModOption {
    ModOption(OptKind::LayerBlob(LayerBlobStep::Compress(compression)))
}

/// Append an uncompressed tar as a new gzip layer, optionally limited to
/// manifests matching one of the given platforms.
pub fn with_layer_add_tar(tar: Bytes, platforms: Option<Vec<String>>) -> Result<ModOption> {
    let diff_id = DigestAlgorithm::Sha256.digest(&tar);
    let blob = compress_bytes(&tar, Compression::Gzip)?;
    let desc = Descriptor::new(
        MediaType::ImageLayerGzip,
        blob.len() as u64,
        DigestAlgorithm::Sha256.digest(&blob),
    );
    Ok(ModOption(OptKind::Manifest(ManifestStep::LayerAdd {
        blob: Bytes::from(blob),
        desc,
        diff_id,
        platforms,
    })))
}

/// Rewrite timestamps inside a tar file stored within a layer (for example
/// a bundled `rootfs.tar`).
pub fn with_file_tar_time(path: &str, spec: TimestampSpec) -> Result<ModOption> {
    if spec.set.is_none() && spec.from_label.is_none() {
        return Err(ModError::invalid_input(
            "nested tar timestamp option needs a value or a label",
        ));
    }
    Ok(ModOption(OptKind::LayerFile(
        LayerFileStep::NestedTarTimestamp {
            path: path.to_string(),
            spec,
        },
    )))
}

/// Replace the image's base layers, discovering the old and new base from
/// the standard base-image annotations.
pub fn with_rebase() -> ModOption {
    ModOption(OptKind::Manifest(ManifestStep::Rebase(
        RebaseSource::Annotations,
    )))
}

/// Replace the image's base layers, from `old` to `new`.
pub fn with_rebase_refs(old: ImageRef, new: ImageRef) -> ModOption {
    ModOption(OptKind::Manifest(ManifestStep::Rebase(RebaseSource::Refs {
        old,
        new,
    })))
}

/// Maximum inline `data` size per descriptor. Larger fields are stripped,
/// smaller ones populated from blob content. The default of −1 preserves
/// existing fields and never adds new ones.
pub fn with_data_max_size(size: i64) -> ModOption {
    ModOption(OptKind::DataMaxSize(size))
}

/// Push the result to a different repository or tag.
pub fn with_target_ref(target: ImageRef) -> ModOption {
    ModOption(OptKind::TargetRef(target))
}

/// The four phase pipelines plus engine-wide settings, assembled from the
/// caller's options in registration order.
pub(crate) struct Pipelines {
    pub manifest: Vec<ManifestStep>,
    pub config: Vec<ConfigStep>,
    pub layer_blob: Vec<LayerBlobStep>,
    pub layer_file: Vec<LayerFileStep>,
    pub data_max: i64,
    pub target: Option<ImageRef>,
    pub manifest_algo: Option<DigestAlgorithm>,
    pub config_algo: Option<DigestAlgorithm>,
    pub layer_algo: Option<DigestAlgorithm>,
    pub force_layer_walk: bool,
}

impl Default for Pipelines {
    fn default() -> Self {
        Pipelines {
            manifest: Vec::new(),
            config: Vec::new(),
            layer_blob: Vec::new(),
            layer_file: Vec::new(),
            data_max: -1,
            target: None,
            manifest_algo: None,
            config_algo: None,
            layer_algo: None,
            force_layer_walk: false,
        }
    }
}

impl Pipelines {
    pub fn register(&mut self, opt: ModOption) {
        match opt.0 {
            OptKind::Manifest(step) => {
                match &step {
                    ManifestStep::DigestAlgo(algo) => self.manifest_algo = Some(*algo),
                    ManifestStep::Rebase(_) | ManifestStep::LayerAdd { .. } => {
                        self.force_layer_walk = true
                    }
                    _ => {}
                }
                self.manifest.push(step);
            }
            OptKind::Config(step) => {
                if let ConfigStep::DigestAlgo(algo) = &step {
                    self.config_algo = Some(*algo);
                }
                self.config.push(step);
            }
            OptKind::LayerBlob(step) => {
                if let LayerBlobStep::DigestAlgo(algo) = &step {
                    self.layer_algo = Some(*algo);
                }
                self.layer_blob.push(step);
            }
            OptKind::LayerFile(step) => self.layer_file.push(step),
            OptKind::DataMaxSize(size) => self.data_max = size,
            OptKind::TargetRef(r) => self.target = Some(r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_selector_parsing() {
        let (sel, key) = PlatformSelector::parse_scoped("name").unwrap();
        assert!(matches!(sel, PlatformSelector::Top));
        assert_eq!(key, "name");

        let (sel, key) = PlatformSelector::parse_scoped("[*]name").unwrap();
        assert!(matches!(sel, PlatformSelector::All));
        assert_eq!(key, "name");

        let (sel, key) =
            PlatformSelector::parse_scoped("[linux/amd64, linux/arm64]org.example.k").unwrap();
        match sel {
            PlatformSelector::Platforms(p) => {
                assert_eq!(p, vec!["linux/amd64", "linux/arm64"])
            }
            _ => panic!("expected platform list"),
        }
        assert_eq!(key, "org.example.k");
    }

    #[test]
    fn test_selector_malformed() {
        assert!(matches!(
            PlatformSelector::parse_scoped("[linux/amd64name"),
            Err(ModError::InvalidInput(_))
        ));
        assert!(matches!(
            PlatformSelector::parse_scoped("[]name"),
            Err(ModError::InvalidInput(_))
        ));
        assert!(matches!(
            PlatformSelector::parse_scoped("[linux/amd64]"),
            Err(ModError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_timestamp_cap_semantics() {
        let cap = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let resolved = TimestampSpec::cap(cap).resolve(None).unwrap();

        // later than the cap: rewritten
        assert_eq!(
            resolved.adjust_rfc3339("2022-06-01T10:00:00Z").unwrap(),
            Some("2020-01-01T00:00:00Z".to_string())
        );
        // earlier: untouched
        assert_eq!(resolved.adjust_rfc3339("2019-01-01T00:00:00Z").unwrap(), None);
        // equal: untouched
        assert_eq!(resolved.adjust_rfc3339("2020-01-01T00:00:00Z").unwrap(), None);
    }

    #[test]
    fn test_timestamp_set_without_after_rewrites_everything() {
        let t = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let resolved = TimestampSpec {
            set: Some(t),
            after: None,
            from_label: None,
        }
        .resolve(None)
        .unwrap();
        assert!(resolved.adjust_rfc3339("1999-01-01T00:00:00Z").unwrap().is_some());
        assert_eq!(resolved.adjust_epoch(0), Some(t.timestamp() as u64));
    }

    #[test]
    fn test_timestamp_from_label() {
        let mut labels = std::collections::HashMap::new();
        labels.insert(
            "org.example.released".to_string(),
            "2021-03-04T05:06:07Z".to_string(),
        );
        let spec = TimestampSpec {
            set: None,
            after: None,
            from_label: Some("org.example.released".to_string()),
        };
        let resolved = spec.resolve(Some(&labels)).unwrap();
        assert_eq!(
            resolved.set,
            Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap()
        );
        assert!(matches!(
            spec.resolve(None),
            Err(ModError::NotFound(_))
        ));
    }
}
