//! Declarative modification engine for OCI and Docker images.
//!
//! [`apply`] fetches an image into an in-memory DAG of manifests, configs,
//! and layers, runs the registered mutation options over four ordered
//! pipelines (manifest, config, layer blob, layer file), and writes the
//! result back with new content-addressed identifiers. A file change ripples
//! outward: layer digest, diff-id, config digest, manifest digest, index
//! digest.
//!
//! ```no_run
//! # async fn run() -> miette::Result<()> {
//! use ocimod::{apply, with_annotation, with_config_timestamp, TimestampSpec};
//!
//! let client = ocimod::OciDirClient::new(".");
//! let src: ocimod::ImageRef = "ocidir://testrepo:v1".parse()?;
//! let cap = chrono::Utc::now();
//! let target = apply(
//!     &client,
//!     &src,
//!     vec![
//!         with_annotation("org.example.reviewed", Some("true"))?,
//!         with_config_timestamp(TimestampSpec::cap(cap))?,
//!     ],
//! )
//! .await?;
//! println!("pushed {target}");
//! # Ok(())
//! # }
//! ```

mod apply;
mod client;
mod dag;
mod digest;
mod error;
mod manifest;
mod mediatype;
mod ocidir;
mod options;
mod rebase;
mod reference;
mod registry;
mod steps;
mod writer;

pub use apply::{apply, SOURCE_DATE_EPOC};
pub use client::RegistryClient;
pub use dag::{ConfigNode, LayerNode, ManifestNode, ModFlag};
pub use digest::DigestAlgorithm;
pub use error::{ModError, Result};
pub use manifest::{Manifest, ManifestBody};
pub use mediatype::Compression;
pub use ocidir::OciDirClient;
pub use options::{
    with_annotation, with_annotation_oci_base, with_annotation_promote, with_build_arg_rm,
    with_config_cmd, with_config_digest_algorithm, with_config_entrypoint,
    with_config_exposed_ports, with_config_platform, with_config_timestamp, with_config_volumes,
    with_data_max_size, with_external_urls_rm, with_file_tar_time, with_label,
    with_label_to_annotation, with_layer_add_tar, with_layer_compression,
    with_layer_digest_algorithm, with_layer_reproducible, with_layer_rm_created_by,
    with_layer_rm_index, with_layer_strip_file, with_layer_timestamp,
    with_manifest_digest_algorithm, with_manifest_to_docker, with_manifest_to_oci,
    with_manifest_to_oci_referrers, with_rebase, with_rebase_refs, with_target_ref, ModOption,
    TimestampSpec,
};
#[allow(deprecated)]
pub use options::{with_config_timestamp_max, with_layer_timestamp_max};
pub use reference::{ImageRef, RefScheme, TagName};
pub use registry::{HttpRegistryClient, RegistryAuth};
