//! Media-type classification and the OCI ↔ Docker schema-2 mapping.
//!
//! The two families differ only in their media-type strings; conversion is a
//! relabel of the manifest plus each embedded descriptor.

use oci_spec::image::MediaType;

use crate::error::{ModError, Result};

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_TAR_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_LAYER_FOREIGN_TAR_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// Annotations marking Docker reference-type entries in an index.
pub const ANNOT_REF_TYPE: &str = "vnd.docker.reference.type";
pub const ANNOT_REF_DIGEST: &str = "vnd.docker.reference.digest";

pub const ANNOT_BASE_NAME: &str = "org.opencontainers.image.base.name";
pub const ANNOT_BASE_DIGEST: &str = "org.opencontainers.image.base.digest";

pub fn docker(s: &str) -> MediaType {
    MediaType::Other(s.to_string())
}

/// Parse a media-type string into the `oci_spec` enum, mapping unknown
/// strings (the whole Docker family included) to `Other`.
pub fn from_str(s: &str) -> MediaType {
    match s {
        "application/vnd.oci.descriptor.v1+json" => MediaType::Descriptor,
        "application/vnd.oci.image.index.v1+json" => MediaType::ImageIndex,
        "application/vnd.oci.image.manifest.v1+json" => MediaType::ImageManifest,
        "application/vnd.oci.image.config.v1+json" => MediaType::ImageConfig,
        "application/vnd.oci.image.layer.v1.tar" => MediaType::ImageLayer,
        "application/vnd.oci.image.layer.v1.tar+gzip" => MediaType::ImageLayerGzip,
        "application/vnd.oci.image.layer.v1.tar+zstd" => MediaType::ImageLayerZstd,
        "application/vnd.oci.image.layer.nondistributable.v1.tar" => {
            MediaType::ImageLayerNonDistributable
        }
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip" => {
            MediaType::ImageLayerNonDistributableGzip
        }
        "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd" => {
            MediaType::ImageLayerNonDistributableZstd
        }
        other => MediaType::Other(other.to_string()),
    }
}

pub fn is_index(s: &str) -> bool {
    s == MediaType::ImageIndex.to_string() || s == DOCKER_MANIFEST_LIST
}

pub fn is_image_manifest(s: &str) -> bool {
    s == MediaType::ImageManifest.to_string() || s == DOCKER_MANIFEST
}

/// Media types the graph builder fetches and parses as an image config.
pub fn is_image_config(mt: &MediaType) -> bool {
    *mt == MediaType::ImageConfig || mt.to_string() == DOCKER_CONFIG
}

/// Tar-based layer types the layer phase knows how to open.
pub fn is_tar_layer(mt: &MediaType) -> bool {
    matches!(
        mt,
        MediaType::ImageLayer
            | MediaType::ImageLayerGzip
            | MediaType::ImageLayerZstd
            | MediaType::ImageLayerNonDistributable
            | MediaType::ImageLayerNonDistributableGzip
            | MediaType::ImageLayerNonDistributableZstd
    ) || matches!(
        mt.to_string().as_str(),
        DOCKER_LAYER_TAR_GZIP | DOCKER_LAYER_FOREIGN_TAR_GZIP
    )
}

/// Map a layer media type to its OCI counterpart. Unknown types pass through.
pub fn layer_to_oci(mt: &MediaType) -> MediaType {
    match mt.to_string().as_str() {
        DOCKER_LAYER_TAR_GZIP => MediaType::ImageLayerGzip,
        DOCKER_LAYER_FOREIGN_TAR_GZIP => MediaType::ImageLayerNonDistributableGzip,
        _ => mt.clone(),
    }
}

/// Map a layer media type to its Docker counterpart.
pub fn layer_to_docker(mt: &MediaType) -> Result<MediaType> {
    match mt {
        MediaType::ImageLayerGzip => Ok(docker(DOCKER_LAYER_TAR_GZIP)),
        MediaType::ImageLayerNonDistributableGzip => Ok(docker(DOCKER_LAYER_FOREIGN_TAR_GZIP)),
        MediaType::ImageLayer | MediaType::ImageLayerZstd => Err(ModError::invalid_input(format!(
            "layer media type {mt} has no docker equivalent"
        ))),
        _ => Ok(mt.clone()),
    }
}

/// Map a foreign (external-URL) layer type back to its distributable variant.
pub fn layer_unforeign(mt: &MediaType) -> MediaType {
    match mt {
        MediaType::ImageLayerNonDistributable => MediaType::ImageLayer,
        MediaType::ImageLayerNonDistributableGzip => MediaType::ImageLayerGzip,
        MediaType::ImageLayerNonDistributableZstd => MediaType::ImageLayerZstd,
        other => match other.to_string().as_str() {
            DOCKER_LAYER_FOREIGN_TAR_GZIP => docker(DOCKER_LAYER_TAR_GZIP),
            _ => other.clone(),
        },
    }
}

/// Compression applied to a layer blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn from_media_type(mt: &MediaType) -> Result<Compression> {
        match mt {
            MediaType::ImageLayer | MediaType::ImageLayerNonDistributable => Ok(Compression::None),
            MediaType::ImageLayerGzip | MediaType::ImageLayerNonDistributableGzip => {
                Ok(Compression::Gzip)
            }
            MediaType::ImageLayerZstd | MediaType::ImageLayerNonDistributableZstd => {
                Ok(Compression::Zstd)
            }
            other => match other.to_string().as_str() {
                DOCKER_LAYER_TAR_GZIP | DOCKER_LAYER_FOREIGN_TAR_GZIP => Ok(Compression::Gzip),
                s => Err(ModError::unsupported_media_type(format!(
                    "{s} is not a tar layer"
                ))),
            },
        }
    }

    /// The media type a layer takes after recompression.
    pub fn relabel(&self, mt: &MediaType) -> Result<MediaType> {
        let oci = match mt {
            MediaType::ImageLayer | MediaType::ImageLayerGzip | MediaType::ImageLayerZstd => {
                match self {
                    Compression::None => MediaType::ImageLayer,
                    Compression::Gzip => MediaType::ImageLayerGzip,
                    Compression::Zstd => MediaType::ImageLayerZstd,
                }
            }
            MediaType::ImageLayerNonDistributable
            | MediaType::ImageLayerNonDistributableGzip
            | MediaType::ImageLayerNonDistributableZstd => match self {
                Compression::None => MediaType::ImageLayerNonDistributable,
                Compression::Gzip => MediaType::ImageLayerNonDistributableGzip,
                Compression::Zstd => MediaType::ImageLayerNonDistributableZstd,
            },
            other => match other.to_string().as_str() {
                DOCKER_LAYER_TAR_GZIP | DOCKER_LAYER_FOREIGN_TAR_GZIP => match self {
                    Compression::Gzip => other.clone(),
                    _ => {
                        return Err(ModError::invalid_input(format!(
                            "docker layers only support gzip, not {self:?}"
                        )))
                    }
                },
                s => {
                    return Err(ModError::unsupported_media_type(format!(
                        "{s} is not a tar layer"
                    )))
                }
            },
        };
        Ok(oci)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_layer_maps_to_oci() {
        assert_eq!(
            layer_to_oci(&docker(DOCKER_LAYER_TAR_GZIP)),
            MediaType::ImageLayerGzip
        );
        assert_eq!(
            layer_to_oci(&docker(DOCKER_LAYER_FOREIGN_TAR_GZIP)),
            MediaType::ImageLayerNonDistributableGzip
        );
        // already OCI: untouched
        assert_eq!(layer_to_oci(&MediaType::ImageLayerZstd), MediaType::ImageLayerZstd);
    }

    #[test]
    fn test_oci_layer_maps_to_docker() {
        assert_eq!(
            layer_to_docker(&MediaType::ImageLayerGzip).unwrap(),
            docker(DOCKER_LAYER_TAR_GZIP)
        );
        assert!(layer_to_docker(&MediaType::ImageLayerZstd).is_err());
    }

    #[test]
    fn test_compression_detection() {
        assert_eq!(
            Compression::from_media_type(&MediaType::ImageLayerGzip).unwrap(),
            Compression::Gzip
        );
        assert_eq!(
            Compression::from_media_type(&docker(DOCKER_LAYER_TAR_GZIP)).unwrap(),
            Compression::Gzip
        );
        assert!(matches!(
            Compression::from_media_type(&MediaType::ImageConfig),
            Err(ModError::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn test_relabel_preserves_distributability() {
        assert_eq!(
            Compression::Zstd
                .relabel(&MediaType::ImageLayerNonDistributableGzip)
                .unwrap(),
            MediaType::ImageLayerNonDistributableZstd
        );
        assert!(Compression::Zstd.relabel(&docker(DOCKER_LAYER_TAR_GZIP)).is_err());
    }

    #[test]
    fn test_unforeign() {
        assert_eq!(
            layer_unforeign(&docker(DOCKER_LAYER_FOREIGN_TAR_GZIP)),
            docker(DOCKER_LAYER_TAR_GZIP)
        );
        assert_eq!(
            layer_unforeign(&MediaType::ImageLayerNonDistributableZstd),
            MediaType::ImageLayerZstd
        );
    }
}
