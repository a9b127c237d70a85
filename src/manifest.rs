//! Manifest wrapper over `oci_spec` image manifests and indexes.
//!
//! A [`Manifest`] keeps the raw bytes it was fetched as next to the decoded
//! body. Unchanged documents are re-pushed byte for byte so their digest
//! never drifts; mutated documents are re-serialized through the canonical
//! encoding and re-hashed.

use std::collections::HashMap;

use bytes::Bytes;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};

use crate::digest::{canonical_json, DigestAlgorithm};
use crate::error::{ModError, Result};
use crate::mediatype;

#[derive(Clone, Debug)]
pub enum ManifestBody {
    Image(ImageManifest),
    Index(ImageIndex),
}

#[derive(Clone, Debug)]
pub struct Manifest {
    body: ManifestBody,
    raw: Bytes,
    desc: Descriptor,
}

impl Manifest {
    /// Parse raw manifest bytes with a descriptor already in hand (from an
    /// index entry, a referrer list, or response headers).
    pub fn parse(raw: Bytes, desc: Descriptor) -> Result<Self> {
        let body = parse_body(&raw, &desc.media_type().to_string())?;
        Ok(Manifest { body, raw, desc })
    }

    /// Parse raw manifest bytes given only a media-type string, computing a
    /// sha256 descriptor from the bytes.
    pub fn parse_with_media_type(raw: Bytes, media_type: &str) -> Result<Self> {
        let body = parse_body(&raw, media_type)?;
        let digest = DigestAlgorithm::Sha256.digest(&raw);
        let desc = Descriptor::new(mediatype::from_str(media_type), raw.len() as u64, digest);
        Ok(Manifest { body, raw, desc })
    }

    /// Wrap a freshly built body, serializing it canonically.
    pub fn from_body(body: ManifestBody) -> Result<Self> {
        let raw = match &body {
            ManifestBody::Image(m) => canonical_json(m)?,
            ManifestBody::Index(i) => canonical_json(i)?,
        };
        let digest = DigestAlgorithm::Sha256.digest(&raw);
        let media = body_media_type(&body);
        let desc = Descriptor::new(media, raw.len() as u64, digest);
        Ok(Manifest {
            body,
            raw: Bytes::from(raw),
            desc,
        })
    }

    pub fn body(&self) -> &ManifestBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut ManifestBody {
        &mut self.body
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn is_index(&self) -> bool {
        matches!(self.body, ManifestBody::Index(_))
    }

    pub fn as_image(&self) -> Result<&ImageManifest> {
        match &self.body {
            ManifestBody::Image(m) => Ok(m),
            ManifestBody::Index(_) => Err(ModError::unsupported_media_type(
                "expected an image manifest, found an index",
            )),
        }
    }

    pub fn as_image_mut(&mut self) -> Result<&mut ImageManifest> {
        match &mut self.body {
            ManifestBody::Image(m) => Ok(m),
            ManifestBody::Index(_) => Err(ModError::unsupported_media_type(
                "expected an image manifest, found an index",
            )),
        }
    }

    pub fn as_index(&self) -> Result<&ImageIndex> {
        match &self.body {
            ManifestBody::Index(i) => Ok(i),
            ManifestBody::Image(_) => Err(ModError::unsupported_media_type(
                "expected an index, found an image manifest",
            )),
        }
    }

    pub fn as_index_mut(&mut self) -> Result<&mut ImageIndex> {
        match &mut self.body {
            ManifestBody::Index(i) => Ok(i),
            ManifestBody::Image(_) => Err(ModError::unsupported_media_type(
                "expected an index, found an image manifest",
            )),
        }
    }

    pub fn media_type(&self) -> MediaType {
        body_media_type(&self.body)
    }

    pub fn artifact_type(&self) -> Option<&MediaType> {
        match &self.body {
            ManifestBody::Image(m) => m.artifact_type().as_ref(),
            ManifestBody::Index(i) => i.artifact_type().as_ref(),
        }
    }

    pub fn subject(&self) -> Option<&Descriptor> {
        match &self.body {
            ManifestBody::Image(m) => m.subject().as_ref(),
            ManifestBody::Index(i) => i.subject().as_ref(),
        }
    }

    pub fn set_subject(&mut self, subject: Option<Descriptor>) {
        match &mut self.body {
            ManifestBody::Image(m) => {
                m.set_subject(subject);
            }
            ManifestBody::Index(i) => {
                i.set_subject(subject);
            }
        };
    }

    pub fn annotations(&self) -> Option<&HashMap<String, String>> {
        match &self.body {
            ManifestBody::Image(m) => m.annotations().as_ref(),
            ManifestBody::Index(i) => i.annotations().as_ref(),
        }
    }

    /// Set (`Some`) or delete (`None`) a single annotation. Returns whether
    /// the map actually changed.
    pub fn set_annotation(&mut self, key: &str, value: Option<&str>) -> bool {
        let mut map = self.annotations().cloned().unwrap_or_default();
        let changed = match value {
            Some(v) => map.insert(key.to_string(), v.to_string()).as_deref() != Some(v),
            None => map.remove(key).is_some(),
        };
        if changed {
            let map = (!map.is_empty()).then_some(map);
            match &mut self.body {
                ManifestBody::Image(m) => {
                    m.set_annotations(map);
                }
                ManifestBody::Index(i) => {
                    i.set_annotations(map);
                }
            };
        }
        changed
    }

    /// Re-serialize a mutated body and recompute the descriptor with the
    /// given digest algorithm. Platform and annotations on the descriptor
    /// are preserved; media type, digest, and size track the body.
    pub fn refresh(&mut self, algo: DigestAlgorithm) -> Result<()> {
        let raw = match &self.body {
            ManifestBody::Image(m) => canonical_json(m)?,
            ManifestBody::Index(i) => canonical_json(i)?,
        };
        self.desc.set_media_type(body_media_type(&self.body));
        self.desc.set_digest(algo.digest(&raw));
        self.desc.set_size(raw.len() as u64);
        self.raw = Bytes::from(raw);
        Ok(())
    }

    /// Relabel the manifest and its embedded descriptors to the OCI media
    /// types. Returns whether anything changed.
    pub fn convert_to_oci(&mut self) -> Result<bool> {
        let mut changed = false;
        match &mut self.body {
            ManifestBody::Image(m) => {
                let mt = m
                    .media_type()
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| MediaType::ImageManifest.to_string());
                if mt == mediatype::DOCKER_MANIFEST {
                    m.set_media_type(Some(MediaType::ImageManifest));
                    changed = true;
                } else if mt != MediaType::ImageManifest.to_string() {
                    return Err(ModError::invalid_input(format!(
                        "cannot convert manifest media type {mt} to OCI"
                    )));
                }
                let mut config = m.config().clone();
                if config.media_type().to_string() == mediatype::DOCKER_CONFIG {
                    config.set_media_type(MediaType::ImageConfig);
                    m.set_config(config);
                    changed = true;
                }
                for layer in m.layers_mut() {
                    let mapped = mediatype::layer_to_oci(layer.media_type());
                    if &mapped != layer.media_type() {
                        layer.set_media_type(mapped);
                        changed = true;
                    }
                }
            }
            ManifestBody::Index(i) => {
                let mt = i
                    .media_type()
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| MediaType::ImageIndex.to_string());
                if mt == mediatype::DOCKER_MANIFEST_LIST {
                    i.set_media_type(Some(MediaType::ImageIndex));
                    changed = true;
                } else if mt != MediaType::ImageIndex.to_string() {
                    return Err(ModError::invalid_input(format!(
                        "cannot convert index media type {mt} to OCI"
                    )));
                }
                let mut manifests = i.manifests().clone();
                for entry in manifests.iter_mut() {
                    if entry.media_type().to_string() == mediatype::DOCKER_MANIFEST {
                        entry.set_media_type(MediaType::ImageManifest);
                        changed = true;
                    }
                }
                i.set_manifests(manifests);
            }
        }
        Ok(changed)
    }

    /// Relabel the manifest and its embedded descriptors to the Docker
    /// schema-2 media types. Artifact manifests cannot be converted.
    pub fn convert_to_docker(&mut self) -> Result<bool> {
        if let Some(at) = self.artifact_type() {
            return Err(ModError::unsupported_media_type(format!(
                "artifact manifest ({at}) has no docker equivalent"
            )));
        }
        let mut changed = false;
        match &mut self.body {
            ManifestBody::Image(m) => {
                let mt = m
                    .media_type()
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| MediaType::ImageManifest.to_string());
                if mt == MediaType::ImageManifest.to_string() {
                    m.set_media_type(Some(mediatype::docker(mediatype::DOCKER_MANIFEST)));
                    changed = true;
                } else if mt != mediatype::DOCKER_MANIFEST {
                    return Err(ModError::invalid_input(format!(
                        "cannot convert manifest media type {mt} to docker"
                    )));
                }
                let mut config = m.config().clone();
                if *config.media_type() == MediaType::ImageConfig {
                    config.set_media_type(mediatype::docker(mediatype::DOCKER_CONFIG));
                    m.set_config(config);
                    changed = true;
                }
                for layer in m.layers_mut() {
                    let mapped = mediatype::layer_to_docker(layer.media_type())?;
                    if &mapped != layer.media_type() {
                        layer.set_media_type(mapped);
                        changed = true;
                    }
                }
            }
            ManifestBody::Index(i) => {
                let mt = i
                    .media_type()
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| MediaType::ImageIndex.to_string());
                if mt == MediaType::ImageIndex.to_string() {
                    i.set_media_type(Some(mediatype::docker(mediatype::DOCKER_MANIFEST_LIST)));
                    changed = true;
                } else if mt != mediatype::DOCKER_MANIFEST_LIST {
                    return Err(ModError::invalid_input(format!(
                        "cannot convert index media type {mt} to docker"
                    )));
                }
                let mut manifests = i.manifests().clone();
                for entry in manifests.iter_mut() {
                    if *entry.media_type() == MediaType::ImageManifest {
                        entry.set_media_type(mediatype::docker(mediatype::DOCKER_MANIFEST));
                        changed = true;
                    }
                }
                i.set_manifests(manifests);
            }
        }
        Ok(changed)
    }
}

fn body_media_type(body: &ManifestBody) -> MediaType {
    match body {
        ManifestBody::Image(m) => m
            .media_type()
            .clone()
            .unwrap_or(MediaType::ImageManifest),
        ManifestBody::Index(i) => i.media_type().clone().unwrap_or(MediaType::ImageIndex),
    }
}

fn parse_body(raw: &[u8], media_type: &str) -> Result<ManifestBody> {
    if mediatype::is_index(media_type) {
        return Ok(ManifestBody::Index(serde_json::from_slice(raw)?));
    }
    if mediatype::is_image_manifest(media_type) {
        return Ok(ManifestBody::Image(serde_json::from_slice(raw)?));
    }
    // No usable media type: sniff the document shape.
    let value: serde_json::Value = serde_json::from_slice(raw)?;
    if value.get("manifests").is_some() {
        Ok(ManifestBody::Index(serde_json::from_value(value)?))
    } else if value.get("config").is_some() {
        Ok(ManifestBody::Image(serde_json::from_value(value)?))
    } else {
        Err(ModError::unsupported_media_type(format!(
            "{media_type} is not a known manifest type"
        )))
    }
}
