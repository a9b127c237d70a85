//! OCI image-layout directory backend for `ocidir://path:tag` references.
//!
//! Layout per the image spec: an `oci-layout` marker, an `index.json` whose
//! entries carry the `org.opencontainers.image.ref.name` annotation as the
//! tag table, and content under `blobs/<algorithm>/<hex>`. Referrers use the
//! fallback-tag convention: an index tagged `<algorithm>-<hex>` per subject.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::image::{Descriptor, Digest, ImageConfiguration, ImageIndex, MediaType};
use tracing::debug;

use crate::client::RegistryClient;
use crate::digest::{canonical_json, inline_data, DigestAlgorithm};
use crate::error::{ModError, Result};
use crate::manifest::Manifest;
use crate::reference::{ImageRef, RefScheme};

const REF_NAME: &str = "org.opencontainers.image.ref.name";
const LAYOUT_MARKER: &[u8] = br#"{"imageLayoutVersion":"1.0.0"}"#;

/// Registry client over OCI image-layout directories rooted at a base path.
pub struct OciDirClient {
    root: PathBuf,
}

impl OciDirClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        OciDirClient { root: root.into() }
    }

    fn layout_dir(&self, r: &ImageRef) -> Result<PathBuf> {
        if r.scheme() != RefScheme::OciDir {
            return Err(ModError::invalid_input(format!(
                "{r} is not an ocidir reference"
            )));
        }
        Ok(self.root.join(r.path()))
    }

    async fn read_index(&self, dir: &Path) -> Result<ImageIndex> {
        let path = dir.join("index.json");
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ModError::not_found(
                format!("no image layout at {}", dir.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(&self, dir: &Path, index: &ImageIndex) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let marker = dir.join("oci-layout");
        if !marker.exists() {
            tokio::fs::write(&marker, LAYOUT_MARKER).await?;
        }
        tokio::fs::write(dir.join("index.json"), serde_json::to_vec_pretty(index)?).await?;
        Ok(())
    }

    async fn read_index_or_empty(&self, dir: &Path) -> Result<ImageIndex> {
        match self.read_index(dir).await {
            Ok(i) => Ok(i),
            Err(ModError::NotFound(_)) => Ok(empty_index()),
            Err(e) => Err(e),
        }
    }

    fn blob_path(dir: &Path, digest: &Digest) -> PathBuf {
        dir.join("blobs")
            .join(digest.algorithm().to_string())
            .join(digest.digest())
    }

    async fn read_blob(&self, dir: &Path, digest: &Digest) -> Result<Bytes> {
        let path = Self::blob_path(dir, digest);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Bytes::from(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ModError::not_found(format!("blob {digest} not in layout")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_blob(&self, dir: &Path, digest: &Digest, raw: &[u8]) -> Result<()> {
        let path = Self::blob_path(dir, digest);
        tokio::fs::create_dir_all(path.parent().expect("blob path has a parent")).await?;
        tokio::fs::write(&path, raw).await?;
        Ok(())
    }

    /// Resolve a reference to the digest to operate on, consulting the tag
    /// table when the reference is not pinned.
    async fn resolve(&self, dir: &Path, r: &ImageRef) -> Result<(Digest, Option<Descriptor>)> {
        if let Some(d) = r.digest() {
            let index = self.read_index_or_empty(dir).await?;
            let entry = index
                .manifests()
                .iter()
                .find(|e| e.digest() == d)
                .cloned();
            return Ok((d.clone(), entry));
        }
        let tag = r
            .tag()
            .ok_or_else(|| ModError::invalid_input(format!("{r} has neither tag nor digest")))?
            .to_string();
        let index = self.read_index(dir).await?;
        let entry = index
            .manifests()
            .iter()
            .find(|e| entry_tag(e) == Some(tag.as_str()))
            .cloned()
            .ok_or_else(|| ModError::not_found(format!("tag {tag} not in {}", dir.display())))?;
        Ok((entry.digest().clone(), Some(entry)))
    }

    /// Attach or refresh the fallback referrer index for a pushed manifest
    /// that carries a subject.
    async fn update_referrer_index(
        &self,
        dir: &Path,
        subject: &Descriptor,
        manifest: &Manifest,
    ) -> Result<()> {
        let tag = fallback_tag(subject.digest());
        let mut referrers = match self.referrer_index(dir, &tag).await? {
            Some(index) => index.manifests().clone(),
            None => Vec::new(),
        };
        let mut entry = manifest.descriptor().clone();
        entry.set_artifact_type(Some(
            manifest
                .artifact_type()
                .cloned()
                .unwrap_or_else(|| referrer_config_type(manifest)),
        ));
        entry.set_annotations(manifest.annotations().cloned());
        referrers.retain(|e| e.digest() != entry.digest());
        referrers.push(entry);
        self.store_referrer_index(dir, &tag, referrers).await
    }

    async fn remove_referrer(
        &self,
        dir: &Path,
        subject: &Descriptor,
        digest: &Digest,
    ) -> Result<()> {
        let tag = fallback_tag(subject.digest());
        let Some(index) = self.referrer_index(dir, &tag).await? else {
            return Ok(());
        };
        let mut referrers = index.manifests().clone();
        referrers.retain(|e| e.digest() != digest);
        self.store_referrer_index(dir, &tag, referrers).await
    }

    async fn referrer_index(&self, dir: &Path, tag: &str) -> Result<Option<ImageIndex>> {
        let index = self.read_index_or_empty(dir).await?;
        let Some(entry) = index
            .manifests()
            .iter()
            .find(|e| entry_tag(e) == Some(tag))
        else {
            return Ok(None);
        };
        let raw = self.read_blob(dir, entry.digest()).await?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn store_referrer_index(
        &self,
        dir: &Path,
        tag: &str,
        referrers: Vec<Descriptor>,
    ) -> Result<()> {
        let mut index = self.read_index_or_empty(dir).await?;
        let mut entries = index.manifests().clone();
        entries.retain(|e| entry_tag(e) != Some(tag));
        if !referrers.is_empty() {
            let mut fallback = empty_index();
            fallback.set_manifests(referrers);
            let raw = canonical_json(&fallback)?;
            let digest = DigestAlgorithm::Sha256.digest(&raw);
            self.write_blob(dir, &digest, &raw).await?;
            let mut entry =
                Descriptor::new(MediaType::ImageIndex, raw.len() as u64, digest);
            entry.set_annotations(Some(HashMap::from([(
                REF_NAME.to_string(),
                tag.to_string(),
            )])));
            entries.push(entry);
        }
        index.set_manifests(entries);
        self.write_index(dir, &index).await
    }
}

#[async_trait]
impl RegistryClient for OciDirClient {
    async fn manifest_get(&self, r: &ImageRef, hint: Option<&Descriptor>) -> Result<Manifest> {
        let dir = self.layout_dir(r)?;
        let (digest, entry) = match hint {
            Some(h) => (h.digest().clone(), Some(h.clone())),
            None => self.resolve(&dir, r).await?,
        };
        let raw = self.read_blob(&dir, &digest).await?;
        match entry {
            Some(mut desc) => {
                strip_ref_name(&mut desc);
                Manifest::parse(raw, desc)
            }
            None => Manifest::parse_with_media_type(raw.clone(), &sniff_media_type(&raw)?),
        }
    }

    async fn manifest_put(&self, r: &ImageRef, manifest: &Manifest, child: bool) -> Result<()> {
        let dir = self.layout_dir(r)?;
        let desc = manifest.descriptor();
        debug!("writing manifest {} to {}", desc.digest(), dir.display());
        // the marker and index exist even when only child blobs are written
        let mut index = self.read_index_or_empty(&dir).await?;
        self.write_blob(&dir, desc.digest(), manifest.raw()).await?;

        if !child {
            let mut entries = index.manifests().clone();
            let mut entry = desc.clone();
            strip_ref_name(&mut entry);
            match r.tag() {
                Some(tag) => {
                    let tag = tag.to_string();
                    entries.retain(|e| entry_tag(e) != Some(tag.as_str()));
                    let mut annotations = entry.annotations().clone().unwrap_or_default();
                    annotations.insert(REF_NAME.to_string(), tag);
                    entry.set_annotations(Some(annotations));
                    entries.push(entry);
                }
                None => {
                    if !entries.iter().any(|e| e.digest() == desc.digest()) {
                        entries.push(entry);
                    }
                }
            }
            index.set_manifests(entries);
        }
        self.write_index(&dir, &index).await?;

        if let Some(subject) = manifest.subject() {
            self.update_referrer_index(&dir, subject, manifest).await?;
        }
        Ok(())
    }

    async fn manifest_delete(&self, r: &ImageRef, check_referrers: bool) -> Result<()> {
        let dir = self.layout_dir(r)?;
        let (digest, _) = self.resolve(&dir, r).await?;
        if check_referrers {
            if let Ok(raw) = self.read_blob(&dir, &digest).await {
                if let Ok(manifest) =
                    Manifest::parse_with_media_type(raw.clone(), &sniff_media_type(&raw)?)
                {
                    if let Some(subject) = manifest.subject().cloned() {
                        self.remove_referrer(&dir, &subject, &digest).await?;
                    }
                }
            }
        }
        let mut index = self.read_index(&dir).await?;
        let mut entries = index.manifests().clone();
        entries.retain(|e| e.digest() != &digest);
        index.set_manifests(entries);
        self.write_index(&dir, &index).await?;
        let path = Self::blob_path(&dir, &digest);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn blob_get(&self, r: &ImageRef, desc: &Descriptor) -> Result<Bytes> {
        if let Some(data) = inline_data(desc)? {
            return Ok(Bytes::from(data));
        }
        let dir = self.layout_dir(r)?;
        self.read_blob(&dir, desc.digest()).await
    }

    async fn config_get(&self, r: &ImageRef, desc: &Descriptor) -> Result<ImageConfiguration> {
        let raw = self.blob_get(r, desc).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn blob_put(&self, r: &ImageRef, desc: &Descriptor, blob: Bytes) -> Result<()> {
        let dir = self.layout_dir(r)?;
        debug!("writing blob {} to {}", desc.digest(), dir.display());
        self.write_blob(&dir, desc.digest(), &blob).await
    }

    async fn blob_copy(&self, src: &ImageRef, tgt: &ImageRef, desc: &Descriptor) -> Result<()> {
        let src_dir = self.layout_dir(src)?;
        let tgt_dir = self.layout_dir(tgt)?;
        if src_dir == tgt_dir {
            // same layout: presence check only
            let _ = self.read_blob(&src_dir, desc.digest()).await?;
            return Ok(());
        }
        let raw = self.read_blob(&src_dir, desc.digest()).await?;
        self.write_blob(&tgt_dir, desc.digest(), &raw).await
    }

    async fn referrer_list(&self, r: &ImageRef) -> Result<Vec<Descriptor>> {
        let dir = self.layout_dir(r)?;
        let (digest, _) = self.resolve(&dir, r).await?;
        let tag = fallback_tag(&digest);
        Ok(self
            .referrer_index(&dir, &tag)
            .await?
            .map(|i| i.manifests().clone())
            .unwrap_or_default())
    }
}

fn empty_index() -> ImageIndex {
    oci_spec::image::ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(Vec::<Descriptor>::new())
        .build()
        .expect("schema version and manifests are set")
}

fn entry_tag(entry: &Descriptor) -> Option<&str> {
    entry
        .annotations()
        .as_ref()
        .and_then(|a| a.get(REF_NAME))
        .map(String::as_str)
}

fn strip_ref_name(desc: &mut Descriptor) {
    let Some(mut annotations) = desc.annotations().clone() else {
        return;
    };
    if annotations.remove(REF_NAME).is_some() {
        desc.set_annotations((!annotations.is_empty()).then_some(annotations));
    }
}

/// Fallback referrer tag for a subject digest, bounded by the tag grammar's
/// 128-character limit.
fn fallback_tag(digest: &Digest) -> String {
    let algorithm = digest.algorithm().to_string();
    let hex = digest.digest();
    let take = 127usize.saturating_sub(algorithm.len());
    format!("{algorithm}-{}", &hex[..hex.len().min(take)])
}

fn sniff_media_type(raw: &[u8]) -> Result<String> {
    let value: serde_json::Value = serde_json::from_slice(raw)?;
    if let Some(mt) = value.get("mediaType").and_then(|v| v.as_str()) {
        return Ok(mt.to_string());
    }
    if value.get("manifests").is_some() {
        Ok(MediaType::ImageIndex.to_string())
    } else {
        Ok(MediaType::ImageManifest.to_string())
    }
}

/// Referrer entries advertise the config media type when the manifest has
/// no artifact type of its own.
fn referrer_config_type(manifest: &Manifest) -> MediaType {
    manifest
        .as_image()
        .map(|m| m.config().media_type().clone())
        .unwrap_or(MediaType::ImageIndex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_digest;
    use oci_spec::image::ImageManifestBuilder;
    use tempfile::TempDir;
    use test_log::test;

    fn manifest_fixture() -> Manifest {
        let config = Descriptor::new(MediaType::ImageConfig, 2, sha256_digest(b"{}"));
        let body = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(config)
            .layers(Vec::new())
            .build()
            .unwrap();
        Manifest::from_body(crate::manifest::ManifestBody::Image(body)).unwrap()
    }

    #[test(tokio::test)]
    async fn test_manifest_roundtrip_by_tag() {
        let tmp = TempDir::new().unwrap();
        let client = OciDirClient::new(tmp.path());
        let r: ImageRef = "ocidir://repo:v1".parse().unwrap();
        let manifest = manifest_fixture();
        client.manifest_put(&r, &manifest, false).await.unwrap();

        let fetched = client.manifest_get(&r, None).await.unwrap();
        assert_eq!(fetched.descriptor().digest(), manifest.descriptor().digest());
        assert_eq!(fetched.raw(), manifest.raw());
        // ref.name annotation stays in the tag table, not on the descriptor
        assert!(fetched.descriptor().annotations().is_none());
    }

    #[test(tokio::test)]
    async fn test_tag_replacement() {
        let tmp = TempDir::new().unwrap();
        let client = OciDirClient::new(tmp.path());
        let r: ImageRef = "ocidir://repo:v1".parse().unwrap();
        let m1 = manifest_fixture();
        client.manifest_put(&r, &m1, false).await.unwrap();

        let mut m2 = manifest_fixture();
        m2.set_annotation("k", Some("v"));
        m2.refresh(DigestAlgorithm::Sha256).unwrap();
        client.manifest_put(&r, &m2, false).await.unwrap();

        let fetched = client.manifest_get(&r, None).await.unwrap();
        assert_eq!(fetched.descriptor().digest(), m2.descriptor().digest());
        // one tag entry, old manifest blob still addressable
        let by_digest = r
            .to_repository()
            .with_digest(m1.descriptor().digest().clone());
        assert!(client.manifest_get(&by_digest, None).await.is_ok());
    }

    #[test(tokio::test)]
    async fn test_blob_roundtrip_and_copy() {
        let tmp = TempDir::new().unwrap();
        let client = OciDirClient::new(tmp.path());
        let src: ImageRef = "ocidir://src".parse().unwrap();
        let tgt: ImageRef = "ocidir://tgt".parse().unwrap();
        let content = Bytes::from_static(b"layer-bytes");
        let desc = Descriptor::new(
            MediaType::ImageLayerGzip,
            content.len() as u64,
            sha256_digest(&content),
        );
        client.blob_put(&src, &desc, content.clone()).await.unwrap();
        client.blob_copy(&src, &tgt, &desc).await.unwrap();
        assert_eq!(client.blob_get(&tgt, &desc).await.unwrap(), content);
    }

    #[test(tokio::test)]
    async fn test_referrer_fallback_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let client = OciDirClient::new(tmp.path());
        let r: ImageRef = "ocidir://repo:v1".parse().unwrap();
        let subject = manifest_fixture();
        client.manifest_put(&r, &subject, false).await.unwrap();

        let mut referrer = manifest_fixture();
        referrer.set_subject(Some(subject.descriptor().clone()));
        referrer.set_annotation("vnd.example.kind", Some("sbom"));
        referrer.refresh(DigestAlgorithm::Sha256).unwrap();
        let rref = r
            .to_repository()
            .with_digest(referrer.descriptor().digest().clone());
        client.manifest_put(&rref, &referrer, true).await.unwrap();

        let listed = client.referrer_list(&r).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].digest(), referrer.descriptor().digest());
        assert_eq!(
            listed[0]
                .annotations()
                .as_ref()
                .unwrap()
                .get("vnd.example.kind")
                .map(String::as_str),
            Some("sbom")
        );

        client.manifest_delete(&rref, true).await.unwrap();
        assert!(client.referrer_list(&r).await.unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn test_missing_tag_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let client = OciDirClient::new(tmp.path());
        let r: ImageRef = "ocidir://repo:v1".parse().unwrap();
        let manifest = manifest_fixture();
        client.manifest_put(&r, &manifest, false).await.unwrap();
        let missing: ImageRef = "ocidir://repo:v2".parse().unwrap();
        assert!(matches!(
            client.manifest_get(&missing, None).await,
            Err(ModError::NotFound(_))
        ));
    }
}
