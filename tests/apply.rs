//! End-to-end engine scenarios against an OCI-layout `testrepo` fixture:
//! tags `v1` (OCI image), `v2` (docker image with base annotations), `v3`
//! (multi-platform index), and bases `b1`/`b2`.

use std::collections::HashMap;
use std::io::Read;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use flate2::read::GzDecoder;
use oci_spec::image::{
    Arch, Descriptor, Digest, HistoryBuilder, ImageConfiguration, ImageConfigurationBuilder,
    ImageIndexBuilder, ImageManifestBuilder, MediaType, Os, PlatformBuilder, RootFsBuilder,
};
use serde::Serialize;
use tempfile::TempDir;
use test_log::test;

use ocimod::{
    apply, with_annotation, with_config_timestamp, with_layer_add_tar, with_layer_rm_index,
    with_layer_strip_file, with_manifest_to_docker, with_manifest_to_oci,
    with_manifest_to_oci_referrers, with_rebase, with_rebase_refs, with_target_ref,
    DigestAlgorithm, ImageRef, Manifest, ManifestBody, ModError, OciDirClient, RegistryClient,
    TimestampSpec,
};

const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
const BASE_NAME: &str = "org.opencontainers.image.base.name";
const BASE_DIGEST: &str = "org.opencontainers.image.base.digest";

fn canonical<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(&serde_json::to_value(value).unwrap()).unwrap()
}

fn sha256(bytes: &[u8]) -> Digest {
    DigestAlgorithm::Sha256.digest(bytes)
}

fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mtime = Utc
        .with_ymd_and_hms(2022, 1, 2, 3, 4, 5)
        .unwrap()
        .timestamp() as u64;
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_cksum();
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

/// A content layer: compressed blob, its descriptor, and the diff-id.
struct Layer {
    blob: Vec<u8>,
    desc: Descriptor,
    diff_id: Digest,
}

fn layer(files: &[(&str, &[u8])], media_type: MediaType) -> Layer {
    let tar = build_tar(files);
    let diff_id = sha256(&tar);
    let blob = gzip(&tar);
    let desc = Descriptor::new(media_type, blob.len() as u64, sha256(&blob));
    Layer {
        blob,
        desc,
        diff_id,
    }
}

fn history(created_by: &str, empty: bool) -> oci_spec::image::History {
    let mut b = HistoryBuilder::default()
        .created("2022-01-02T03:04:05Z")
        .created_by(created_by);
    if empty {
        b = b.empty_layer(true);
    }
    b.build().unwrap()
}

fn image_config(
    arch: Arch,
    layers: &[&Layer],
    history: Vec<oci_spec::image::History>,
) -> ImageConfiguration {
    ImageConfigurationBuilder::default()
        .created("2022-01-02T03:04:05Z")
        .architecture(arch)
        .os(Os::Linux)
        .rootfs(
            RootFsBuilder::default()
                .typ("layers")
                .diff_ids(
                    layers
                        .iter()
                        .map(|l| l.diff_id.to_string())
                        .collect::<Vec<_>>(),
                )
                .build()
                .unwrap(),
        )
        .history(history)
        .build()
        .unwrap()
}

struct Fixture {
    _tmp: TempDir,
    client: OciDirClient,
    v3_children: Vec<Descriptor>,
    layer1: Layer,
    layer1b: Layer,
    layer2: Layer,
}

impl Fixture {
    fn reference(&self, name: &str) -> ImageRef {
        format!("ocidir://testrepo:{name}").parse().unwrap()
    }

    fn by_digest(&self, digest: &Digest) -> ImageRef {
        format!("ocidir://testrepo@{digest}").parse().unwrap()
    }
}

/// Push an image (config blob, layer blobs, manifest) and return the
/// manifest descriptor.
async fn put_image(
    client: &OciDirClient,
    tag: Option<&str>,
    config: &ImageConfiguration,
    layers: &[&Layer],
    docker_types: bool,
    annotations: Option<HashMap<String, String>>,
) -> Descriptor {
    let repo: ImageRef = "ocidir://testrepo".parse().unwrap();
    let config_raw = canonical(config);
    let config_media = if docker_types {
        MediaType::Other(DOCKER_CONFIG.to_string())
    } else {
        MediaType::ImageConfig
    };
    let config_desc = Descriptor::new(config_media, config_raw.len() as u64, sha256(&config_raw));
    client
        .blob_put(&repo, &config_desc, Bytes::from(config_raw))
        .await
        .unwrap();
    for l in layers {
        client
            .blob_put(&repo, &l.desc, Bytes::from(l.blob.clone()))
            .await
            .unwrap();
    }
    let manifest_media = if docker_types {
        MediaType::Other(DOCKER_MANIFEST.to_string())
    } else {
        MediaType::ImageManifest
    };
    let mut builder = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(manifest_media)
        .config(config_desc)
        .layers(layers.iter().map(|l| l.desc.clone()).collect::<Vec<_>>());
    if let Some(a) = annotations {
        builder = builder.annotations(a);
    }
    let manifest = Manifest::from_body(ManifestBody::Image(builder.build().unwrap())).unwrap();
    let push_ref = match tag {
        Some(t) => format!("ocidir://testrepo:{t}").parse().unwrap(),
        None => format!("ocidir://testrepo@{}", manifest.descriptor().digest())
            .parse()
            .unwrap(),
    };
    client
        .manifest_put(&push_ref, &manifest, tag.is_none())
        .await
        .unwrap();
    manifest.descriptor().clone()
}

async fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let client = OciDirClient::new(tmp.path());

    let layer1 = layer(&[("layer1", b"layer 1 content")], MediaType::ImageLayerGzip);
    let layer1b = layer(
        &[("layer1", b"layer 1 rebuilt content")],
        MediaType::ImageLayerGzip,
    );
    let layer2 = layer(
        &[("layer2", b"layer 2 content"), ("etc/config2", b"cfg")],
        MediaType::ImageLayerGzip,
    );
    let layer1_docker = Layer {
        blob: layer1.blob.clone(),
        desc: {
            let mut d = layer1.desc.clone();
            d.set_media_type(MediaType::Other(DOCKER_LAYER.to_string()));
            d
        },
        diff_id: layer1.diff_id.clone(),
    };
    let layer2_docker = Layer {
        blob: layer2.blob.clone(),
        desc: {
            let mut d = layer2.desc.clone();
            d.set_media_type(MediaType::Other(DOCKER_LAYER.to_string()));
            d
        },
        diff_id: layer2.diff_id.clone(),
    };

    let base_history = vec![history("BASE ADD layer1", false)];

    // bases
    let b1_config = image_config(Arch::Amd64, &[&layer1], base_history.clone());
    let b1 = put_image(&client, Some("b1"), &b1_config, &[&layer1], false, None).await;
    let b2_config = image_config(
        Arch::Amd64,
        &[&layer1b],
        vec![history("BASE ADD layer1b", false)],
    );
    put_image(&client, Some("b2"), &b2_config, &[&layer1b], false, None).await;

    // v1: plain OCI image
    let v1_history = vec![
        history("BASE ADD layer1", false),
        history("ENV app=demo", true),
        history("ADD layer2", false),
    ];
    let v1_config = image_config(Arch::Amd64, &[&layer1, &layer2], v1_history.clone());
    put_image(
        &client,
        Some("v1"),
        &v1_config,
        &[&layer1, &layer2],
        false,
        None,
    )
    .await;

    // v2: docker media types plus base annotations
    let v2_annotations = HashMap::from([
        (BASE_NAME.to_string(), "ocidir://testrepo:b1".to_string()),
        (BASE_DIGEST.to_string(), b1.digest().to_string()),
    ]);
    let v2_config = image_config(Arch::Amd64, &[&layer1, &layer2], v1_history.clone());
    put_image(
        &client,
        Some("v2"),
        &v2_config,
        &[&layer1_docker, &layer2_docker],
        true,
        Some(v2_annotations),
    )
    .await;

    // v3: multi-platform index
    let mut v3_children = Vec::new();
    for arch in [Arch::Amd64, Arch::Arm64] {
        let config = image_config(arch.clone(), &[&layer1, &layer2], v1_history.clone());
        let desc = put_image(&client, None, &config, &[&layer1, &layer2], false, None).await;
        let mut entry = desc.clone();
        entry.set_platform(Some(
            PlatformBuilder::default()
                .architecture(arch)
                .os(Os::Linux)
                .build()
                .unwrap(),
        ));
        v3_children.push(entry);
    }
    let index = ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(v3_children.clone())
        .build()
        .unwrap();
    let index = Manifest::from_body(ManifestBody::Index(index)).unwrap();
    let v3_ref: ImageRef = "ocidir://testrepo:v3".parse().unwrap();
    client.manifest_put(&v3_ref, &index, false).await.unwrap();

    Fixture {
        _tmp: tmp,
        client,
        v3_children,
        layer1,
        layer1b,
        layer2,
    }
}

async fn manifest_at(client: &OciDirClient, r: &ImageRef) -> Manifest {
    client.manifest_get(r, None).await.unwrap()
}

async fn config_at(client: &OciDirClient, r: &ImageRef, m: &Manifest) -> ImageConfiguration {
    let desc = match m.body() {
        ManifestBody::Image(img) => img.config().clone(),
        ManifestBody::Index(_) => panic!("expected an image manifest"),
    };
    client.config_get(r, &desc).await.unwrap()
}

fn image_layers(m: &Manifest) -> Vec<Descriptor> {
    match m.body() {
        ManifestBody::Image(img) => img.layers().clone(),
        ManifestBody::Index(_) => panic!("expected an image manifest"),
    }
}

#[test(tokio::test)]
async fn noop_apply_keeps_digest() {
    let f = fixture().await;
    let src = f.reference("v1");
    let before = manifest_at(&f.client, &src).await;
    let out = apply(&f.client, &src, vec![]).await.unwrap();
    assert_eq!(out.digest().unwrap(), before.descriptor().digest());

    // an index round-trips unchanged too
    let src = f.reference("v3");
    let before = manifest_at(&f.client, &src).await;
    let out = apply(&f.client, &src, vec![]).await.unwrap();
    assert_eq!(out.digest().unwrap(), before.descriptor().digest());
}

#[test(tokio::test)]
async fn to_oci_on_oci_image_is_fixed_point() {
    let f = fixture().await;
    let src = f.reference("v1");
    let before = manifest_at(&f.client, &src).await;
    let out = apply(&f.client, &src, vec![with_manifest_to_oci()])
        .await
        .unwrap();
    assert_eq!(out.digest().unwrap(), before.descriptor().digest());
}

#[test(tokio::test)]
async fn to_docker_rewrites_media_types() {
    let f = fixture().await;
    let src = f.reference("v1");
    let before = manifest_at(&f.client, &src).await;
    let out = apply(&f.client, &src, vec![with_manifest_to_docker()])
        .await
        .unwrap();
    assert_ne!(out.digest().unwrap(), before.descriptor().digest());

    let converted = manifest_at(&f.client, &out).await;
    assert_eq!(converted.media_type().to_string(), DOCKER_MANIFEST);
    let image = match converted.body() {
        ManifestBody::Image(img) => img,
        _ => panic!("expected image"),
    };
    assert_eq!(image.config().media_type().to_string(), DOCKER_CONFIG);
    for l in image.layers() {
        assert_eq!(l.media_type().to_string(), DOCKER_LAYER);
    }

    // and back: to-OCI on the docker tag converges to the OCI digest space
    let out2 = apply(&f.client, &out, vec![with_manifest_to_oci()])
        .await
        .unwrap();
    let roundtrip = manifest_at(&f.client, &out2).await;
    assert_eq!(
        roundtrip.media_type(),
        MediaType::ImageManifest
    );
}

#[test(tokio::test)]
async fn timestamp_cap_rewrites_config() {
    let f = fixture().await;
    let src = f.reference("v1");
    let before = manifest_at(&f.client, &src).await;
    let cap = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let out = apply(
        &f.client,
        &src,
        vec![with_config_timestamp(TimestampSpec::cap(cap)).unwrap()],
    )
    .await
    .unwrap();
    assert_ne!(out.digest().unwrap(), before.descriptor().digest());

    let m = manifest_at(&f.client, &out).await;
    let config = config_at(&f.client, &out, &m).await;
    assert_eq!(config.created().as_deref(), Some("2020-01-01T00:00:00Z"));
    for entry in config.history() {
        let created = entry.created().as_deref().unwrap();
        assert!(created <= "2020-01-01T00:00:00Z", "history entry {created} above cap");
    }
}

#[test(tokio::test)]
async fn timestamp_cap_in_future_is_noop() {
    let f = fixture().await;
    let src = f.reference("v1");
    let before = manifest_at(&f.client, &src).await;
    let out = apply(
        &f.client,
        &src,
        vec![with_config_timestamp(TimestampSpec::cap(Utc::now())).unwrap()],
    )
    .await
    .unwrap();
    assert_eq!(out.digest().unwrap(), before.descriptor().digest());
}

#[test]
#[allow(deprecated)]
fn deprecated_timestamp_max_adapter() {
    // the deprecated cap shape maps onto the superset option
    let cap = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let _ = ocimod::with_config_timestamp_max(cap);
    let _ = ocimod::with_layer_timestamp_max(cap);
}

#[test(tokio::test)]
async fn strip_file_rewrites_every_layer() {
    let f = fixture().await;
    let src = f.reference("v3");
    let before = manifest_at(&f.client, &src).await;
    let out = apply(&f.client, &src, vec![with_layer_strip_file("/layer2")])
        .await
        .unwrap();
    assert_ne!(out.digest().unwrap(), before.descriptor().digest());

    let index = manifest_at(&f.client, &out).await;
    let entries = match index.body() {
        ManifestBody::Index(i) => i.manifests().clone(),
        _ => panic!("expected index"),
    };
    assert_eq!(entries.len(), 2);
    for entry in entries {
        let child_ref = f.by_digest(entry.digest());
        let child = manifest_at(&f.client, &child_ref).await;
        let config = config_at(&f.client, &child_ref, &child).await;
        let layers = image_layers(&child);
        assert_eq!(layers.len(), config.rootfs().diff_ids().len());
        for (i, ldesc) in layers.iter().enumerate() {
            let blob = f.client.blob_get(&child_ref, ldesc).await.unwrap();
            let tar = gunzip(&blob);
            // diff-ids track the rewritten tars
            assert_eq!(
                config.rootfs().diff_ids()[i],
                sha256(&tar).to_string()
            );
            let mut archive = tar::Archive::new(tar.as_slice());
            for e in archive.entries().unwrap() {
                let e = e.unwrap();
                let path = e.path().unwrap().to_string_lossy().into_owned();
                assert_ne!(path, "layer2", "stripped file still present");
            }
        }
    }
}

#[test(tokio::test)]
async fn layer_rm_index_needs_image_manifest() {
    let f = fixture().await;
    // a multi-platform tag cannot address a layer by index
    let err = apply(&f.client, &f.reference("v3"), vec![with_layer_rm_index(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, ModError::UnsupportedMediaType(_)), "{err}");

    // a platform-specific digest can
    let child_ref = f.by_digest(f.v3_children[0].digest());
    let before = manifest_at(&f.client, &child_ref).await;
    let out = apply(&f.client, &child_ref, vec![with_layer_rm_index(1)])
        .await
        .unwrap();
    assert_ne!(out.digest().unwrap(), before.descriptor().digest());

    let m = manifest_at(&f.client, &out).await;
    let config = config_at(&f.client, &out, &m).await;
    let layers = image_layers(&m);
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].digest(), f.layer1.desc.digest());
    assert_eq!(config.rootfs().diff_ids().len(), 1);
    // the aligned non-empty history entry went with the layer
    assert_eq!(config.history().len(), 2);
    assert_eq!(
        config.history()[0].created_by().as_deref(),
        Some("BASE ADD layer1")
    );
    assert_eq!(config.history()[1].empty_layer(), &Some(true));
}

#[test(tokio::test)]
async fn rebase_requires_annotations() {
    let f = fixture().await;
    let err = apply(&f.client, &f.reference("v1"), vec![with_rebase()])
        .await
        .unwrap_err();
    assert!(matches!(err, ModError::NotFound(_)), "{err}");
}

#[test(tokio::test)]
async fn rebase_from_annotations_succeeds() {
    let f = fixture().await;
    // v2 pins b1 as its base; rebasing onto the same tag converges
    let out = apply(&f.client, &f.reference("v2"), vec![with_rebase()])
        .await
        .unwrap();
    let m = manifest_at(&f.client, &out).await;
    let layers = image_layers(&m);
    assert_eq!(layers[0].digest(), f.layer1.desc.digest());
    assert_eq!(layers[1].digest(), f.layer2.desc.digest());
}

#[test(tokio::test)]
async fn rebase_refs_splices_new_base() {
    let f = fixture().await;
    let src = f.reference("v3");
    let old_base = f.reference("b1");
    let new_base = f.reference("b2");
    let out = apply(
        &f.client,
        &src,
        vec![with_rebase_refs(old_base, new_base)],
    )
    .await
    .unwrap();

    let index = manifest_at(&f.client, &out).await;
    let entries = match index.body() {
        ManifestBody::Index(i) => i.manifests().clone(),
        _ => panic!("expected index"),
    };
    for entry in entries {
        let child_ref = f.by_digest(entry.digest());
        let child = manifest_at(&f.client, &child_ref).await;
        let layers = image_layers(&child);
        // new base layers ++ image-specific suffix
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].digest(), f.layer1b.desc.digest());
        assert_eq!(layers[1].digest(), f.layer2.desc.digest());

        let config = config_at(&f.client, &child_ref, &child).await;
        assert_eq!(
            config.rootfs().diff_ids()[0],
            f.layer1b.diff_id.to_string()
        );
        assert_eq!(
            config.history()[0].created_by().as_deref(),
            Some("BASE ADD layer1b")
        );
        // non-empty history count still matches the layer count
        let non_empty = config
            .history()
            .iter()
            .filter(|h| !h.empty_layer().unwrap_or(false))
            .count();
        assert_eq!(non_empty, layers.len());
    }
}

#[test(tokio::test)]
async fn rebase_refs_swapped_is_mismatch() {
    let f = fixture().await;
    let err = apply(
        &f.client,
        &f.reference("v3"),
        vec![with_rebase_refs(f.reference("b2"), f.reference("b1"))],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ModError::Mismatch(_)), "{err}");
}

#[test(tokio::test)]
async fn annotation_updates_referrer_subject() {
    let f = fixture().await;
    let src = f.reference("v1");
    let subject = manifest_at(&f.client, &src).await;

    // attach an artifact referrer to v1
    let artifact_config = Bytes::from_static(b"{}");
    let artifact_config_desc = Descriptor::new(
        MediaType::Other("application/vnd.oci.empty.v1+json".to_string()),
        artifact_config.len() as u64,
        sha256(&artifact_config),
    );
    let repo: ImageRef = "ocidir://testrepo".parse().unwrap();
    f.client
        .blob_put(&repo, &artifact_config_desc, artifact_config)
        .await
        .unwrap();
    let referrer_body = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .artifact_type(MediaType::Other("application/vnd.example.sbom".to_string()))
        .config(artifact_config_desc)
        .layers(Vec::<Descriptor>::new())
        .subject(subject.descriptor().clone())
        .build()
        .unwrap();
    let referrer = Manifest::from_body(ManifestBody::Image(referrer_body)).unwrap();
    let rref = f.by_digest(referrer.descriptor().digest());
    f.client.manifest_put(&rref, &referrer, true).await.unwrap();
    assert_eq!(f.client.referrer_list(&src).await.unwrap().len(), 1);

    // mutate the subject; its digest moves and the referrer follows
    let out = apply(
        &f.client,
        &src,
        vec![with_annotation("org.example.reviewed", Some("yes")).unwrap()],
    )
    .await
    .unwrap();
    assert_ne!(out.digest().unwrap(), subject.descriptor().digest());

    let listed = f.client.referrer_list(&out).await.unwrap();
    assert_eq!(listed.len(), 1);
    let moved = manifest_at(&f.client, &f.by_digest(listed[0].digest())).await;
    assert_eq!(
        moved.subject().unwrap().digest(),
        out.digest().unwrap()
    );
}

#[test(tokio::test)]
async fn cross_repo_copy_is_complete() {
    let f = fixture().await;
    let src = f.reference("v1");
    let tgt: ImageRef = "ocidir://copyrepo:v1".parse().unwrap();
    let out = apply(&f.client, &src, vec![with_target_ref(tgt.clone())])
        .await
        .unwrap();
    assert!(out.to_string().starts_with("ocidir://copyrepo"));

    // every blob in the written graph is retrievable from the target
    let m = manifest_at(&f.client, &tgt).await;
    let image = match m.body() {
        ManifestBody::Image(img) => img.clone(),
        _ => panic!("expected image"),
    };
    f.client.blob_get(&tgt, image.config()).await.unwrap();
    for l in image.layers() {
        f.client.blob_get(&tgt, l).await.unwrap();
    }
}

#[test(tokio::test)]
async fn docker_referrers_convert_to_subject() {
    let f = fixture().await;

    // index with an image child and a docker reference-type attestation
    let image_child = f.v3_children[0].clone();
    let att_config = image_config(Arch::Amd64, &[], vec![]);
    let att_desc = put_image(&f.client, None, &att_config, &[], false, None).await;
    let mut att_entry = att_desc.clone();
    att_entry.set_annotations(Some(HashMap::from([
        (
            "vnd.docker.reference.type".to_string(),
            "attestation-manifest".to_string(),
        ),
        (
            "vnd.docker.reference.digest".to_string(),
            image_child.digest().to_string(),
        ),
    ])));
    let index = ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(vec![image_child.clone(), att_entry])
        .build()
        .unwrap();
    let index = Manifest::from_body(ManifestBody::Index(index)).unwrap();
    let vref: ImageRef = "ocidir://testrepo:vref".parse().unwrap();
    f.client.manifest_put(&vref, &index, false).await.unwrap();

    let out = apply(&f.client, &vref, vec![with_manifest_to_oci_referrers()])
        .await
        .unwrap();
    assert_ne!(out.digest().unwrap(), index.descriptor().digest());

    let converted = manifest_at(&f.client, &out).await;
    let entries = match converted.body() {
        ManifestBody::Index(i) => i.manifests().clone(),
        _ => panic!("expected index"),
    };
    // the attestation left the child list and became a referrer
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].digest(), image_child.digest());
    let referrers = f
        .client
        .referrer_list(&f.by_digest(image_child.digest()))
        .await
        .unwrap();
    assert_eq!(referrers.len(), 1);
    let referrer = manifest_at(&f.client, &f.by_digest(referrers[0].digest())).await;
    assert_eq!(
        referrer.subject().unwrap().digest(),
        image_child.digest()
    );
}

#[test]
fn layer_add_uses_source_date_epoc() {
    // pin the engine clock for the synthetic history entry
    temp_env::with_var(ocimod::SOURCE_DATE_EPOC, Some("1000000000"), || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let f = fixture().await;
            let src = f.reference("v1");
            let tar = build_tar(&[("extra/file", b"added content")]);
            let out = apply(
                &f.client,
                &src,
                vec![with_layer_add_tar(Bytes::from(tar), None).unwrap()],
            )
            .await
            .unwrap();

            let m = manifest_at(&f.client, &out).await;
            let layers = image_layers(&m);
            assert_eq!(layers.len(), 3);
            let config = config_at(&f.client, &out, &m).await;
            assert_eq!(config.rootfs().diff_ids().len(), 3);
            let added = config.history().last().unwrap();
            assert_eq!(added.comment().as_deref(), Some("ocimod"));
            assert_eq!(added.created().as_deref(), Some("2001-09-09T01:46:40Z"));

            // the new blob round-trips from the repository
            let blob = f.client.blob_get(&src, &layers[2]).await.unwrap();
            assert_eq!(
                config.rootfs().diff_ids()[2],
                sha256(&gunzip(&blob)).to_string()
            );
        });
    });
}
