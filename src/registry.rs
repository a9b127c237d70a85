//! HTTP distribution-API backend.
//!
//! Token auth is bootstrapped by probing `/v2/` for a `WWW-Authenticate`
//! challenge; tokens are fetched per repository and scope and cached for
//! the client's lifetime.

use std::collections::HashMap;
use std::fmt::Display;

use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::image::{Descriptor, Digest, ImageConfiguration, ImageIndex, MediaType};
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::client::RegistryClient;
use crate::digest::inline_data;
use crate::error::{ModError, Result};
use crate::manifest::Manifest;
use crate::reference::{ImageRef, RefScheme, TagName};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// Registry credentials.
#[derive(Clone, Default)]
pub enum RegistryAuth {
    UserPassword(String, SecretString),
    Token(SecretString),
    #[default]
    None,
}

pub enum ClientScope {
    Push,
    Pull,
}

impl Display for ClientScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientScope::Push => write!(f, "push,pull"),
            ClientScope::Pull => write!(f, "pull"),
        }
    }
}

/// Registry client over the distribution API. The `INSECURE` parameter
/// switches to plain http for tests and local registries.
pub struct HttpRegistryClient<const INSECURE: bool = false> {
    client: Client,
    auth: RegistryAuth,
    tokens: tokio::sync::Mutex<HashMap<String, String>>,
}

impl HttpRegistryClient {
    pub fn new(auth: RegistryAuth) -> Self {
        HttpRegistryClient {
            client: Client::new(),
            auth,
            tokens: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl<const INSECURE: bool> HttpRegistryClient<INSECURE> {
    pub fn with_auth(auth: RegistryAuth) -> Self {
        HttpRegistryClient {
            client: Client::new(),
            auth,
            tokens: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn scheme() -> &'static str {
        if INSECURE {
            "http"
        } else {
            "https"
        }
    }

    async fn probe_for_token_endpoint(&self, registry: &str) -> Result<Option<String>> {
        let url = Url::parse(&format!(
            "{scheme}://{registry}/v2/",
            scheme = Self::scheme()
        ))
        .map_err(|e| ModError::invalid_input(format!("registry url: {e}")))?;

        let resp = self.client.get(url).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            // open registry, no token dance needed
            return Ok(None);
        }
        let Some(challenge) = resp.headers().get("WWW-Authenticate") else {
            return Err(ModError::io_other("401 without WWW-Authenticate header"));
        };
        let challenge = challenge
            .to_str()
            .map_err(|e| ModError::parsing(format!("WWW-Authenticate header: {e}")))?;
        let captures = Regex::new(r#"Bearer realm="([^"]+)",service="([^"]+)""#)
            .expect("literal pattern")
            .captures(challenge)
            .ok_or_else(|| {
                ModError::parsing(format!("unrecognized WWW-Authenticate {challenge:?}"))
            })?;
        let realm = &captures[1];
        let service = &captures[2];
        debug!("found token realm {realm} for service {service}");
        let url = Url::parse_with_params(realm, [("service", service)])
            .map_err(|e| ModError::parsing(format!("token realm: {e}")))?;
        Ok(Some(url.to_string()))
    }

    async fn token(&self, registry: &str, repo: &str, scope: ClientScope) -> Result<Option<String>> {
        let key = format!("{registry}/{repo}:{scope}");
        if let Some(token) = self.tokens.lock().await.get(&key) {
            return Ok(Some(token.clone()));
        }
        let Some(realm) = self.probe_for_token_endpoint(registry).await? else {
            return Ok(None);
        };
        let token_url =
            Url::parse_with_params(&realm, [("scope", format!("repository:{repo}:{scope}"))])
                .map_err(|e| ModError::parsing(format!("token url: {e}")))?;
        let mut req = self.client.get(token_url);
        match &self.auth {
            RegistryAuth::UserPassword(user, pass) => {
                req = req.basic_auth(user, Some(pass.expose_secret()));
            }
            RegistryAuth::Token(token) => {
                req = req.basic_auth("", Some(token.expose_secret()));
            }
            RegistryAuth::None => {}
        }
        let resp = req
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;
        let token = resp
            .get("token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ModError::parsing("token endpoint returned no token"))?
            .to_string();
        debug!("fetched token for {key}");
        self.tokens.lock().await.insert(key, token.clone());
        Ok(Some(token))
    }

    fn repo_url(&self, r: &ImageRef) -> Result<Url> {
        if r.scheme() != RefScheme::Registry {
            return Err(ModError::invalid_input(format!(
                "{r} is not a registry reference"
            )));
        }
        Url::parse(&format!(
            "{}://{}/v2/{}/",
            Self::scheme(),
            r.registry(),
            r.repository()
        ))
        .map_err(|e| ModError::invalid_input(format!("reference {r}: {e}")))
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: Url,
        r: &ImageRef,
        scope: ClientScope,
    ) -> Result<reqwest::RequestBuilder> {
        let mut req = self.client.request(method, url);
        if let Some(token) = self.token(r.registry(), r.repository(), scope).await? {
            req = req.bearer_auth(token);
        }
        Ok(req)
    }
}

fn check_status(resp: reqwest::Response, what: impl Display) -> Result<reqwest::Response> {
    if resp.status() == StatusCode::NOT_FOUND {
        return Err(ModError::not_found(what.to_string()));
    }
    Ok(resp.error_for_status()?)
}

#[async_trait]
impl<const INSECURE: bool> RegistryClient for HttpRegistryClient<INSECURE> {
    async fn manifest_get(&self, r: &ImageRef, hint: Option<&Descriptor>) -> Result<Manifest> {
        let name = match hint {
            Some(h) => h.digest().to_string(),
            None => r.name()?,
        };
        info!("fetching manifest {}/{}:{name}", r.registry(), r.repository());
        let url = self
            .repo_url(r)?
            .join(&format!("manifests/{name}"))
            .map_err(|e| ModError::invalid_input(format!("manifest url: {e}")))?;
        let resp = self
            .request(reqwest::Method::GET, url, r, ClientScope::Pull)
            .await?
            .header("Accept", MANIFEST_ACCEPT)
            .send()
            .await?;
        let resp = check_status(resp, format!("manifest {r}"))?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let raw = resp.bytes().await?;
        match hint {
            Some(h) => Manifest::parse(raw, h.clone()),
            None => {
                let media = content_type
                    .unwrap_or_else(|| MediaType::ImageManifest.to_string());
                Manifest::parse_with_media_type(raw, &media)
            }
        }
    }

    async fn manifest_put(&self, r: &ImageRef, manifest: &Manifest, child: bool) -> Result<()> {
        let name = if child {
            manifest.descriptor().digest().to_string()
        } else {
            r.name()?
        };
        info!("pushing manifest {}/{}:{name}", r.registry(), r.repository());
        let url = self
            .repo_url(r)?
            .join(&format!("manifests/{name}"))
            .map_err(|e| ModError::invalid_input(format!("manifest url: {e}")))?;
        let resp = self
            .request(reqwest::Method::PUT, url, r, ClientScope::Push)
            .await?
            .header(
                reqwest::header::CONTENT_TYPE,
                manifest.media_type().to_string(),
            )
            .body(manifest.raw().to_vec())
            .send()
            .await?;
        resp.error_for_status()?;
        Ok(())
    }

    async fn manifest_delete(&self, r: &ImageRef, check_referrers: bool) -> Result<()> {
        let digest = match r.digest() {
            Some(d) => d.clone(),
            None => self
                .manifest_get(r, None)
                .await?
                .descriptor()
                .digest()
                .clone(),
        };
        // registries implementing the referrers API maintain the listing
        // themselves; the flag only matters for the fallback-tag scheme,
        // which this backend leaves to the server
        let _ = check_referrers;
        info!("deleting manifest {}/{}@{digest}", r.registry(), r.repository());
        let url = self
            .repo_url(r)?
            .join(&format!("manifests/{digest}"))
            .map_err(|e| ModError::invalid_input(format!("manifest url: {e}")))?;
        let resp = self
            .request(reqwest::Method::DELETE, url, r, ClientScope::Push)
            .await?
            .send()
            .await?;
        check_status(resp, format!("manifest {digest}"))?;
        Ok(())
    }

    async fn blob_get(&self, r: &ImageRef, desc: &Descriptor) -> Result<Bytes> {
        if let Some(data) = inline_data(desc)? {
            return Ok(Bytes::from(data));
        }
        debug!("downloading blob {} from {}/{}", desc.digest(), r.registry(), r.repository());
        let url = self
            .repo_url(r)?
            .join(&format!("blobs/{}", desc.digest()))
            .map_err(|e| ModError::invalid_input(format!("blob url: {e}")))?;
        let resp = self
            .request(reqwest::Method::GET, url, r, ClientScope::Pull)
            .await?
            .send()
            .await?;
        let resp = check_status(resp, format!("blob {}", desc.digest()))?;
        Ok(resp.bytes().await?)
    }

    async fn config_get(&self, r: &ImageRef, desc: &Descriptor) -> Result<ImageConfiguration> {
        let raw = self.blob_get(r, desc).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn blob_put(&self, r: &ImageRef, desc: &Descriptor, blob: Bytes) -> Result<()> {
        info!("uploading blob {} to {}/{}", desc.digest(), r.registry(), r.repository());
        let url = self
            .repo_url(r)?
            .join("blobs/uploads/")
            .map_err(|e| ModError::invalid_input(format!("upload url: {e}")))?;
        let resp = self
            .request(reqwest::Method::POST, url, r, ClientScope::Push)
            .await?
            .send()
            .await?
            .error_for_status()?;

        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .ok_or_else(|| ModError::io_other("no location header in upload response"))?
            .to_str()
            .map_err(|e| ModError::parsing(format!("location header: {e}")))?;
        let mut upload_url = resp
            .url()
            .join(location)
            .map_err(|e| ModError::parsing(format!("location header: {e}")))?;
        upload_url
            .query_pairs_mut()
            .append_pair("digest", &desc.digest().to_string());

        self.request(reqwest::Method::PUT, upload_url, r, ClientScope::Push)
            .await?
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(blob.to_vec())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn blob_copy(&self, src: &ImageRef, tgt: &ImageRef, desc: &Descriptor) -> Result<()> {
        if src.same_repository(tgt) {
            return Ok(());
        }
        // cross-repository mount first, upload fallback second
        let mut url = self
            .repo_url(tgt)?
            .join("blobs/uploads/")
            .map_err(|e| ModError::invalid_input(format!("mount url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("mount", &desc.digest().to_string())
            .append_pair("from", src.repository());
        let resp = self
            .request(reqwest::Method::POST, url, tgt, ClientScope::Push)
            .await?
            .send()
            .await?;
        if resp.status() == StatusCode::CREATED {
            debug!("mounted blob {} into {}", desc.digest(), tgt.repository());
            return Ok(());
        }
        debug!("mount unavailable for {}, copying via upload", desc.digest());
        let blob = self.blob_get(src, desc).await?;
        self.blob_put(tgt, desc, blob).await
    }

    async fn referrer_list(&self, r: &ImageRef) -> Result<Vec<Descriptor>> {
        let digest = match r.digest() {
            Some(d) => d.clone(),
            None => self
                .manifest_get(r, None)
                .await?
                .descriptor()
                .digest()
                .clone(),
        };
        let url = self
            .repo_url(r)?
            .join(&format!("referrers/{digest}"))
            .map_err(|e| ModError::invalid_input(format!("referrers url: {e}")))?;
        let resp = self
            .request(reqwest::Method::GET, url, r, ClientScope::Pull)
            .await?
            .header("Accept", MediaType::ImageIndex.to_string())
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => {
                let index: ImageIndex = resp.json().await?;
                Ok(index.manifests().clone())
            }
            StatusCode::NOT_FOUND => {
                // pre-referrers-API registry: try the fallback tag
                self.referrer_fallback(r, &digest).await
            }
            _ => {
                resp.error_for_status()?;
                Ok(Vec::new())
            }
        }
    }
}

impl<const INSECURE: bool> HttpRegistryClient<INSECURE> {
    async fn referrer_fallback(&self, r: &ImageRef, digest: &Digest) -> Result<Vec<Descriptor>> {
        let algorithm = digest.algorithm().to_string();
        let hex = digest.digest();
        let take = 127usize.saturating_sub(algorithm.len());
        let tag = format!("{algorithm}-{}", &hex[..hex.len().min(take)]);
        let tag_ref = match TagName::try_from(tag) {
            Ok(t) => r.to_repository().with_tag(t),
            Err(_) => return Ok(Vec::new()),
        };
        match self.manifest_get(&tag_ref, None).await {
            Ok(m) if m.is_index() => Ok(m.as_index()?.manifests().clone()),
            Ok(_) => Ok(Vec::new()),
            Err(ModError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_digest;
    use test_log::test;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const TEST_DIGEST: &str =
        "sha256:9f64a747e1b97f131fabb6b447296c9b6f0201e79fb3c5356e6c77e89b6a806a";

    async fn token_mocks(server: &MockServer) {
        let registry = server.uri().replace("http://", "");
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                format!(
                    "Bearer realm=\"http://{server}/auth\",service=\"{server}\"",
                    server = registry
                ),
            ))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "test-token"
            })))
            .mount(server)
            .await;
    }

    #[test(tokio::test)]
    async fn test_manifest_get_with_token() {
        let server = MockServer::start().await;
        token_mocks(&server).await;
        let registry = server.uri().replace("http://", "");

        let manifest_json = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": TEST_DIGEST,
                "size": 4
            },
            "layers": []
        });
        Mock::given(method("GET"))
            .and(path("/v2/test-repo/manifests/latest"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(
                        "Content-Type",
                        "application/vnd.oci.image.manifest.v1+json",
                    )
                    .set_body_json(&manifest_json),
            )
            .mount(&server)
            .await;

        let client = HttpRegistryClient::<true>::with_auth(RegistryAuth::None);
        let r: ImageRef = format!("{registry}/test-repo:latest").parse().unwrap();
        let manifest = client.manifest_get(&r, None).await.unwrap();
        assert!(!manifest.is_index());
        assert_eq!(
            manifest.descriptor().digest(),
            &sha256_digest(manifest.raw())
        );
    }

    #[test(tokio::test)]
    async fn test_blob_upload_two_step() {
        let server = MockServer::start().await;
        let registry = server.uri().replace("http://", "");
        // open registry: /v2/ answers 200, no token needed
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/test-repo/blobs/uploads/"))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Location", "/v2/test-repo/blobs/uploads/session-1"),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2/test-repo/blobs/uploads/session-1"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::<true>::with_auth(RegistryAuth::None);
        let r: ImageRef = format!("{registry}/test-repo").parse().unwrap();
        let content = Bytes::from_static(b"data");
        let desc = Descriptor::new(
            MediaType::ImageLayerGzip,
            content.len() as u64,
            sha256_digest(&content),
        );
        client.blob_put(&r, &desc, content).await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_blob_get_not_found() {
        let server = MockServer::start().await;
        let registry = server.uri().replace("http://", "");
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/test-repo/blobs/{TEST_DIGEST}")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::<true>::with_auth(RegistryAuth::None);
        let r: ImageRef = format!("{registry}/test-repo").parse().unwrap();
        let desc = Descriptor::new(
            MediaType::ImageLayerGzip,
            4,
            TEST_DIGEST.parse().unwrap(),
        );
        assert!(matches!(
            client.blob_get(&r, &desc).await,
            Err(ModError::NotFound(_))
        ));
    }

    #[test(tokio::test)]
    async fn test_referrer_list_api() {
        let server = MockServer::start().await;
        let registry = server.uri().replace("http://", "");
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let referrers = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": TEST_DIGEST,
                "size": 4,
                "artifactType": "application/vnd.example.sbom"
            }]
        });
        Mock::given(method("GET"))
            .and(path(format!("/v2/test-repo/referrers/{TEST_DIGEST}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(&referrers))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::<true>::with_auth(RegistryAuth::None);
        let r: ImageRef = format!("{registry}/test-repo@{TEST_DIGEST}").parse().unwrap();
        let listed = client.referrer_list(&r).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].digest().to_string(), TEST_DIGEST);
    }

    #[test(tokio::test)]
    async fn test_blob_copy_mount() {
        let server = MockServer::start().await;
        let registry = server.uri().replace("http://", "");
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/tgt-repo/blobs/uploads/"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::<true>::with_auth(RegistryAuth::None);
        let src: ImageRef = format!("{registry}/src-repo").parse().unwrap();
        let tgt: ImageRef = format!("{registry}/tgt-repo").parse().unwrap();
        let desc = Descriptor::new(
            MediaType::ImageLayerGzip,
            4,
            TEST_DIGEST.parse().unwrap(),
        );
        client.blob_copy(&src, &tgt, &desc).await.unwrap();
    }
}
