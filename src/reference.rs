//! Image references, covering remote registries and local OCI layout
//! directories (`ocidir://path:tag`).

use std::fmt::Display;
use std::str::FromStr;

use oci_spec::distribution::Reference;
use oci_spec::image::Digest;

use crate::error::{ModError, Result};

/// Validated tag name per the distribution tag grammar.
#[nutype::nutype(
    derive(Display, Debug, Clone, Deserialize, TryFrom, Deref, PartialEq, Eq),
    validate(regex = "^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$")
)]
pub struct TagName(String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefScheme {
    /// Remote registry over the distribution API.
    Registry,
    /// Local OCI image-layout directory.
    OciDir,
}

/// A parsed image reference: where an image lives plus an optional tag
/// and/or digest pin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    scheme: RefScheme,
    /// Registry host, or the layout directory path for `ocidir://`.
    registry: String,
    /// Repository within the registry; empty for `ocidir://`.
    repository: String,
    tag: Option<TagName>,
    digest: Option<Digest>,
}

impl ImageRef {
    pub fn scheme(&self) -> RefScheme {
        self.scheme
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Layout directory path for `ocidir://` references.
    pub fn path(&self) -> &str {
        &self.registry
    }

    pub fn tag(&self) -> Option<&TagName> {
        self.tag.as_ref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// True when both references name the same repository, ignoring tag and
    /// digest pins.
    pub fn same_repository(&self, other: &ImageRef) -> bool {
        self.scheme == other.scheme
            && self.registry == other.registry
            && self.repository == other.repository
    }

    pub fn with_digest(&self, digest: Digest) -> ImageRef {
        ImageRef {
            digest: Some(digest),
            ..self.clone()
        }
    }

    pub fn with_tag(&self, tag: TagName) -> ImageRef {
        ImageRef {
            tag: Some(tag),
            digest: None,
            ..self.clone()
        }
    }

    /// Repository-only reference: tag and digest cleared.
    pub fn to_repository(&self) -> ImageRef {
        ImageRef {
            tag: None,
            digest: None,
            ..self.clone()
        }
    }

    /// The name a manifest should be pushed or fetched under: the digest pin
    /// when present, otherwise the tag.
    pub fn name(&self) -> Result<String> {
        if let Some(d) = &self.digest {
            return Ok(d.to_string());
        }
        if let Some(t) = &self.tag {
            return Ok(t.to_string());
        }
        Err(ModError::invalid_input(format!(
            "reference {self} has neither tag nor digest"
        )))
    }
}

impl FromStr for ImageRef {
    type Err = ModError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("ocidir://") {
            return parse_ocidir(rest);
        }
        let reference = Reference::try_from(s.to_string())
            .map_err(|e| ModError::invalid_input(format!("reference {s}: {e}")))?;
        let tag = match reference.tag() {
            Some(t) => Some(
                TagName::try_from(t.to_string())
                    .map_err(|e| ModError::invalid_input(format!("tag in {s}: {e}")))?,
            ),
            None => None,
        };
        let digest = match reference.digest() {
            Some(d) => Some(
                Digest::from_str(d)
                    .map_err(|e| ModError::invalid_input(format!("digest in {s}: {e}")))?,
            ),
            None => None,
        };
        Ok(ImageRef {
            scheme: RefScheme::Registry,
            registry: reference.registry().to_string(),
            repository: reference.repository().to_string(),
            tag,
            digest,
        })
    }
}

fn parse_ocidir(rest: &str) -> Result<ImageRef> {
    let (rest, digest) = match rest.split_once('@') {
        Some((head, d)) => (
            head,
            Some(
                Digest::from_str(d)
                    .map_err(|e| ModError::invalid_input(format!("digest in ocidir ref: {e}")))?,
            ),
        ),
        None => (rest, None),
    };
    // A colon after the final path separator introduces the tag.
    let (path, tag) = match rest.rsplit_once(':') {
        Some((path, tag)) if !tag.contains('/') => (
            path,
            Some(
                TagName::try_from(tag.to_string())
                    .map_err(|e| ModError::invalid_input(format!("tag in ocidir ref: {e}")))?,
            ),
        ),
        _ => (rest, None),
    };
    if path.is_empty() {
        return Err(ModError::invalid_input("empty ocidir path"));
    }
    Ok(ImageRef {
        scheme: RefScheme::OciDir,
        registry: path.to_string(),
        repository: String::new(),
        tag,
        digest,
    })
}

impl Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.scheme {
            RefScheme::OciDir => write!(f, "ocidir://{}", self.registry)?,
            RefScheme::Registry => {
                if self.registry.is_empty() {
                    write!(f, "{}", self.repository)?;
                } else {
                    write!(f, "{}/{}", self.registry, self.repository)?;
                }
            }
        }
        if let Some(t) = &self.tag {
            write!(f, ":{t}")?;
        }
        if let Some(d) = &self.digest {
            write!(f, "@{d}")?;
        }
        Ok(())
    }
}
