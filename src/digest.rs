//! Digest computation and canonical JSON serialization.

use std::io::Write;

use oci_spec::image::{Descriptor, Digest};
use serde::Serialize;
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{ModError, Result};

/// Digest algorithms the engine can mint new identifiers with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Algorithm of an existing digest, for re-hashing content in kind.
    pub fn from_digest(d: &Digest) -> Result<Self> {
        match d.algorithm().to_string().as_str() {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(ModError::invalid_input(format!(
                "unsupported digest algorithm {other}"
            ))),
        }
    }

    pub fn digest(&self, bytes: &[u8]) -> Digest {
        let hex = match self {
            DigestAlgorithm::Sha256 => base16ct::lower::encode_string(&Sha256::digest(bytes)),
            DigestAlgorithm::Sha512 => base16ct::lower::encode_string(&Sha512::digest(bytes)),
        };
        Digest::try_from(format!("{}:{hex}", self.name())).expect("hex digest is always valid")
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

pub fn sha256_digest(bytes: &[u8]) -> Digest {
    DigestAlgorithm::Sha256.digest(bytes)
}

/// Incremental hasher over either supported algorithm.
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(bytes),
            Hasher::Sha512(h) => h.update(bytes),
        }
    }

    pub fn finalize(self) -> Digest {
        let (name, hex) = match self {
            Hasher::Sha256(h) => ("sha256", base16ct::lower::encode_string(&h.finalize())),
            Hasher::Sha512(h) => ("sha512", base16ct::lower::encode_string(&h.finalize())),
        };
        Digest::try_from(format!("{name}:{hex}")).expect("hex digest is always valid")
    }
}

/// Writer adapter hashing everything that passes through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, algo: DigestAlgorithm) -> Self {
        Self {
            inner,
            hasher: algo.hasher(),
            written: 0,
        }
    }

    /// Finish hashing, returning the inner writer, the digest, and the byte count.
    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, self.hasher.finalize(), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Serialize with sorted object keys so re-marshalled documents hash
/// deterministically. `serde_json::Value` objects are ordered maps.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Decode and verify a descriptor's inline `data` field against its digest
/// and size, returning the raw bytes.
pub fn inline_data(desc: &Descriptor) -> Result<Option<Vec<u8>>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let Some(data) = desc.data() else {
        return Ok(None);
    };
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| ModError::parsing(format!("descriptor data field: {e}")))?;
    if bytes.len() as u64 != desc.size() {
        return Err(ModError::parsing(format!(
            "descriptor data length {} does not match size {}",
            bytes.len(),
            desc.size()
        )));
    }
    let algo = DigestAlgorithm::from_digest(desc.digest())?;
    let computed = algo.digest(&bytes);
    if &computed != desc.digest() {
        return Err(ModError::parsing(format!(
            "descriptor data digest {computed} does not match {}",
            desc.digest()
        )));
    }
    Ok(Some(bytes))
}

/// Base64-encode blob content for a descriptor `data` field.
pub fn encode_data(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::MediaType;

    #[test]
    fn test_sha256_digest() {
        let digest = sha256_digest(b"test data");
        assert_eq!(
            digest.to_string(),
            "sha256:916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn test_sha512_digest() {
        let digest = DigestAlgorithm::Sha512.digest(b"");
        assert!(digest.to_string().starts_with("sha512:cf83e1357eefb8bd"));
    }

    #[test]
    fn test_hashing_writer_matches_oneshot() {
        let mut w = HashingWriter::new(Vec::new(), DigestAlgorithm::Sha256);
        w.write_all(b"test ").unwrap();
        w.write_all(b"data").unwrap();
        let (inner, digest, size) = w.finish();
        assert_eq!(inner, b"test data");
        assert_eq!(size, 9);
        assert_eq!(digest, sha256_digest(b"test data"));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let mut map = std::collections::HashMap::new();
        map.insert("zz", 1);
        map.insert("aa", 2);
        let bytes = canonical_json(&map).unwrap();
        assert_eq!(bytes, br#"{"aa":2,"zz":1}"#);
    }

    #[test]
    fn test_inline_data_roundtrip() {
        let content = b"{\"hello\":true}";
        let mut desc = Descriptor::new(
            MediaType::ImageConfig,
            content.len() as u64,
            sha256_digest(content),
        );
        desc.set_data(Some(encode_data(content)));
        let bytes = inline_data(&desc).unwrap().unwrap();
        assert_eq!(bytes, content);
    }

    #[test]
    fn test_inline_data_digest_mismatch() {
        let mut desc = Descriptor::new(MediaType::ImageConfig, 4, sha256_digest(b"other"));
        desc.set_data(Some(encode_data(b"data")));
        assert!(matches!(
            inline_data(&desc),
            Err(ModError::ParsingFailed(_))
        ));
    }
}
