use bytes::Bytes;
use libipld::multihash::{Code, MultihashDigest};
use libipld::Cid;

use crate::error::{Error, Result};

/// Codec tag used for payloads that carry no IPLD structure.
pub const RAW_CODEC: u64 = 0x55;

/// An immutable pair of fingerprint and payload. The fingerprint is never
/// recomputed after construction; [`Block::verified`] is the path for data
/// whose fingerprint was claimed by somebody else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Bytes,
}

impl Block {
    /// Digests `data` under `hasher` and tags the fingerprint with `codec`.
    pub fn new(codec: u64, hasher: Code, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let cid = fingerprint(codec, hasher, &data);
        Block { cid, data }
    }

    /// Accepts `data` only if it digests back to `cid`.
    pub fn verified(cid: Cid, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let hasher = Code::try_from(cid.hash().code())
            .map_err(|_| Error::UnsupportedCodec(cid.hash().code()))?;
        let computed = fingerprint(cid.codec(), hasher, &data);
        if computed != cid {
            return Err(Error::FingerprintMismatch {
                expected: cid,
                computed,
            });
        }
        Ok(Block { cid, data })
    }

    /// For payloads whose fingerprint was checked on the way in (storage
    /// reads under a verified key).
    pub(crate) fn from_trusted(cid: Cid, data: impl Into<Bytes>) -> Self {
        Block {
            cid,
            data: data.into(),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_inner(self) -> (Cid, Bytes) {
        (self.cid, self.data)
    }
}

/// Deterministic content fingerprint: two payloads share one iff they are
/// byte-equal under the same codec and hasher.
pub fn fingerprint(codec: u64, hasher: Code, data: &[u8]) -> Cid {
    Cid::new_v1(codec, hasher.digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint(RAW_CODEC, Code::Sha2_256, b"hi data");
        let b = fingerprint(RAW_CODEC, Code::Sha2_256, b"hi data");
        assert_eq!(a, b);
        let c = fingerprint(RAW_CODEC, Code::Sha2_256, b"hi datb");
        assert_ne!(a, c);
    }

    #[test]
    fn empty_payload_has_well_defined_fingerprint() {
        let a = Block::new(RAW_CODEC, Code::Sha2_256, Vec::new());
        assert!(a.is_empty());
        assert_eq!(a.cid(), &fingerprint(RAW_CODEC, Code::Sha2_256, b""));
    }

    #[test]
    fn verified_rejects_tampered_payload() {
        let block = Block::new(RAW_CODEC, Code::Sha2_256, &b"payload"[..]);
        let err = Block::verified(*block.cid(), &b"payloae"[..]).unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { .. }));
    }
}
