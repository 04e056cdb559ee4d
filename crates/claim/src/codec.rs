//! Binary wire codec for [`ClaimMessage`].
//!
//! Wire format (big-endian):
//! `[tx_hash: varlen][signature: varlen][count: u32]` followed by `count` ×
//! `[artist_id: varlen][share: f32]`, where `varlen = [len: u16][utf8 bytes]`.
//!
//! Pairs are written in artist-id order. Decoding is strict: truncation, bad
//! UTF-8, a count that overruns the buffer or trailing bytes all fail with
//! [`CodecError::MalformedMessage`]. Share values are not judged here.

use encore_core::ArtistSplits;

use crate::{ClaimMessage, CodecError};

/// Overlay message id of the claim message.
pub const CLAIM_MESSAGE_ID: u8 = 12;

const VARLEN_PREFIX: usize = 2;
const COUNT_SIZE: usize = 4;
const SHARE_SIZE: usize = 4;

/// Smallest possible encoded pair: empty artist id plus a share.
const MIN_PAIR_SIZE: usize = VARLEN_PREFIX + SHARE_SIZE;

/// Encode a claim. Fails with [`CodecError::FieldTooLong`] when a string
/// does not fit its `u16` length prefix.
pub fn encode(claim: &ClaimMessage) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(
        2 * VARLEN_PREFIX
            + claim.tx_hash.len()
            + claim.signature.len()
            + COUNT_SIZE
            + claim.artist_splits.len() * (MIN_PAIR_SIZE + 32),
    );
    put_varlen(&mut buf, &claim.tx_hash, "tx_hash")?;
    put_varlen(&mut buf, &claim.signature, "signature")?;
    let count = u32::try_from(claim.artist_splits.len()).map_err(|_| {
        CodecError::MalformedMessage(format!("{} artist splits", claim.artist_splits.len()))
    })?;
    buf.extend_from_slice(&count.to_be_bytes());
    for (artist, share) in &claim.artist_splits {
        put_varlen(&mut buf, artist, "artist id")?;
        buf.extend_from_slice(&share.to_be_bytes());
    }
    Ok(buf)
}

/// Decode a claim from exactly `data`.
pub fn decode(data: &[u8]) -> Result<ClaimMessage, CodecError> {
    let mut reader = Reader::new(data);

    let tx_hash = reader.varlen("tx_hash")?;
    let signature = reader.varlen("signature")?;
    let count = reader.u32("split count")? as usize;

    if count > reader.remaining() / MIN_PAIR_SIZE {
        return Err(CodecError::MalformedMessage(format!(
            "split count {} overruns {} remaining bytes",
            count,
            reader.remaining()
        )));
    }

    let mut artist_splits = ArtistSplits::new();
    for i in 0..count {
        let artist = reader.varlen("artist id")?;
        let share = f32::from_be_bytes(reader.array::<SHARE_SIZE>("share")?);
        if artist_splits.insert(artist, share).is_some() {
            return Err(CodecError::MalformedMessage(format!(
                "duplicate artist at pair {}",
                i
            )));
        }
    }

    if reader.remaining() != 0 {
        return Err(CodecError::MalformedMessage(format!(
            "{} trailing bytes",
            reader.remaining()
        )));
    }

    Ok(ClaimMessage {
        tx_hash,
        signature,
        artist_splits,
    })
}

fn put_varlen(buf: &mut Vec<u8>, s: &str, field: &'static str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        len: s.len(),
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::MalformedMessage(format!(
                "truncated {}: need {} bytes at offset {}, have {}",
                what,
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u32(&mut self, what: &str) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array::<4>(what)?))
    }

    fn varlen(&mut self, what: &str) -> Result<String, CodecError> {
        let len = u16::from_be_bytes(self.array::<2>(what)?) as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::MalformedMessage(format!("{} is not valid UTF-8", what)))
    }
}
