//! Encore Claim
//!
//! The contribution claim a listener sends to the payout node: a funding
//! transaction hash, the payer's signature over it and the per-artist split.
//! Provides the binary wire codec, the canonical signable string and the
//! pluggable signature check.

pub mod codec;
pub mod verify;

pub use codec::{decode, encode, CLAIM_MESSAGE_ID};
pub use verify::{ClaimVerifier, RejectingVerifier, UncheckedVerifier};

use encore_core::ArtistSplits;
use thiserror::Error;

/// Allowed deviation of the split sum from 1.0.
pub const SPLIT_SUM_TOLERANCE: f32 = 1e-3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed claim message: {0}")]
    MalformedMessage(String),
    #[error("{field} is {len} bytes, limit is 65535")]
    FieldTooLong { field: &'static str, len: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SplitError {
    #[error("claim has no artist splits")]
    Empty,
    #[error("share {share} for artist {artist} is outside [0, 1]")]
    ShareOutOfRange { artist: String, share: f32 },
    #[error("shares sum to {0}, expected 1.0")]
    BadSum(f32),
    #[error("empty artist id")]
    EmptyArtist,
}

/// A signed contribution claim as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimMessage {
    pub tx_hash: String,
    pub signature: String,
    pub artist_splits: ArtistSplits,
}

impl ClaimMessage {
    /// Unsigned claim; fill `signature` after signing [`Self::signable_string`].
    pub fn new(tx_hash: &str, artist_splits: ArtistSplits) -> Self {
        Self {
            tx_hash: tx_hash.to_string(),
            signature: String::new(),
            artist_splits,
        }
    }

    pub fn signable_string(&self) -> String {
        signable_string(&self.tx_hash, &self.artist_splits)
    }

    /// Semantic check of the split: non-empty, shares in [0, 1], sum ≈ 1.
    pub fn validate_splits(&self) -> Result<(), SplitError> {
        if self.artist_splits.is_empty() {
            return Err(SplitError::Empty);
        }
        let mut sum = 0.0f32;
        for (artist, &share) in &self.artist_splits {
            if artist.is_empty() {
                return Err(SplitError::EmptyArtist);
            }
            if !share.is_finite() || !(0.0..=1.0).contains(&share) {
                return Err(SplitError::ShareOutOfRange {
                    artist: artist.clone(),
                    share,
                });
            }
            sum += share;
        }
        if (sum - 1.0).abs() > SPLIT_SUM_TOLERANCE {
            return Err(SplitError::BadSum(sum));
        }
        Ok(())
    }
}

/// Canonical string the payer signs: `tx_hash` then `|artist:share` per split,
/// sorted by artist id so any map iteration order yields the same bytes.
pub fn signable_string<'a, I>(tx_hash: &str, splits: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a f32)>,
{
    let mut sorted: Vec<(&String, &f32)> = splits.into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = String::from(tx_hash);
    for (artist, share) in sorted {
        out.push('|');
        out.push_str(artist);
        out.push(':');
        out.push_str(&format!("{:?}", share));
    }
    out
}
