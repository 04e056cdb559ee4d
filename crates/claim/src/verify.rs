//! Pluggable signature check applied to claims before funds are distributed.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::ClaimMessage;

/// Decides whether a claim's signature is acceptable.
///
/// `payer` is the settlement address the funds arrived from, when the wallet
/// reported one.
pub trait ClaimVerifier: Send + Sync {
    fn verify_signature(&self, claim: &ClaimMessage, payer: Option<&str>) -> bool;
}

/// Accepts every claim. Logs a warning the first time it is consulted.
#[derive(Debug, Default)]
pub struct UncheckedVerifier {
    warned: AtomicBool,
}

impl UncheckedVerifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClaimVerifier for UncheckedVerifier {
    fn verify_signature(&self, claim: &ClaimMessage, _payer: Option<&str>) -> bool {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                "Claim signatures are not checked (first claim: {})",
                claim.tx_hash
            );
        }
        true
    }
}

/// Rejects every claim.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingVerifier;

impl ClaimVerifier for RejectingVerifier {
    fn verify_signature(&self, _claim: &ClaimMessage, _payer: Option<&str>) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_core::ArtistSplits;

    fn claim() -> ClaimMessage {
        let mut splits = ArtistSplits::new();
        splits.insert("a".into(), 1.0);
        ClaimMessage::new("tx", splits)
    }

    #[test]
    fn test_unchecked_accepts() {
        let verifier = UncheckedVerifier::new();
        assert!(verifier.verify_signature(&claim(), None));
        assert!(verifier.verify_signature(&claim(), Some("payer")));
        assert!(verifier.warned.load(Ordering::Relaxed));
    }

    #[test]
    fn test_rejecting_rejects() {
        assert!(!RejectingVerifier.verify_signature(&claim(), Some("payer")));
    }

    #[test]
    fn test_verifier_as_trait_object() {
        let verifiers: Vec<Box<dyn ClaimVerifier>> =
            vec![Box::new(UncheckedVerifier::new()), Box::new(RejectingVerifier)];
        let accepted: Vec<bool> = verifiers
            .iter()
            .map(|v| v.verify_signature(&claim(), None))
            .collect();
        assert_eq!(accepted, vec![true, false]);
    }
}
