//! Splitting a confirmed contribution into per-artist amounts.

use encore_core::{ArtistAmounts, ArtistSplits, Satoshis};

/// Slack for float shares whose decimal form multiplies to a whole amount
/// but whose binary form lands just below it.
const ROUNDING_EPSILON: f64 = 1e-6;

/// Credit each artist `floor(share × amount)`.
///
/// Shares are read through their shortest decimal form, so `0.7 × 1000` is
/// 700 rather than 699. Splits summing above 1.0 are scaled down and the
/// result never exceeds `amount` in total. Artists whose credit rounds to zero
/// are omitted.
pub fn allocate(splits: &ArtistSplits, amount: Satoshis) -> ArtistAmounts {
    let mut credited = ArtistAmounts::new();
    if amount <= 0 {
        return credited;
    }

    let shares: Vec<(&String, f64)> = splits
        .iter()
        .filter(|(_, s)| s.is_finite() && **s > 0.0)
        .map(|(artist, share)| (artist, decimal(*share)))
        .collect();
    let sum: f64 = shares.iter().map(|(_, s)| s).sum();
    let scale = if sum > 1.0 { 1.0 / sum } else { 1.0 };

    for (artist, share) in shares {
        let exact = share * scale * amount as f64;
        let value = (exact + ROUNDING_EPSILON).floor() as Satoshis;
        if value > 0 {
            credited.insert(artist.clone(), value);
        }
    }

    let total: Satoshis = credited.values().sum();
    if total > amount {
        trim_excess(&mut credited, total - amount);
    }
    credited
}

fn decimal(share: f32) -> f64 {
    share.to_string().parse().unwrap_or(share as f64)
}

fn trim_excess(credited: &mut ArtistAmounts, mut excess: Satoshis) {
    let mut by_size: Vec<(String, Satoshis)> =
        credited.iter().map(|(a, v)| (a.clone(), *v)).collect();
    by_size.sort_by(|a, b| b.1.cmp(&a.1));
    for (artist, value) in by_size {
        if excess == 0 {
            break;
        }
        let cut = excess.min(value);
        excess -= cut;
        if cut == value {
            credited.remove(&artist);
        } else if let Some(v) = credited.get_mut(&artist) {
            *v -= cut;
        }
    }
}
