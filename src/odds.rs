/// Moneyline odds conversions.
///
/// Sportsbooks quote American odds (+150 / -200); the rest of the system works
/// in decimal odds (payout multiple per unit staked, stake included) and in
/// vig-free implied probabilities.
///
/// Implied probability of a decimal price is `1 / odds`; the two sides of a
/// book sum to more than 1 because of the bookmaker margin, so we remove it by
/// proportional normalization:
///   p_home = (1/o_home) / (1/o_home + 1/o_away)
use crate::error::{BlendError, BlendResult};

/// Largest allowed deviation of `p_home + p_away` from 1 for a normalized quote.
pub const TWO_SIDED_TOLERANCE: f64 = 0.001;

/// Convert American odds to decimal odds.
///
/// `+150` → 2.5, `-200` → 1.5. Values strictly between -100 and +100 are not
/// valid American prices.
pub fn american_to_decimal(american: f64) -> BlendResult<f64> {
    if !american.is_finite() || american.abs() < 100.0 {
        return Err(BlendError::DataIntegrity(format!(
            "invalid American odds {american}"
        )));
    }
    if american > 0.0 {
        Ok(1.0 + american / 100.0)
    } else {
        Ok(1.0 + 100.0 / american.abs())
    }
}

/// Vig-free implied probabilities `(home, away)` from decimal odds.
pub fn implied_probabilities(home_odds: f64, away_odds: f64) -> BlendResult<(f64, f64)> {
    if !(home_odds > 1.0 && away_odds > 1.0) {
        return Err(BlendError::DataIntegrity(format!(
            "decimal odds must exceed 1.0 (home {home_odds}, away {away_odds})"
        )));
    }
    let raw_home = 1.0 / home_odds;
    let raw_away = 1.0 / away_odds;
    let book = raw_home + raw_away;
    Ok((raw_home / book, raw_away / book))
}

/// Bookmaker margin (overround) embedded in a pair of decimal prices.
pub fn overround(home_odds: f64, away_odds: f64) -> f64 {
    if home_odds <= 0.0 || away_odds <= 0.0 {
        return 0.0;
    }
    1.0 / home_odds + 1.0 / away_odds - 1.0
}

/// Reject a two-sided probability pair that does not sum to ~1.
pub fn check_two_sided(home_prob: f64, away_prob: f64) -> BlendResult<()> {
    if !(0.0..=1.0).contains(&home_prob) || !(0.0..=1.0).contains(&away_prob) {
        return Err(BlendError::DataIntegrity(format!(
            "probabilities out of range (home {home_prob}, away {away_prob})"
        )));
    }
    if (home_prob + away_prob - 1.0).abs() > TWO_SIDED_TOLERANCE {
        return Err(BlendError::DataIntegrity(format!(
            "probabilities sum to {:.4}, expected 1",
            home_prob + away_prob
        )));
    }
    Ok(())
}

/// Expected return per unit staked: `hit_probability × decimal_odds − 1`.
///
/// Positive values mean the price pays more than the model's belief implies.
pub fn expected_return(hit_probability: f64, decimal_odds: f64) -> f64 {
    hit_probability * decimal_odds - 1.0
}
