/// Round up `n` to the nearest `to`
pub const fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// `numerator / denominator` as a ratio, where an empty denominator counts as
/// fully occupied
pub fn occupancy(numerator: u64, denominator: usize) -> f64 {
    if denominator == 0 {
        1.0
    } else {
        numerator as f64 / denominator as f64
    }
}
