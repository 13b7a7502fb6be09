/// Computes the arithmetic mean of a slice of gaps. Returns 0.0 for empty input.
pub fn mean(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<i64>() as f64 / values.len() as f64
}

/// Computes the median of a slice of gaps.
///
/// Returns 0.0 when there are fewer than two samples; callers tell that apart
/// from a real zero median by the visit count.
pub fn median(values: &[i64]) -> f64 {
    if values.len() <= 1 {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_unstable();

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    }
}
