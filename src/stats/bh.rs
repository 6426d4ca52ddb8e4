//! Benjamini-Hochberg false discovery rate adjustment.

/// Apply the BH step-up adjustment to a vector of p-values.
///
/// For sorted p-values the adjusted value is
/// `q[i] = min(p[i] * n / rank[i], q[i+1])`, capped at 1.
///
/// NaN entries mark rows where no test could be fit; they stay NaN in the
/// output and do not count toward `n`, so unfit rows never dilute the
/// adjustment of the rows that were actually tested.
pub fn adjust_bh(p_values: &[f64]) -> Vec<f64> {
    let mut q_values = vec![f64::NAN; p_values.len()];

    let mut tested: Vec<usize> = (0..p_values.len())
        .filter(|&i| p_values[i].is_finite())
        .collect();
    let n = tested.len();
    if n == 0 {
        return q_values;
    }
    tested.sort_by(|&a, &b| {
        p_values[a]
            .partial_cmp(&p_values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let n_f64 = n as f64;
    let mut running = 1.0_f64;
    for (rank, &idx) in tested.iter().enumerate().rev() {
        let adjusted = p_values[idx] * n_f64 / (rank + 1) as f64;
        running = running.min(adjusted).min(1.0);
        q_values[idx] = running;
    }
    q_values
}
