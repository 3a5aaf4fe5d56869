//! Weighted target selection via the Vose alias method.
//!
//! Preprocessing is O(n); every pick is O(1): sample a column uniformly,
//! then flip a biased coin to choose between the column's own target and
//! its alias. The table is immutable once built, so concurrent picks need
//! no locking.

use rand::Rng;

use crate::config::TargetConfig;
use crate::error::AppError;
use crate::task::Task;

/// O(1) weighted random selector over a fixed target set.
pub struct Selector {
    targets: Vec<TargetConfig>,
    prob: Vec<f64>,
    alias: Vec<usize>,
}

impl Selector {
    /// Builds the alias table from the target list.
    ///
    /// Fails on an empty list or a non-positive total weight.
    pub fn new(targets: &[TargetConfig]) -> Result<Selector, AppError> {
        let n = targets.len();
        if n == 0 {
            return Err(AppError::Selector(
                "selector requires at least one target".into(),
            ));
        }

        let total_weight: u64 = targets.iter().map(|t| u64::from(t.weight)).sum();
        if total_weight == 0 {
            return Err(AppError::Selector("total weight must be > 0".into()));
        }

        let mut prob = vec![0.0f64; n];
        let mut alias = vec![0usize; n];

        // Scale each weight so the expected value per slot is 1.
        let mut scaled: Vec<f64> = targets
            .iter()
            .map(|t| f64::from(t.weight) * n as f64 / total_weight as f64)
            .collect();

        let mut small: Vec<usize> = Vec::with_capacity(n);
        let mut large: Vec<usize> = Vec::with_capacity(n);
        for (i, &p) in scaled.iter().enumerate() {
            if p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        // Pair each under-full slot with an over-full donor; the donor's
        // residual weight shrinks and re-enters whichever list fits.
        while let (Some(l), Some(g)) = (small.pop(), large.pop()) {
            prob[l] = scaled[l];
            alias[l] = g;
            scaled[g] = (scaled[g] + scaled[l]) - 1.0;

            if scaled[g] < 1.0 {
                small.push(g);
            } else {
                large.push(g);
            }
        }

        // Remaining residuals settle to exactly 1 (modulo float error).
        for g in large {
            prob[g] = 1.0;
        }
        for l in small {
            prob[l] = 1.0;
        }

        Ok(Selector {
            targets: targets.to_vec(),
            prob,
            alias,
        })
    }

    /// Picks a target with probability proportional to its weight.
    pub fn pick(&self) -> Task {
        let mut rng = rand::thread_rng();
        let i = rng.gen_range(0..self.targets.len());
        let idx = if rng.gen::<f64>() < self.prob[i] {
            i
        } else {
            self.alias[i]
        };

        let t = &self.targets[idx];
        Task {
            url: t.url.clone(),
            kind: t.kind,
            config: t.clone(),
        }
    }

    /// Number of targets in the set.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    fn target(url: &str, weight: u32) -> TargetConfig {
        TargetConfig {
            url: url.to_string(),
            weight,
            kind: TaskKind::Http,
            ..TargetConfig::default()
        }
    }

    #[test]
    fn rejects_empty_target_list() {
        assert!(Selector::new(&[]).is_err());
    }

    #[test]
    fn rejects_zero_total_weight() {
        assert!(Selector::new(&[target("https://a.example", 0)]).is_err());
    }

    #[test]
    fn single_target_always_picked() {
        let sel = Selector::new(&[target("https://a.example", 3)]).unwrap();
        for _ in 0..100 {
            assert_eq!(sel.pick().url, "https://a.example");
        }
    }

    #[test]
    fn distribution_follows_weights() {
        let sel = Selector::new(&[
            target("https://a.example", 1),
            target("https://b.example", 3),
            target("https://c.example", 6),
        ])
        .unwrap();

        const N: usize = 10_000;
        let mut counts = [0usize; 3];
        for _ in 0..N {
            match sel.pick().url.as_str() {
                "https://a.example" => counts[0] += 1,
                "https://b.example" => counts[1] += 1,
                _ => counts[2] += 1,
            }
        }

        let expected = [0.1, 0.3, 0.6];
        for (i, &count) in counts.iter().enumerate() {
            let observed = count as f64 / N as f64;
            assert!(
                (observed - expected[i]).abs() < 0.05,
                "slot {i}: observed {observed:.3}, expected {:.1}",
                expected[i]
            );
        }
    }

    #[test]
    fn duplicate_urls_are_weighted_independently() {
        let sel = Selector::new(&[
            target("https://a.example", 1),
            target("https://a.example", 1),
        ])
        .unwrap();
        assert_eq!(sel.len(), 2);
        assert_eq!(sel.pick().url, "https://a.example");
    }

    #[test]
    fn pick_snapshots_target_config() {
        let mut t = target("https://a.example", 1);
        t.http.method = "POST".to_string();
        let sel = Selector::new(&[t]).unwrap();
        let task = sel.pick();
        assert_eq!(task.kind, TaskKind::Http);
        assert_eq!(task.config.http.method, "POST");
    }
}
