use rand::{rngs::StdRng, Rng};

/// Zipfian item sampler over `0..items` (Gray et al.), the usual skewed key
/// generator for storage benchmarks. `theta = 0` degenerates to uniform.
pub struct Zipfian {
    items: u64,
    theta: f64,
    alpha: f64,
    zetan: f64,
    eta: f64,
}

impl Zipfian {
    pub fn new(items: u64, theta: f64) -> Self {
        assert!(items > 0);
        assert!((0.0..1.0).contains(&theta));
        let zetan = Self::zeta(items, theta);
        let zeta2 = Self::zeta(2, theta);
        Self {
            items,
            theta,
            alpha: 1.0 / (1.0 - theta),
            zetan,
            eta: (1.0 - (2.0 / items as f64).powf(1.0 - theta)) / (1.0 - zeta2 / zetan),
        }
    }

    fn zeta(n: u64, theta: f64) -> f64 {
        (1..=n).map(|i| 1.0 / (i as f64).powf(theta)).sum()
    }

    pub fn sample(&self, rng: &mut StdRng) -> u64 {
        if self.theta == 0.0 {
            return rng.gen_range(0..self.items);
        }
        let u: f64 = rng.gen();
        let uz = u * self.zetan;
        if uz < 1.0 {
            return 0;
        }
        if uz < 1.0 + 0.5f64.powf(self.theta) {
            return 1;
        }
        let rank = (self.items as f64 * (self.eta * u - self.eta + 1.0).powf(self.alpha)) as u64;
        rank.min(self.items - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn samples_stay_in_range_and_skew_low() {
        let zipf = Zipfian::new(1000, 0.9);
        let mut rng = StdRng::seed_from_u64(7);
        let mut hits_low = 0;
        for _ in 0..10_000 {
            let v = zipf.sample(&mut rng);
            assert!(v < 1000);
            if v < 10 {
                hits_low += 1;
            }
        }
        // With theta 0.9 the head of the distribution dominates.
        assert!(hits_low > 3000, "only {hits_low} of 10000 samples in the head");
    }

    #[test]
    fn uniform_when_theta_zero() {
        let zipf = Zipfian::new(100, 0.0);
        let mut rng = StdRng::seed_from_u64(7);
        let mut hits_low = 0;
        for _ in 0..10_000 {
            if zipf.sample(&mut rng) < 10 {
                hits_low += 1;
            }
        }
        assert!((500..1500).contains(&hits_low));
    }
}
