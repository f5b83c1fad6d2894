//! Statistical tests for experiment evaluation
//!
//! Normal CDF/quantile, Student-t tail probabilities, Welch's t-test, the
//! two-proportion z-test, power-based sample sizes and Pocock group
//! sequential boundaries. Everything here is pure and allocation-free.

use serde::{Deserialize, Serialize};

/// Running count, mean and sum of squared deviations (Welford)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub count: u64,
    pub mean: f64,
    m2: f64,
}

impl Moments {
    pub fn from_values(values: &[f64]) -> Self {
        let mut m = Self::default();
        for v in values {
            m.push(*v);
        }
        m
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Combine two partial aggregates (Chan et al.)
    pub fn merge(&mut self, other: &Moments) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n = (self.count + other.count) as f64;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / n;
        self.m2 += other.m2 + delta * delta * self.count as f64 * other.count as f64 / n;
        self.count += other.count;
    }

    /// Sample variance (n - 1)
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Outcome of a two-sample test, treatment minus control
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub effect: f64,
    pub statistic: f64,
    /// Two-sided p-value
    pub p_value: f64,
    /// Welch-Satterthwaite degrees of freedom, when applicable
    pub df: Option<f64>,
}

impl TestResult {
    /// |z| with the same two-sided p-value, for comparison against z-scale boundaries
    pub fn z_equivalent(&self) -> f64 {
        if self.p_value <= 0.0 {
            f64::INFINITY
        } else if self.p_value >= 1.0 {
            0.0
        } else {
            normal_quantile(1.0 - self.p_value / 2.0)
        }
    }

    fn degenerate(effect: f64, df: Option<f64>) -> Self {
        if effect == 0.0 {
            Self {
                effect,
                statistic: 0.0,
                p_value: 1.0,
                df,
            }
        } else {
            Self {
                effect,
                statistic: f64::INFINITY.copysign(effect),
                p_value: 0.0,
                df,
            }
        }
    }
}

/// Complementary error function (fractional error below 1.2e-7)
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let r = t * poly.exp();
    if x >= 0.0 { r } else { 2.0 - r }
}

pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Inverse standard normal CDF (Acklam's rational approximation)
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.024_25;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}

/// ln Γ(x) for x > 0 (Lanczos)
fn ln_gamma(x: f64) -> f64 {
    const COF: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000_000_000_190_015;
    for c in COF {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * ser / x).ln()
}

/// Continued fraction for the incomplete beta function
fn beta_cf(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 1000;
    const EPS: f64 = 3e-14;
    const FPMIN: f64 = 1e-300;

    let guard = |v: f64| if v.abs() < FPMIN { FPMIN } else { v };
    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 / guard(1.0 - qab * x / qap);
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta I_x(a, b)
fn inc_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let front = (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln()).exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_cf(a, b, x) / a
    } else {
        1.0 - front * beta_cf(b, a, 1.0 - x) / b
    }
}

/// Two-sided tail probability P(|T| >= |t|) for Student's t with `df` degrees of freedom
pub fn student_t_two_sided(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    inc_beta(df / 2.0, 0.5, df / (df + t * t)).clamp(0.0, 1.0)
}

/// Welch's unequal-variance t-test of `treatment` against `control`
///
/// Needs at least two observations per group.
pub fn welch_test(control: &Moments, treatment: &Moments) -> Option<TestResult> {
    if control.count < 2 || treatment.count < 2 {
        return None;
    }
    let effect = treatment.mean - control.mean;
    let va = control.variance() / control.count as f64;
    let vb = treatment.variance() / treatment.count as f64;
    let se2 = va + vb;
    let df_den =
        va * va / (control.count - 1) as f64 + vb * vb / (treatment.count - 1) as f64;
    if se2 <= 0.0 || df_den <= 0.0 {
        return Some(TestResult::degenerate(effect, None));
    }
    let df = se2 * se2 / df_den;
    let t = effect / se2.sqrt();
    Some(TestResult {
        effect,
        statistic: t,
        p_value: student_t_two_sided(t, df),
        df: Some(df),
    })
}

/// Pooled two-proportion z-test of `treatment` against `control`
pub fn two_proportion_z(
    control_successes: u64,
    control_n: u64,
    treatment_successes: u64,
    treatment_n: u64,
) -> Option<TestResult> {
    if control_n == 0 || treatment_n == 0 {
        return None;
    }
    let pa = control_successes as f64 / control_n as f64;
    let pb = treatment_successes as f64 / treatment_n as f64;
    let pooled = (control_successes + treatment_successes) as f64 / (control_n + treatment_n) as f64;
    let se = (pooled * (1.0 - pooled) * (1.0 / control_n as f64 + 1.0 / treatment_n as f64)).sqrt();
    let effect = pb - pa;
    if se <= 0.0 {
        return Some(TestResult::degenerate(effect, None));
    }
    let z = effect / se;
    Some(TestResult {
        effect,
        statistic: z,
        p_value: (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0),
        df: None,
    })
}

/// Per-group n for a continuous metric: `2 (z_{1-a/2} + z_power)^2 sigma^2 / delta^2`
pub fn required_n_continuous(alpha: f64, power: f64, sigma: f64, delta: f64) -> u64 {
    let z = normal_quantile(1.0 - alpha / 2.0) + normal_quantile(power);
    let n = 2.0 * z * z * sigma * sigma / (delta * delta);
    n.ceil().max(2.0) as u64
}

/// Per-group n to detect a shift from `baseline` to `baseline + delta` in a rate
pub fn required_n_proportion(alpha: f64, power: f64, baseline: f64, delta: f64) -> u64 {
    let p1 = baseline.clamp(0.0, 1.0);
    let p2 = (baseline + delta).clamp(0.0, 1.0);
    let diff = (p2 - p1).abs();
    if diff == 0.0 {
        return u64::MAX;
    }
    let p_bar = (p1 + p2) / 2.0;
    let za = normal_quantile(1.0 - alpha / 2.0);
    let zb = normal_quantile(power);
    let num = za * (2.0 * p_bar * (1.0 - p_bar)).sqrt()
        + zb * (p1 * (1.0 - p1) + p2 * (1.0 - p2)).sqrt();
    (num * num / (diff * diff)).ceil().max(2.0) as u64
}

const POCOCK_05: [f64; 10] = [
    1.960, 2.178, 2.289, 2.361, 2.413, 2.453, 2.485, 2.512, 2.535, 2.555,
];
const POCOCK_01: [f64; 10] = [
    2.576, 2.772, 2.873, 2.939, 2.986, 3.023, 3.053, 3.078, 3.099, 3.117,
];

/// Two-sided Pocock critical value for `looks` equally spaced analyses
///
/// Tabulated for alpha 0.05 and 0.01 up to ten looks; anything else uses the
/// (more conservative) Bonferroni split of alpha across looks.
pub fn pocock_critical(alpha: f64, looks: u32) -> f64 {
    let k = looks.max(1) as usize;
    if k <= POCOCK_05.len() {
        if (alpha - 0.05).abs() < 1e-9 {
            return POCOCK_05[k - 1];
        }
        if (alpha - 0.01).abs() < 1e-9 {
            return POCOCK_01[k - 1];
        }
    }
    normal_quantile(1.0 - alpha / (2.0 * k as f64))
}

/// Two-sided alpha implied by a z-scale critical value
pub fn alpha_for_critical(critical: f64) -> f64 {
    2.0 * (1.0 - normal_cdf(critical))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_normal_cdf_and_quantile() {
        assert!(close(normal_cdf(0.0), 0.5, 1e-7));
        assert!(close(normal_cdf(1.959_964), 0.975, 1e-6));
        assert!(close(normal_quantile(0.975), 1.959_964, 1e-5));
        assert!(close(normal_quantile(0.8), 0.841_621, 1e-5));
        assert!(close(normal_quantile(0.001), -3.090_232, 1e-5));
        for p in [0.01, 0.2, 0.5, 0.9, 0.999] {
            assert!(close(normal_cdf(normal_quantile(p)), p, 1e-6));
        }
    }

    #[test]
    fn test_student_t_tails() {
        // t_{0.975, 10} = 2.228
        assert!(close(student_t_two_sided(2.228, 10.0), 0.05, 1e-3));
        // large df approaches the normal
        assert!(close(student_t_two_sided(1.96, 1e4), 0.05, 1e-3));
        assert!(close(student_t_two_sided(0.0, 5.0), 1.0, 1e-9));
    }

    #[test]
    fn test_moments_merge_matches_sequential() {
        let all = [1.0, 2.0, 4.0, 7.0, 11.0, 16.0];
        let mut left = Moments::from_values(&all[..2]);
        let right = Moments::from_values(&all[2..]);
        left.merge(&right);
        let whole = Moments::from_values(&all);
        assert_eq!(left.count, whole.count);
        assert!(close(left.mean, whole.mean, 1e-12));
        assert!(close(left.variance(), whole.variance(), 1e-9));
    }

    #[test]
    fn test_welch_detects_shift() {
        let a = Moments::from_values(&[5.1, 4.9, 5.0, 5.2, 4.8, 5.0, 5.1, 4.9]);
        let b = Moments::from_values(&[6.1, 5.9, 6.0, 6.2, 5.8, 6.0, 6.1, 5.9]);
        let result = welch_test(&a, &b).unwrap();
        assert!(close(result.effect, 1.0, 1e-9));
        assert!(result.p_value < 1e-6);

        let same = welch_test(&a, &a).unwrap();
        assert!(close(same.p_value, 1.0, 1e-9));
        assert!(welch_test(&Moments::from_values(&[1.0]), &b).is_none());
    }

    #[test]
    fn test_two_proportion() {
        let result = two_proportion_z(100, 1000, 150, 1000).unwrap();
        assert!(close(result.effect, 0.05, 1e-12));
        // z = 0.05 / sqrt(0.125 * 0.875 * 0.002) ~ 3.38
        assert!(close(result.statistic, 3.38, 0.01));
        assert!(result.p_value < 0.001);
    }

    #[test]
    fn test_required_sample_sizes() {
        assert_eq!(required_n_continuous(0.05, 0.8, 1.0, 0.5), 63);
        let n = required_n_proportion(0.05, 0.8, 0.10, 0.05);
        assert!((680..=690).contains(&n), "got {}", n);
    }

    #[test]
    fn test_pocock_boundaries() {
        assert_eq!(pocock_critical(0.05, 1), 1.960);
        assert_eq!(pocock_critical(0.05, 5), 2.413);
        assert_eq!(pocock_critical(0.01, 3), 2.873);
        // bonferroni fallback is stricter than the nominal boundary
        assert!(pocock_critical(0.10, 4) > normal_quantile(0.95));
        assert!(alpha_for_critical(2.413) < 0.05);
    }
}
