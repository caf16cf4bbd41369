use statrs::distribution::{Discrete, Hypergeometric};
use statrs::statistics::Statistics;
use core::f64::consts::PI;

use crate::data_struct::MoapError;

//Anything smaller than this is reported as this, so -log10(p) stays finite
pub const MIN_PVALUE: f64 = f64::MIN_POSITIVE;

const KS_SERIES_TERMS: usize = 100;
const KS_SERIES_EPS: f64 = 1e-16;

pub fn clamp_pvalue(p: f64) -> f64 {
    if p.is_nan() { return 1.0; }
    p.max(MIN_PVALUE).min(1.0)
}

/// P(X >= observed) for X ~ Hypergeometric(population, successes, draws).
///
/// The tail is summed from the pmf instead of taken as 1-cdf: we care about
/// tiny p-values and 1-cdf loses all of them.
pub fn hypergeom_sf_inclusive(observed: u64, population: u64, successes: u64, draws: u64) -> Result<f64, MoapError> {

    if observed == 0 {
        return Ok(1.0);
    }

    let dist = Hypergeometric::new(population, successes, draws).map_err(|e| MoapError::Model(e.to_string()))?;

    let upper = successes.min(draws);
    if observed > upper {
        return Ok(MIN_PVALUE);
    }

    let tail: f64 = (observed..=upper).map(|k| dist.ln_pmf(k).exp()).sum();
    Ok(clamp_pvalue(tail))
}

/// Two sided, two sample Kolmogorov-Smirnov test. Returns (D, p).
///
/// The p-value uses the asymptotic Kolmogorov distribution with Stephens'
/// small sample correction to the effective sample size. An empty sample
/// gives (0, 1).
pub fn ks_2samp(first: &[f64], second: &[f64]) -> (f64, f64) {

    if first.is_empty() || second.is_empty() {
        return (0.0, 1.0);
    }

    let mut a = first.to_vec();
    let mut b = second.to_vec();
    a.sort_by(|x, y| x.total_cmp(y));
    b.sort_by(|x, y| x.total_cmp(y));

    let (n1, n2) = (a.len(), b.len());
    let (mut i, mut j) = (0_usize, 0_usize);
    let mut d = 0.0_f64;

    while i < n1 && j < n2 {
        let v = a[i].min(b[j]);
        while i < n1 && a[i] <= v { i += 1; }
        while j < n2 && b[j] <= v { j += 1; }
        d = d.max(((i as f64)/(n1 as f64) - (j as f64)/(n2 as f64)).abs());
    }

    let en = ((n1*n2) as f64 / ((n1+n2) as f64)).sqrt();
    let lambda = (en + 0.12 + 0.11/en)*d;

    (d, clamp_pvalue(kolmogorov_sf(lambda)))
}

/// Survival function of the Kolmogorov distribution, Q(lambda) = P(K > lambda).
pub fn kolmogorov_sf(lambda: f64) -> f64 {

    if lambda <= 0.0 {
        return 1.0;
    }

    if lambda < 1.18 {
        //The alternating series converges horribly here, so use the Jacobi theta form of the cdf
        let y = -PI*PI/(8.0*lambda*lambda);
        let cdf = (2.0*PI).sqrt()/lambda * (0..KS_SERIES_TERMS).map(|k| {
            let odd = (2*k+1) as f64;
            (odd*odd*y).exp()
        }).sum::<f64>();
        return (1.0-cdf).max(0.0).min(1.0);
    }

    let mut sum = 0.0_f64;
    for j in 1..=KS_SERIES_TERMS {
        let jf = j as f64;
        let term = (-2.0*jf*jf*lambda*lambda).exp();
        sum += if j % 2 == 1 { term } else { -term };
        if term < KS_SERIES_EPS { break; }
    }
    (2.0*sum).max(0.0).min(1.0)
}

/// Benjamini-Hochberg adjusted p-values, in the order of the input.
pub fn benjamini_hochberg(pvalues: &[f64]) -> Vec<f64> {

    let m = pvalues.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| pvalues[a].total_cmp(&pvalues[b]));

    let mut adjusted = vec![1.0; m];
    let mut running_min = 1.0_f64;

    for (rank, &idx) in order.iter().enumerate().rev() {
        let padj = pvalues[idx]*(m as f64)/((rank+1) as f64);
        running_min = running_min.min(padj).min(1.0);
        adjusted[idx] = running_min;
    }

    adjusted
}

/// Median with the two middle values averaged for even lengths. NaN if empty.
pub fn median(values: &[f64]) -> f64 {
    quantile(values, 0.5)
}

/// Quantile with linear interpolation between the closest ranks. NaN if empty.
pub fn quantile(values: &[f64], q: f64) -> f64 {

    if values.is_empty() {
        return f64::NAN;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = q.max(0.0).min(1.0)*((sorted.len()-1) as f64);
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - (lo as f64);

    sorted[lo] + (sorted[hi]-sorted[lo])*frac
}

/// Index of the first maximum. NaN never wins.
pub fn argmax_first(values: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() { continue; }
        match best {
            Some(b) if values[b] >= v => (),
            _ => best = Some(i),
        }
    }
    best
}

pub fn mean(values: &[f64]) -> f64 {
    values.iter().mean()
}

pub fn population_sd(values: &[f64]) -> f64 {
    values.iter().population_std_dev()
}

#[cfg(test)]
mod tester {

    use super::*;

    #[test]
    fn hypergeometric_tail() {

        //P(X >= 0) is always 1
        assert_eq!(hypergeom_sf_inclusive(0, 10, 4, 3).unwrap(), 1.0);

        //All 3 draws from the 3 successes in a population of 10: 1/C(10,3)
        let p = hypergeom_sf_inclusive(3, 10, 3, 3).unwrap();
        assert!((p - 1.0/120.0).abs() < 1e-12);

        //P(X >= 1) = 1 - P(X = 0) = 1 - C(6,3)/C(10,3)
        let p = hypergeom_sf_inclusive(1, 10, 4, 3).unwrap();
        assert!((p - (1.0 - 20.0/120.0)).abs() < 1e-12);

        assert!(hypergeom_sf_inclusive(1, 3, 5, 1).is_err());
    }

    #[test]
    fn ks_statistic_and_pvalue() {

        let a: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let (d, p) = ks_2samp(&a, &a);
        assert_eq!(d, 0.0);
        assert_eq!(p, 1.0);

        let b: Vec<f64> = (0..50).map(|i| (i+100) as f64).collect();
        let (d, p) = ks_2samp(&a, &b);
        assert_eq!(d, 1.0);
        assert!(p < 1e-10 && p > 0.0);

        assert_eq!(ks_2samp(&[], &a), (0.0, 1.0));
    }

    #[test]
    fn kolmogorov_branches_agree() {
        //Both forms of Q are valid near the switch point
        let lambda: f64 = 1.18;
        let series = 2.0*(1..100).map(|j| {
            let jf = j as f64;
            let t = (-2.0*jf*jf*lambda*lambda).exp();
            if j % 2 == 1 { t } else { -t }
        }).sum::<f64>();
        assert!((kolmogorov_sf(lambda - 1e-12) - series).abs() < 1e-8);
        assert!((kolmogorov_sf(1.36) - 0.0494).abs() < 1e-3);
        assert_eq!(kolmogorov_sf(0.0), 1.0);
    }

    #[test]
    fn bh_matches_hand_computation() {
        let p = [0.01, 0.04, 0.03, 0.5];
        let adj = benjamini_hochberg(&p);
        assert!((adj[0]-0.04).abs() < 1e-12);
        //0.03*4/2 = 0.06 is pulled down to 0.04*4/3 by monotonicity
        assert!((adj[1]-0.16/3.0).abs() < 1e-12);
        assert!((adj[2]-0.16/3.0).abs() < 1e-12);
        assert!((adj[3]-0.5).abs() < 1e-12);
        assert!(benjamini_hochberg(&[]).is_empty());
    }

    #[test]
    fn order_statistics() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert!(median(&[]).is_nan());
        assert!((quantile(&[1.0, 2.0, 3.0, 4.0, 5.0], 0.99) - 4.96).abs() < 1e-12);
        assert!((quantile(&[1.0, 2.0, 3.0, 4.0, 5.0], 0.01) - 1.04).abs() < 1e-12);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(argmax_first(&[0.2, 0.7, f64::NAN, 0.7]), Some(1));
        assert_eq!(argmax_first(&[f64::NAN]), None);
        assert!((population_sd(&[1.0, 3.0]) - 1.0).abs() < 1e-12);
    }
}
