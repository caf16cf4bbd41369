pub mod data_struct;
pub mod stats;
pub mod linear;
pub mod classifier;
pub mod point;
pub mod regression;
pub mod mcmc;
pub mod mara;
pub mod cluster;
pub mod more;

pub use crate::data_struct::{ActivityTable, LabelMatrix, MoapError, ScoreMatrix, Significance};
pub use crate::point::{ClassicMoap, KsMoap};
pub use crate::regression::{LassoMoap, LightningMoap};
pub use crate::mara::{MaraConfig, MaraMoap};
pub use crate::more::{MoreConfig, MoreMoap};

use once_cell::sync::Lazy;
use rand::SeedableRng;
use rand::rngs::StdRng;
use strum_macros::{Display, EnumIter, EnumString};

//Regularization strengths are exp(-x) for x = 0, step, 2*step, ... < ALPHA_GRID_END
pub const ALPHA_GRID_END: f64 = 10.0;
pub const DEFAULT_ALPHA_STEP: f64 = 1.0/3.0;

pub const NULL_PERMUTATIONS: usize = 10;
pub const BAGGING_ROUNDS: usize = 10;
pub const BAGGING_FRACTION: f64 = 0.75;

pub const DEFAULT_THREADS: usize = 4;

pub static ALPHA_GRID: Lazy<Vec<f64>> = Lazy::new(|| alpha_grid(DEFAULT_ALPHA_STEP));

pub fn alpha_grid(step: f64) -> Vec<f64> {
    //same length rule as a half open float range; the epsilon keeps 10/(1/3) from rounding up to 31
    let n = (ALPHA_GRID_END/step - 1e-9).ceil() as usize;
    (0..n).map(|i| (-(i as f64)*step).exp()).collect()
}

/// Every motif activity estimator shares this contract: fit a region x motif
/// score matrix against region aligned labels, then read the activity table.
pub trait Moap {

    fn fit(&mut self, x: &ScoreMatrix, y: &LabelMatrix) -> Result<(), MoapError>;

    /// None until a fit succeeded.
    fn activity(&self) -> Option<&ActivityTable>;

    /// Only the permutation based estimators produce significance flags.
    fn significance(&self) -> Option<&Significance> {
        None
    }

    fn method(&self) -> Method;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Method {
    Classic,
    Ks,
    Lasso,
    Lightning,
    Mara,
    More,
}

impl Method {

    /// A default configured estimator. The seed is used by the stochastic estimators only.
    pub fn estimator(&self, seed: Option<u64>) -> Box<dyn Moap + Send> {
        match self {
            Method::Classic => Box::new(ClassicMoap::new()),
            Method::Ks => Box::new(KsMoap::new()),
            Method::Lasso => Box::new(LassoMoap::new().with_seed(seed)),
            Method::Lightning => Box::new(LightningMoap::new().with_seed(seed)),
            Method::Mara => Box::new(MaraMoap::new(MaraConfig { seed, ..MaraConfig::default() })),
            Method::More => Box::new(MoreMoap::new(MoreConfig { seed, ..MoreConfig::default() })),
        }
    }
}

pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

pub(crate) fn thread_pool(n_threads: usize) -> Result<rayon::ThreadPool, MoapError> {
    Ok(rayon::ThreadPoolBuilder::new().num_threads(n_threads.max(1)).build()?)
}

#[cfg(test)]
mod tester {

    use super::*;
    use std::str::FromStr;
    use rand::distributions::{Distribution, Uniform};
    use strum::IntoEnumIterator;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn grid_matches_numpy_arange() {
        assert_eq!(ALPHA_GRID.len(), 30);
        assert_eq!(ALPHA_GRID[0], 1.0);
        assert!((ALPHA_GRID[3] - (-1.0_f64).exp()).abs() < 1e-12);
        assert!(ALPHA_GRID.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(alpha_grid(1.0).len(), 10);
    }

    #[test]
    fn methods_round_trip_their_names() {
        for method in Method::iter() {
            let name = method.to_string();
            assert_eq!(Method::from_str(&name).unwrap(), method);
            assert_eq!(method.estimator(Some(1)).method(), method);
        }
        assert_eq!(Method::from_str("ks").unwrap(), Method::Ks);
        assert!(Method::from_str("bayes").is_err());
    }

    //100 regions x 5 motifs of uniform scores, clusters 0, 1, 2 assigned round robin
    fn uniform_problem(seed: u64, counts: bool) -> (ScoreMatrix, LabelMatrix) {
        let mut rng = StdRng::seed_from_u64(seed);
        let die = Uniform::from(0.0..1.0);
        let count_die = Uniform::from(0..4_u32);
        let rows: Vec<Vec<f64>> = (0..100).map(|_| (0..5).map(|_| {
            if counts { count_die.sample(&mut rng) as f64 } else { die.sample(&mut rng) }
        }).collect()).collect();
        let x = ScoreMatrix::from_rows(names("region", 100), names("motif", 5), &rows).unwrap();
        let y = LabelMatrix::from_column(names("region", 100), "cluster", (0..100).map(|i| (i % 3) as f64).collect()).unwrap();
        (x, y)
    }

    #[test]
    fn point_and_lasso_estimators_fill_the_table() {

        let (scores, y) = uniform_problem(42, false);
        let (counts, _) = uniform_problem(42, true);

        let mut classic = Method::Classic.estimator(None);
        classic.fit(&counts, &y).unwrap();
        let mut ks = Method::Ks.estimator(None);
        ks.fit(&scores, &y).unwrap();

        //Lasso is multi-task, so feed it one indicator column per cluster
        let indicators = nalgebra::DMatrix::from_fn(100, 3, |i, k| if i % 3 == k { 1.0 } else { 0.0 });
        let y_multi = LabelMatrix::new(names("region", 100), vec!["0".into(), "1".into(), "2".into()], indicators).unwrap();
        let mut lasso = Method::Lasso.estimator(Some(7));
        lasso.fit(&scores, &y_multi).unwrap();

        for act in [classic.activity(), ks.activity(), lasso.activity()] {
            let act = act.unwrap();
            assert_eq!(act.shape(), (5, 3));
            assert!(act.values().iter().all(|v| !v.is_nan()));
            assert!(act.all_finite());
        }

        let sig = lasso.significance().unwrap();
        assert_eq!(sig.motifs(), scores.motifs());
    }

    #[test]
    fn row_mismatch_is_a_shape_error_everywhere() {

        let (x, _) = uniform_problem(1, true);
        let y = LabelMatrix::from_column(names("region", 99), "cluster", (0..99).map(|i| (i % 3) as f64).collect()).unwrap();

        for method in Method::iter() {
            let mut moap = method.estimator(Some(3));
            let res = moap.fit(&x, &y);
            assert!(matches!(res, Err(MoapError::InputShape(_))), "{} accepted mismatched rows", method);
            assert!(moap.activity().is_none());
        }
    }
}
