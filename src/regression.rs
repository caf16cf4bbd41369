use log::info;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::classifier::CdClassifier;
use crate::data_struct::{scale_columns, ActivityTable, LabelMatrix, MoapError, ScoreMatrix, Significance};
use crate::linear::{bootstrap_indices, kfold, permutation, train_test_split, MultiTaskLasso};
use crate::stats::{argmax_first, quantile};
use crate::{alpha_grid, seeded_rng, thread_pool, Method, Moap};
use crate::{ALPHA_GRID, BAGGING_FRACTION, BAGGING_ROUNDS, DEFAULT_ALPHA_STEP, DEFAULT_THREADS, NULL_PERMUTATIONS};

const TEST_FRACTION: f64 = 0.25;
const NULL_LOW: f64 = 0.01;
const NULL_HIGH: f64 = 0.99;

const C_GRID: [f64; 5] = [0.001, 0.01, 0.1, 0.5, 1.0];

fn rows(m: &DMatrix<f64>, idx: &[usize]) -> DMatrix<f64> {
    m.select_rows(idx.iter())
}

fn draw_bags(n: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let size = ((n as f64)*BAGGING_FRACTION).round() as usize;
    (0..BAGGING_ROUNDS).map(|_| bootstrap_indices(n, size, rng)).collect()
}

/// Fits one model per bag on the pool and averages the coefficient matrices.
/// Bags are drawn before dispatch, so the result does not depend on scheduling.
fn bagged_mean<F>(pool: &rayon::ThreadPool, bags: &[Vec<usize>], fit: F) -> DMatrix<f64>
where F: Fn(&[usize]) -> DMatrix<f64> + Sync {

    let fits: Vec<DMatrix<f64>> = pool.install(|| bags.par_iter().map(|bag| fit(bag.as_slice())).collect());

    let mut mean = fits[0].clone();
    for f in &fits[1..] {
        mean += f;
    }
    mean/(fits.len() as f64)
}

/// 1st and 99th percentile of each column, pooled over every permuted fit.
fn permutation_cutoffs(null_fits: &[DMatrix<f64>]) -> Vec<(f64, f64)> {

    let n_cols = null_fits.first().map_or(0, |m| m.ncols());

    (0..n_cols).map(|j| {
        let pooled: Vec<f64> = null_fits.iter().flat_map(|m| m.column(j).iter().copied().collect::<Vec<_>>()).collect();
        (quantile(&pooled, NULL_LOW), quantile(&pooled, NULL_HIGH))
    }).collect()
}

/// A motif is significant if any of its coefficients leaves the null interval.
fn flag_significant(act: &DMatrix<f64>, cutoffs: &[(f64, f64)]) -> Vec<bool> {
    act.row_iter().map(|row| {
        //strict: with an all-zero null, a zero coefficient is not significant
        row.iter().zip(cutoffs).any(|(&v, &(low, high))| v > high || v < low)
    }).collect()
}

/// Motif activities from a multi-task lasso regression of every label column on the motif scores.
///
/// The regularisation strength is chosen by k-fold cross validation on a
/// training split, coefficients are averaged over bootstrap fits, and the
/// significance flags compare them against fits on permuted labels.
pub struct LassoMoap {
    scale: bool,
    kfolds: usize,
    alpha_stepsize: f64,
    n_threads: usize,
    seed: Option<u64>,
    best_alpha: Option<f64>,
    act: Option<ActivityTable>,
    sig: Option<Significance>,
}

impl Default for LassoMoap {
    fn default() -> Self {
        LassoMoap {
            scale: true,
            kfolds: 5,
            alpha_stepsize: DEFAULT_ALPHA_STEP,
            n_threads: DEFAULT_THREADS,
            seed: None,
            best_alpha: None,
            act: None,
            sig: None,
        }
    }
}

impl LassoMoap {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_scale(mut self, scale: bool) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_kfolds(mut self, kfolds: usize) -> Self {
        self.kfolds = kfolds;
        self
    }

    pub fn with_alpha_stepsize(mut self, step: f64) -> Self {
        self.alpha_stepsize = step;
        self
    }

    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn best_alpha(&self) -> Option<f64> {
        self.best_alpha
    }

    fn select_alpha(&self, pool: &rayon::ThreadPool, x: &DMatrix<f64>, y: &DMatrix<f64>) -> f64 {

        let grid = alpha_grid(self.alpha_stepsize);
        let folds = kfold(x.nrows(), self.kfolds);

        let scores: Vec<f64> = pool.install(|| grid.par_iter().map(|&alpha| {
            folds.iter().map(|(train, test)| {
                let mut model = MultiTaskLasso::new(alpha);
                model.fit(&rows(x, train), &rows(y, train));
                model.score(&rows(x, test), &rows(y, test))
            }).sum::<f64>()/(folds.len() as f64)
        }).collect());

        grid[argmax_first(&scores).unwrap_or(0)]
    }

    fn bagged_coefs(&self, pool: &rayon::ThreadPool, x: &DMatrix<f64>, y: &DMatrix<f64>, alpha: f64, rng: &mut StdRng) -> DMatrix<f64> {
        let bags = draw_bags(x.nrows(), rng);
        bagged_mean(pool, &bags, |bag| {
            let mut model = MultiTaskLasso::new(alpha);
            model.fit(&rows(x, bag), &rows(y, bag));
            model.coef().clone()
        })
    }
}

impl Moap for LassoMoap {

    fn fit(&mut self, x: &ScoreMatrix, y: &LabelMatrix) -> Result<(), MoapError> {

        self.best_alpha = None;
        self.act = None;
        self.sig = None;

        let scores = y.aligned_scores(x)?;
        if y.n_columns() == 0 {
            return Err(MoapError::InputShape("y needs at least one column".to_string()));
        }

        let scores = if self.scale { scale_columns(&scores) } else { scores };
        let targets = y.values().clone();
        let n = scores.nrows();

        let mut rng = seeded_rng(self.seed);
        let pool = thread_pool(self.n_threads)?;

        let (train, test) = train_test_split(n, TEST_FRACTION, &mut rng);
        let (x_train, y_train) = (rows(&scores, &train), rows(&targets, &train));

        info!("set alpha through cross-validation");
        let alpha = self.select_alpha(&pool, &x_train, &y_train);

        let mut best = MultiTaskLasso::new(alpha);
        best.fit(&x_train, &y_train);
        info!("alpha {}: average score ({} fold CV): {}", alpha, self.kfolds, best.score(&rows(&scores, &test), &rows(&targets, &test)));

        info!("estimate coefficients using bootstrapping");
        let coefs = self.bagged_coefs(&pool, &scores, &targets, alpha, &mut rng);

        info!("permutations");
        let null_fits: Vec<DMatrix<f64>> = (0..NULL_PERMUTATIONS).map(|_| {
            let perm = permutation(n, &mut rng);
            self.bagged_coefs(&pool, &scores, &rows(&targets, &perm), alpha, &mut rng)
        }).collect();

        let flags = flag_significant(&coefs, &permutation_cutoffs(&null_fits));

        self.best_alpha = Some(alpha);
        self.act = Some(ActivityTable::new(x.motifs().to_vec(), y.columns().to_vec(), coefs)?);
        self.sig = Some(Significance::new(x.motifs().to_vec(), flags)?);
        Ok(())
    }

    fn activity(&self) -> Option<&ActivityTable> {
        self.act.as_ref()
    }

    fn significance(&self) -> Option<&Significance> {
        self.sig.as_ref()
    }

    fn method(&self) -> Method {
        Method::Lasso
    }
}

/// Motif activities from an l1/l2 penalised squared hinge classifier of the
/// (single, categorical) label column on the motif scores.
///
/// Alpha and C are chosen by grid search with k-fold cross validation. Columns
/// of the activity table are the class names in sorted order.
pub struct LightningMoap {
    scale: bool,
    kfolds: usize,
    n_threads: usize,
    seed: Option<u64>,
    best: Option<(f64, f64)>,
    act: Option<ActivityTable>,
    sig: Option<Significance>,
}

impl Default for LightningMoap {
    fn default() -> Self {
        LightningMoap {
            scale: true,
            kfolds: 10,
            n_threads: DEFAULT_THREADS,
            seed: None,
            best: None,
            act: None,
            sig: None,
        }
    }
}

impl LightningMoap {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_scale(mut self, scale: bool) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_kfolds(mut self, kfolds: usize) -> Self {
        self.kfolds = kfolds;
        self
    }

    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    /// (alpha, C) chosen by the last fit.
    pub fn best_parameters(&self) -> Option<(f64, f64)> {
        self.best
    }

    fn select_parameters(&self, pool: &rayon::ThreadPool, x: &DMatrix<f64>, y: &[usize], n_classes: usize) -> (f64, f64) {

        let folds = kfold(x.nrows(), self.kfolds);
        let grid: Vec<(f64, f64)> = C_GRID.iter().flat_map(|&c| ALPHA_GRID.iter().map(move |&alpha| (alpha, c))).collect();

        let scores: Vec<f64> = pool.install(|| grid.par_iter().map(|&(alpha, c)| {
            folds.iter().map(|(train, test)| {
                let y_train: Vec<usize> = train.iter().map(|&i| y[i]).collect();
                let y_test: Vec<usize> = test.iter().map(|&i| y[i]).collect();
                let mut clf = CdClassifier::new(alpha, c, true);
                clf.fit(&rows(x, train), &y_train, n_classes);
                clf.score(&rows(x, test), &y_test)
            }).sum::<f64>()/(folds.len() as f64)
        }).collect());

        grid[argmax_first(&scores).unwrap_or(0)]
    }

    fn bagged_coefs(&self, pool: &rayon::ThreadPool, x: &DMatrix<f64>, y: &[usize], n_classes: usize, (alpha, c): (f64, f64), rng: &mut StdRng) -> DMatrix<f64> {

        let bags = draw_bags(x.nrows(), rng);

        bagged_mean(pool, &bags, |bag| {
            let y_bag: Vec<usize> = bag.iter().map(|&i| y[i]).collect();
            let mut clf = CdClassifier::new(alpha, c, true);
            clf.fit(&rows(x, bag), &y_bag, n_classes);
            clf.coef().transpose()
        })
    }
}

impl Moap for LightningMoap {

    fn fit(&mut self, x: &ScoreMatrix, y: &LabelMatrix) -> Result<(), MoapError> {

        self.best = None;
        self.act = None;
        self.sig = None;

        let scores = y.aligned_scores(x)?;
        let classes = y.classes_sorted()?;
        let n_classes = classes.len();

        let scores = if self.scale { scale_columns(&scores) } else { scores };
        let codes = classes.codes.clone();
        let n = scores.nrows();

        let mut rng = seeded_rng(self.seed);
        let pool = thread_pool(self.n_threads)?;

        let (train, test) = train_test_split(n, TEST_FRACTION, &mut rng);
        let y_train: Vec<usize> = train.iter().map(|&i| codes[i]).collect();
        let y_test: Vec<usize> = test.iter().map(|&i| codes[i]).collect();
        let x_train = rows(&scores, &train);

        info!("setting parameters through cross-validation");
        let (alpha, c) = self.select_parameters(&pool, &x_train, &y_train, n_classes);
        self.best = Some((alpha, c));

        let mut clf = CdClassifier::new(alpha, c, true);
        clf.fit(&x_train, &y_train, n_classes);
        info!("alpha {} C {}: average score ({} fold CV): {}", alpha, c, self.kfolds, clf.score(&rows(&scores, &test), &y_test));

        info!("estimate coefficients using bootstrapping");
        let coefs = self.bagged_coefs(&pool, &scores, &codes, n_classes, (alpha, c), &mut rng);

        info!("permutations");
        let null_fits: Vec<DMatrix<f64>> = (0..NULL_PERMUTATIONS).map(|_| {
            let perm = permutation(n, &mut rng);
            let shuffled: Vec<usize> = perm.iter().map(|&i| codes[i]).collect();
            self.bagged_coefs(&pool, &scores, &shuffled, n_classes, (alpha, c), &mut rng)
        }).collect();

        let flags = flag_significant(&coefs, &permutation_cutoffs(&null_fits));

        self.act = Some(ActivityTable::new(x.motifs().to_vec(), classes.names, coefs)?);
        self.sig = Some(Significance::new(x.motifs().to_vec(), flags)?);
        Ok(())
    }

    fn activity(&self) -> Option<&ActivityTable> {
        self.act.as_ref()
    }

    fn significance(&self) -> Option<&Significance> {
        self.sig.as_ref()
    }

    fn method(&self) -> Method {
        Method::Lightning
    }
}
