use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::seq::SliceRandom;
use rand::distributions::{Distribution, Uniform};

use crate::data_struct::MoapError;

const LASSO_MAX_ITER: usize = 1000;
const LASSO_TOL: f64 = 1e-4;

fn column_means(m: &DMatrix<f64>) -> DVector<f64> {
    if m.nrows() == 0 {
        return DVector::zeros(m.ncols());
    }
    DVector::from_iterator(m.ncols(), m.column_iter().map(|c| c.sum()/(m.nrows() as f64)))
}

fn subtract_means(m: &DMatrix<f64>, means: &DVector<f64>) -> DMatrix<f64> {
    let mut centered = m.clone();
    for (j, mut col) in centered.column_iter_mut().enumerate() {
        col.add_scalar_mut(-means[j]);
    }
    centered
}

/// Ridge regression with an intercept: minimises ||y - Xw - b||^2 + alpha ||w||^2.
/// Returns w only; the intercept is absorbed by centering.
pub fn ridge(x: &DMatrix<f64>, y: &DVector<f64>, alpha: f64) -> Result<DVector<f64>, MoapError> {

    if x.nrows() != y.len() {
        return Err(MoapError::InputShape(format!("ridge: {} rows of X but {} targets", x.nrows(), y.len())));
    }

    let xc = subtract_means(x, &column_means(x));
    let y_mean = if y.len() > 0 { y.sum()/(y.len() as f64) } else { 0.0 };
    let yc = y.add_scalar(-y_mean);

    let mut gram = xc.transpose()*&xc;
    for i in 0..gram.nrows() {
        gram[(i, i)] += alpha;
    }
    let rhs = xc.transpose()*yc;

    match gram.clone().cholesky() {
        Some(chol) => Ok(chol.solve(&rhs)),
        //alpha = 0 with collinear motifs lands here
        None => gram.svd(true, true).solve(&rhs, 1e-12).map_err(|e| MoapError::Model(e.to_string())),
    }
}

/// Multi-task lasso,
///
/// 1/(2n) ||Y - XW - b||_F^2 + alpha * sum_j ||W_j||_2
///
/// fit by cyclic block coordinate descent over motifs. `coef` is stored as
/// features x tasks, which is already the orientation of an activity table.
#[derive(Clone, Debug)]
pub struct MultiTaskLasso {
    alpha: f64,
    max_iter: usize,
    tol: f64,
    coef: DMatrix<f64>,
    intercept: DVector<f64>,
}

impl MultiTaskLasso {

    pub fn new(alpha: f64) -> Self {
        MultiTaskLasso { alpha, max_iter: LASSO_MAX_ITER, tol: LASSO_TOL, coef: DMatrix::zeros(0, 0), intercept: DVector::zeros(0) }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn coef(&self) -> &DMatrix<f64> {
        &self.coef
    }

    pub fn fit(&mut self, x: &DMatrix<f64>, y: &DMatrix<f64>) -> &mut Self {

        let (n, p) = x.shape();
        let t = y.ncols();

        let x_means = column_means(x);
        let y_means = column_means(y);
        let xc = subtract_means(x, &x_means);
        let yc = subtract_means(y, &y_means);

        let mut w = DMatrix::<f64>::zeros(p, t);
        let mut resid = yc.clone();
        let norms: Vec<f64> = xc.column_iter().map(|c| c.norm_squared()).collect();
        let l1_reg = self.alpha*(n as f64);

        for _ in 0..self.max_iter {

            let mut max_change = 0.0_f64;
            let mut max_w = 0.0_f64;

            for j in 0..p {

                if norms[j] == 0.0 { continue; }

                let xj = xc.column(j);
                let w_old = w.row(j).transpose();

                //x_j^T R + ||x_j||^2 w_j is the unpenalised block optimum times ||x_j||^2
                let tmp = resid.transpose()*xj + &w_old*norms[j];
                let tmp_norm = tmp.norm();

                let shrink = if tmp_norm > 0.0 { (1.0 - l1_reg/tmp_norm).max(0.0) } else { 0.0 };
                let w_new = tmp*(shrink/norms[j]);

                let delta = &w_new - &w_old;
                if delta.iter().any(|&d| d != 0.0) {
                    resid -= xj*delta.transpose();
                }

                max_change = max_change.max(delta.amax());
                max_w = max_w.max(w_new.amax());
                w.set_row(j, &w_new.transpose());
            }

            if max_w == 0.0 || max_change/max_w < self.tol {
                break;
            }
        }

        self.intercept = &y_means - w.transpose()*&x_means;
        self.coef = w;
        self
    }

    pub fn predict(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        let mut pred = x*&self.coef;
        for (j, mut col) in pred.column_iter_mut().enumerate() {
            col.add_scalar_mut(self.intercept[j]);
        }
        pred
    }

    pub fn score(&self, x: &DMatrix<f64>, y: &DMatrix<f64>) -> f64 {
        r2_score(y, &self.predict(x))
    }
}

/// Coefficient of determination averaged uniformly over output columns.
pub fn r2_score(truth: &DMatrix<f64>, pred: &DMatrix<f64>) -> f64 {

    if truth.ncols() == 0 || truth.nrows() == 0 {
        return 0.0;
    }

    let means = column_means(truth);
    let total: f64 = (0..truth.ncols()).map(|j| {
        let ss_res: f64 = truth.column(j).iter().zip(pred.column(j).iter()).map(|(t, p)| (t-p).powi(2)).sum();
        let ss_tot: f64 = truth.column(j).iter().map(|t| (t-means[j]).powi(2)).sum();
        if ss_tot > 0.0 { 1.0 - ss_res/ss_tot } else if ss_res == 0.0 { 1.0 } else { 0.0 }
    }).sum();

    total/(truth.ncols() as f64)
}

/// Contiguous k-fold split of 0..n as (train, test). The first n % k folds get one extra index.
pub fn kfold(n: usize, k: usize) -> Vec<(Vec<usize>, Vec<usize>)> {

    let k = k.max(1).min(n.max(1));
    let mut folds = Vec::with_capacity(k);
    let mut start = 0_usize;

    for f in 0..k {
        let size = n/k + if f < n % k { 1 } else { 0 };
        let test: Vec<usize> = (start..(start+size)).collect();
        let train: Vec<usize> = (0..start).chain((start+size)..n).collect();
        folds.push((train, test));
        start += size;
    }
    folds
}

/// Shuffled train/test split; the test part gets ceil(test_fraction * n) indices.
pub fn train_test_split<R: Rng + ?Sized>(n: usize, test_fraction: f64, rng: &mut R) -> (Vec<usize>, Vec<usize>) {
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(rng);
    let n_test = ((n as f64)*test_fraction).ceil() as usize;
    let train = perm.split_off(n_test.min(n));
    (train, perm)
}

/// `size` draws from 0..n with replacement.
pub fn bootstrap_indices<R: Rng + ?Sized>(n: usize, size: usize, rng: &mut R) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let die = Uniform::from(0..n);
    (0..size).map(|_| die.sample(rng)).collect()
}

pub fn permutation<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(rng);
    perm
}

#[cfg(test)]
mod tester {

    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn design(rng: &mut StdRng, n: usize, p: usize) -> DMatrix<f64> {
        let die = Uniform::from(-1.0..1.0);
        DMatrix::from_fn(n, p, |_, _| die.sample(rng))
    }

    #[test]
    fn ridge_recovers_plain_regression() {

        let mut rng = StdRng::seed_from_u64(7);
        let x = design(&mut rng, 200, 3);
        let truth = DVector::from_vec(vec![2.0, -1.0, 0.5]);
        let y = (&x*&truth).add_scalar(3.0);

        let w = ridge(&x, &y, 1e-8).unwrap();
        assert!((&w - &truth).amax() < 1e-5, "{:?}", w);

        //Heavy shrinkage pulls everything toward zero
        let shrunk = ridge(&x, &y, 1e6).unwrap();
        assert!(shrunk.amax() < 0.1);

        assert!(ridge(&x, &DVector::zeros(3), 0.1).is_err());
    }

    #[test]
    fn lasso_selects_the_right_motifs() {

        let mut rng = StdRng::seed_from_u64(11);
        let x = design(&mut rng, 300, 6);
        let mut w = DMatrix::zeros(6, 2);
        w[(0, 0)] = 3.0;
        w[(0, 1)] = 1.5;
        w[(3, 0)] = -2.0;
        w[(3, 1)] = -2.0;
        let y = &x*&w;

        let mut model = MultiTaskLasso::new(0.01);
        model.fit(&x, &y);

        for j in [1, 2, 4, 5] {
            assert!(model.coef().row(j).amax() < 0.05, "motif {} kept: {:?}", j, model.coef().row(j));
        }
        assert!((model.coef()[(0, 0)] - 3.0).abs() < 0.1);
        assert!((model.coef()[(3, 1)] + 2.0).abs() < 0.1);
        assert!(model.score(&x, &y) > 0.99);

        //Large enough alpha zeroes everything and predicts the mean
        let mut empty = MultiTaskLasso::new(100.0);
        empty.fit(&x, &y);
        assert_eq!(empty.coef().amax(), 0.0);
        assert!(empty.score(&x, &y).abs() < 1e-12);
    }

    #[test]
    fn folds_cover_everything_once() {
        let folds = kfold(11, 3);
        assert_eq!(folds.len(), 3);
        assert_eq!(folds.iter().map(|(_, t)| t.len()).collect::<Vec<_>>(), vec![4, 4, 3]);
        let mut seen: Vec<usize> = folds.iter().flat_map(|(_, t)| t.clone()).collect();
        seen.sort();
        assert_eq!(seen, (0..11).collect::<Vec<_>>());
        for (train, test) in &folds {
            assert_eq!(train.len()+test.len(), 11);
        }
    }

    #[test]
    fn splits_and_draws() {
        let mut rng = StdRng::seed_from_u64(3);
        let (train, test) = train_test_split(10, 0.25, &mut rng);
        assert_eq!(test.len(), 3);
        assert_eq!(train.len(), 7);

        let draws = bootstrap_indices(5, 100, &mut rng);
        assert_eq!(draws.len(), 100);
        assert!(draws.iter().all(|&d| d < 5));
        assert!(bootstrap_indices(0, 10, &mut rng).is_empty());

        let mut perm = permutation(8, &mut rng);
        perm.sort();
        assert_eq!(perm, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn r2_edge_cases() {
        let t = DMatrix::from_row_slice(3, 1, &[1.0, 2.0, 3.0]);
        assert_eq!(r2_score(&t, &t), 1.0);
        let flat = DMatrix::from_element(3, 1, 2.0);
        assert_eq!(r2_score(&t, &flat), 0.0);
        assert_eq!(r2_score(&flat, &flat), 1.0);
    }
}
