use nalgebra::{DMatrix, DVector};

const CD_MAX_ITER: usize = 20;
const CD_TOL: f64 = 1e-3;

/// Linear classifier with a squared hinge loss and an l1/l2 (group lasso)
/// penalty, fit by block coordinate descent over features:
///
/// C * sum_i sum_k max(0, 1 - y_ik w_k.x_i)^2 + alpha * sum_j ||w_.j||_2
///
/// Every output k is a one-vs-rest problem (y_ik = +1 for class k, -1 otherwise).
/// The group penalty ties the outputs together, so a motif is either used for
/// all classes or for none. Two classes without `multiclass` collapse to a
/// single output that separates class 1 from class 0. There is no intercept.
#[derive(Clone, Debug)]
pub struct CdClassifier {
    alpha: f64,
    c: f64,
    multiclass: bool,
    max_iter: usize,
    tol: f64,
    n_classes: usize,
    coef: DMatrix<f64>,
}

impl CdClassifier {

    pub fn new(alpha: f64, c: f64, multiclass: bool) -> Self {
        CdClassifier { alpha, c, multiclass, max_iter: CD_MAX_ITER, tol: CD_TOL, n_classes: 0, coef: DMatrix::zeros(0, 0) }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn c(&self) -> f64 {
        self.c
    }

    /// Outputs x features. One row for a binary problem, one row per class otherwise.
    pub fn coef(&self) -> &DMatrix<f64> {
        &self.coef
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn binary(&self) -> bool {
        !self.multiclass && self.n_classes == 2
    }

    /// `y` holds class codes in 0..n_classes. Classes absent from `y` still get a (zero) row.
    pub fn fit(&mut self, x: &DMatrix<f64>, y: &[usize], n_classes: usize) -> &mut Self {

        let (n, p) = x.shape();
        self.n_classes = n_classes;
        let outputs = if self.binary() { 1 } else { n_classes };

        let signs = DMatrix::from_fn(n, outputs, |i, k| {
            let target = if outputs == 1 { 1 } else { k };
            if y[i] == target { 1.0 } else { -1.0 }
        });

        let mut w = DMatrix::<f64>::zeros(outputs, p);
        let mut margins = DMatrix::<f64>::zeros(n, outputs);
        let sq_norms: Vec<f64> = x.column_iter().map(|c| c.norm_squared()).collect();

        for _ in 0..self.max_iter {

            let mut max_change = 0.0_f64;
            let mut max_w = 0.0_f64;

            for j in 0..p {

                if sq_norms[j] == 0.0 { continue; }

                let xj = x.column(j);

                //The squared hinge has second derivative <= 2, so this bounds the block curvature
                let h = 2.0*self.c*sq_norms[j];

                let grad = DVector::from_fn(outputs, |k, _| {
                    -2.0*self.c*(0..n).map(|i| {
                        let slack = (1.0 - signs[(i, k)]*margins[(i, k)]).max(0.0);
                        signs[(i, k)]*xj[i]*slack
                    }).sum::<f64>()
                });

                let w_old = w.column(j).into_owned();
                let step = &w_old - grad/h;
                let step_norm = step.norm();

                let shrink = if step_norm > 0.0 { (1.0 - self.alpha/(h*step_norm)).max(0.0) } else { 0.0 };
                let w_new = step*shrink;
                let delta = &w_new - &w_old;

                if delta.iter().any(|&d| d != 0.0) {
                    for k in 0..outputs {
                        if delta[k] != 0.0 {
                            let mut col = margins.column_mut(k);
                            col.axpy(delta[k], &xj, 1.0);
                        }
                    }
                }

                max_change = max_change.max(delta.amax());
                max_w = max_w.max(w_new.amax());
                w.set_column(j, &w_new);
            }

            if max_w == 0.0 || max_change/max_w < self.tol {
                break;
            }
        }

        self.coef = w;
        self
    }

    /// Samples x outputs.
    pub fn decision_function(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        x*self.coef.transpose()
    }

    pub fn predict(&self, x: &DMatrix<f64>) -> Vec<usize> {

        let decision = self.decision_function(x);

        if decision.ncols() == 1 && self.n_classes == 2 {
            return decision.column(0).iter().map(|&d| if d > 0.0 { 1 } else { 0 }).collect();
        }

        decision.row_iter().map(|row| {
            let mut best = 0_usize;
            for k in 1..row.len() {
                if row[k] > row[best] { best = k; }
            }
            best
        }).collect()
    }

    /// Accuracy. An empty test set scores 0.
    pub fn score(&self, x: &DMatrix<f64>, y: &[usize]) -> f64 {
        if y.is_empty() {
            return 0.0;
        }
        let hits = self.predict(x).iter().zip(y).filter(|(p, t)| p == t).count();
        (hits as f64)/(y.len() as f64)
    }

    /// Number of motifs with a nonzero coefficient for any output, or that
    /// number as a fraction of all motifs.
    pub fn n_nonzero(&self, percentage: bool) -> f64 {
        let used = self.coef.column_iter().filter(|c| c.iter().any(|&v| v != 0.0)).count() as f64;
        if !percentage {
            return used;
        }
        if self.coef.ncols() == 0 { 0.0 } else { used/(self.coef.ncols() as f64) }
    }
}
