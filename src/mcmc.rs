use std::collections::HashMap;

use argmin::core::{CostFunction, Error as ArgminError, Executor, State};
use argmin::solver::neldermead::NelderMead;
use log::warn;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Gamma, StandardNormal};

use crate::data_struct::MoapError;

const PRIOR_SHAPE: f64 = 1.0;
const PRIOR_RATE: f64 = 1.0;

const MODE_MAX_ITERS: u64 = 200;
const MODE_SD_TOLERANCE: f64 = 1e-8;

/// Thinned draws of every named model parameter, in sampling order.
#[derive(Clone, Debug, Default)]
pub struct Trace {
    chains: HashMap<String, Vec<DVector<f64>>>,
}

impl Trace {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, draw: DVector<f64>) {
        self.chains.entry(name.to_string()).or_default().push(draw);
    }

    pub fn get(&self, name: &str) -> Option<&[DVector<f64>]> {
        self.chains.get(name).map(|c| c.as_slice())
    }

    pub fn n_draws(&self, name: &str) -> usize {
        self.chains.get(name).map_or(0, |c| c.len())
    }

    pub fn mean(&self, name: &str) -> Option<DVector<f64>> {
        let chain = self.chains.get(name).filter(|c| !c.is_empty())?;
        let mut sum = DVector::<f64>::zeros(chain[0].len());
        for draw in chain {
            sum += draw;
        }
        Some(sum/(chain.len() as f64))
    }

    /// Population standard deviation of every dimension.
    pub fn std(&self, name: &str) -> Option<DVector<f64>> {
        let mean = self.mean(name)?;
        let chain = &self.chains[name];
        let mut ss = DVector::<f64>::zeros(mean.len());
        for draw in chain {
            ss += (draw - &mean).map(|d| d*d);
        }
        Some((ss/(chain.len() as f64)).map(f64::sqrt))
    }
}

/// A Bayesian model that can be moved to its posterior mode and sampled from.
pub trait BayesModel {

    fn find_map(&mut self) -> Result<(), MoapError>;

    /// Runs `iterations` steps, keeping step i if i >= burn and (i - burn) is a multiple of thin.
    fn sample(&mut self, iterations: usize, burn: usize, thin: usize, rng: &mut StdRng) -> Result<Trace, MoapError>;

    /// Current value of a named parameter.
    fn value(&self, name: &str) -> Option<DVector<f64>>;
}

/// Builds the Bayesian model for one target column.
pub trait ModelBuilder: Send + Sync {
    fn build(&self, n_motifs: usize, warm_start: &DVector<f64>, y: &DVector<f64>, x: &DMatrix<f64>) -> Result<Box<dyn BayesModel>, MoapError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MaraModelBuilder;

impl ModelBuilder for MaraModelBuilder {
    fn build(&self, n_motifs: usize, warm_start: &DVector<f64>, y: &DVector<f64>, x: &DMatrix<f64>) -> Result<Box<dyn BayesModel>, MoapError> {
        Ok(Box::new(MaraModel::new(n_motifs, warm_start, y, x)?))
    }
}

/// Hierarchical linear model of region values on motif scores:
///
/// y ~ N(X a, sigma2 I), a_j ~ N(0, 1/tau), tau ~ Gamma(1, 1), sigma2 ~ InvGamma(1, 1)
///
/// Every conditional is conjugate, so sampling is plain Gibbs.
#[derive(Clone, Debug)]
pub struct MaraModel {
    xtx: DMatrix<f64>,
    xty: DVector<f64>,
    x: DMatrix<f64>,
    y: DVector<f64>,
    a: DVector<f64>,
    tau: f64,
    sigma2: f64,
}

impl MaraModel {

    pub fn new(n_motifs: usize, warm_start: &DVector<f64>, y: &DVector<f64>, x: &DMatrix<f64>) -> Result<Self, MoapError> {

        if x.ncols() != n_motifs || warm_start.len() != n_motifs {
            return Err(MoapError::InputShape(format!("model wants {} motifs, got {} scores and {} starting values",
                                                     n_motifs, x.ncols(), warm_start.len())));
        }
        if y.len() != x.nrows() {
            return Err(MoapError::InputShape(format!("{} targets for {} regions", y.len(), x.nrows())));
        }

        let n = y.len().max(1) as f64;
        let spread = warm_start.norm_squared()/(n_motifs.max(1) as f64);
        let resid = y - x*warm_start;

        Ok(MaraModel {
            xtx: x.transpose()*x,
            xty: x.transpose()*y,
            x: x.clone(),
            y: y.clone(),
            a: warm_start.clone(),
            tau: if spread > 0.0 { 1.0/spread } else { 1.0 },
            sigma2: (resid.norm_squared()/n).max(f64::EPSILON),
        })
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }

    fn precision(&self, tau: f64, sigma2: f64) -> Option<Cholesky<f64, Dyn>> {
        let mut p = &self.xtx/sigma2;
        for j in 0..p.nrows() {
            p[(j, j)] += tau;
        }
        Cholesky::new(p)
    }

    fn rss(&self, a: &DVector<f64>) -> f64 {
        (&self.y - &self.x*a).norm_squared()
    }

    /// Negative log joint density at (a, tau, sigma2), up to a constant.
    fn neg_log_joint(&self, a: &DVector<f64>, tau: f64, sigma2: f64) -> f64 {
        let (n, p) = (self.y.len() as f64, a.len() as f64);
        0.5*n*sigma2.ln() + self.rss(a)/(2.0*sigma2)
            - 0.5*p*tau.ln() + 0.5*tau*a.norm_squared()
            - (PRIOR_SHAPE-1.0)*tau.ln() + PRIOR_RATE*tau
            + (PRIOR_SHAPE+1.0)*sigma2.ln() + PRIOR_RATE/sigma2
    }

    /// Mode of a given tau and sigma2.
    fn conditional_mode(&self, tau: f64, sigma2: f64) -> Option<DVector<f64>> {
        self.precision(tau, sigma2).map(|chol| chol.solve(&(&self.xty/sigma2)))
    }
}

struct ProfiledPosterior<'a> {
    model: &'a MaraModel,
}

impl<'a> CostFunction for ProfiledPosterior<'a> {

    type Param = Vec<f64>;
    type Output = f64;

    //p = [ln tau, ln sigma2]
    fn cost(&self, p: &Self::Param) -> Result<Self::Output, ArgminError> {
        let (tau, sigma2) = (p[0].exp(), p[1].exp());
        if !tau.is_finite() || !sigma2.is_finite() || tau <= 0.0 || sigma2 <= 0.0 {
            return Ok(f64::INFINITY);
        }
        Ok(match self.model.conditional_mode(tau, sigma2) {
            Some(a) => self.model.neg_log_joint(&a, tau, sigma2),
            None => f64::INFINITY,
        })
    }
}

impl BayesModel for MaraModel {

    fn find_map(&mut self) -> Result<(), MoapError> {

        let (lt, ls) = (self.tau.ln(), self.sigma2.ln());
        let simplex = vec![vec![lt, ls], vec![lt+1.0, ls], vec![lt, ls+1.0]];

        let solver = NelderMead::new(simplex).with_sd_tolerance(MODE_SD_TOLERANCE)
                                             .map_err(|e| MoapError::Model(e.to_string()))?;

        let res = Executor::new(ProfiledPosterior { model: &*self }, solver)
                    .configure(|state| state.max_iters(MODE_MAX_ITERS))
                    .run();

        let best = match res {
            Ok(r) => r.state().get_best_param().cloned(),
            Err(e) => {
                warn!("posterior mode search failed, sampling from the warm start: {}", e);
                None
            },
        };

        if let Some(p) = best {
            let (tau, sigma2) = (p[0].exp(), p[1].exp());
            if let Some(a) = self.conditional_mode(tau, sigma2) {
                self.a = a;
                self.tau = tau;
                self.sigma2 = sigma2;
            }
        }
        Ok(())
    }

    fn sample(&mut self, iterations: usize, burn: usize, thin: usize, rng: &mut StdRng) -> Result<Trace, MoapError> {

        let thin = thin.max(1);
        let (n, p) = (self.y.len() as f64, self.a.len());
        let mut trace = Trace::new();

        let gamma = |shape: f64, rate: f64| Gamma::new(shape, 1.0/rate).map_err(|e| MoapError::Model(e.to_string()));

        for i in 0..iterations {

            let chol = self.precision(self.tau, self.sigma2)
                           .ok_or_else(|| MoapError::Model("activity precision is not positive definite".to_string()))?;
            let mean = chol.solve(&(&self.xty/self.sigma2));
            let z = DVector::<f64>::from_fn(p, |_, _| StandardNormal.sample(rng));
            let noise = chol.l().tr_solve_lower_triangular(&z)
                            .ok_or_else(|| MoapError::Model("singular Cholesky factor".to_string()))?;
            self.a = mean + noise;

            self.tau = gamma(PRIOR_SHAPE + 0.5*(p as f64), PRIOR_RATE + 0.5*self.a.norm_squared())?.sample(rng);
            self.sigma2 = 1.0/gamma(PRIOR_SHAPE + 0.5*n, PRIOR_RATE + 0.5*self.rss(&self.a))?.sample(rng);

            if i >= burn && (i-burn) % thin == 0 {
                trace.push("a", self.a.clone());
                trace.push("tau", DVector::from_element(1, self.tau));
                trace.push("sigma2", DVector::from_element(1, self.sigma2));
            }
        }

        Ok(trace)
    }

    fn value(&self, name: &str) -> Option<DVector<f64>> {
        match name {
            "a" => Some(self.a.clone()),
            "tau" => Some(DVector::from_element(1, self.tau)),
            "sigma2" => Some(DVector::from_element(1, self.sigma2)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tester {

    use super::*;
    use rand::SeedableRng;
    use rand::distributions::Uniform;

    fn regression(seed: u64, n: usize, truth: &[f64], noise: f64) -> (DMatrix<f64>, DVector<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let die = Uniform::from(-1.0..1.0);
        let x = DMatrix::from_fn(n, truth.len(), |_, _| die.sample(&mut rng));
        let eps = DVector::from_fn(n, |_, _| noise*die.sample(&mut rng));
        let y = &x*DVector::from_column_slice(truth) + eps;
        (x, y)
    }

    #[test]
    fn trace_statistics() {
        let mut trace = Trace::new();
        trace.push("a", DVector::from_vec(vec![1.0, 0.0]));
        trace.push("a", DVector::from_vec(vec![3.0, 0.0]));
        assert_eq!(trace.n_draws("a"), 2);
        assert_eq!(trace.mean("a").unwrap(), DVector::from_vec(vec![2.0, 0.0]));
        assert_eq!(trace.std("a").unwrap(), DVector::from_vec(vec![1.0, 0.0]));
        assert!(trace.mean("tau").is_none());
        assert_eq!(trace.n_draws("tau"), 0);
    }

    #[test]
    fn posterior_recovers_coefficients() {

        let truth = [2.0, -1.0, 0.0];
        let (x, y) = regression(11, 200, &truth, 0.1);

        let mut model = MaraModelBuilder.build(3, &DVector::zeros(3), &y, &x).unwrap();
        model.find_map().unwrap();

        let mode = model.value("a").unwrap();
        for j in 0..3 {
            assert!((mode[j]-truth[j]).abs() < 0.1, "mode {} is {}", j, mode[j]);
        }

        let mut rng = StdRng::seed_from_u64(3);
        let trace = model.sample(1000, 100, 10, &mut rng).unwrap();

        //steps 100, 110, ..., 990
        assert_eq!(trace.n_draws("a"), 90);
        assert_eq!(trace.n_draws("sigma2"), 90);

        let mean = trace.mean("a").unwrap();
        let std = trace.std("a").unwrap();
        for j in 0..3 {
            assert!((mean[j]-truth[j]).abs() < 0.1);
            assert!(std[j] > 0.0 && std[j] < 0.1);
        }
        assert!(model.value("sigma2").unwrap()[0] < 0.1);
        assert!(model.value("rho").is_none());
    }

    #[test]
    fn sampling_is_seeded() {
        let (x, y) = regression(2, 50, &[1.0, 1.0], 0.5);
        let draw = |seed: u64| {
            let mut model = MaraModel::new(2, &DVector::from_element(2, 0.5), &y, &x).unwrap();
            model.find_map().unwrap();
            model.sample(100, 10, 10, &mut StdRng::seed_from_u64(seed)).unwrap().mean("a").unwrap()
        };
        assert_eq!(draw(4), draw(4));
        assert_ne!(draw(4), draw(5));
    }

    #[test]
    fn builder_checks_shapes() {
        let (x, y) = regression(1, 10, &[1.0, 1.0], 0.5);
        assert!(matches!(MaraModelBuilder.build(3, &DVector::zeros(2), &y, &x), Err(MoapError::InputShape(_))));
        assert!(matches!(MaraModel::new(2, &DVector::zeros(2), &DVector::zeros(9), &x), Err(MoapError::InputShape(_))));
    }
}
