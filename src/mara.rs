use log::info;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data_struct::{center_columns, center_rows, ActivityTable, LabelMatrix, MoapError, ScoreMatrix};
use crate::linear::ridge;
use crate::mcmc::{MaraModelBuilder, ModelBuilder};
use crate::{seeded_rng, Method, Moap};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaraConfig {
    pub iterations: usize,
    pub ridge_alpha: f64,
    pub thin: usize,
    pub burn_fraction: f64,
    pub seed: Option<u64>,
}

impl Default for MaraConfig {
    fn default() -> Self {
        MaraConfig { iterations: 10000, ridge_alpha: 0.1, thin: 10, burn_fraction: 0.1, seed: None }
    }
}

/// MARA style motif activities: every (centred) label column is regressed on
/// the motif scores with a Bayesian linear model, warm started by ridge
/// regression and sampled by MCMC.
///
/// Columns are fit one after the other.
pub struct MaraMoap {
    config: MaraConfig,
    builder: Box<dyn ModelBuilder>,
    ridge: Option<ActivityTable>,
    act: Option<ActivityTable>,
    trace_mean: Option<ActivityTable>,
    trace_std: Option<ActivityTable>,
    zscore: Option<ActivityTable>,
}

impl MaraMoap {

    pub fn new(config: MaraConfig) -> Self {
        MaraMoap {
            config,
            builder: Box::new(MaraModelBuilder),
            ridge: None,
            act: None,
            trace_mean: None,
            trace_std: None,
            zscore: None,
        }
    }

    /// Swaps the default hierarchical model for another one.
    pub fn with_builder(mut self, builder: Box<dyn ModelBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn config(&self) -> &MaraConfig {
        &self.config
    }

    /// Ridge warm start, each motif centred across columns.
    pub fn ridge(&self) -> Option<&ActivityTable> {
        self.ridge.as_ref()
    }

    pub fn trace_mean(&self) -> Option<&ActivityTable> {
        self.trace_mean.as_ref()
    }

    pub fn trace_std(&self) -> Option<&ActivityTable> {
        self.trace_std.as_ref()
    }

    pub fn zscore(&self) -> Option<&ActivityTable> {
        self.zscore.as_ref()
    }
}

impl Moap for MaraMoap {

    fn fit(&mut self, x: &ScoreMatrix, y: &LabelMatrix) -> Result<(), MoapError> {

        self.ridge = None;
        self.act = None;
        self.trace_mean = None;
        self.trace_std = None;
        self.zscore = None;

        let scores = y.aligned_scores(x)?;
        if y.n_columns() == 0 {
            return Err(MoapError::InputShape("y needs at least one column".to_string()));
        }

        let targets = center_rows(&center_columns(y.values()));
        let scores = center_rows(&scores);

        let (n_motifs, n_cols) = (scores.ncols(), targets.ncols());

        info!("ridge regression");
        let mut warm = DMatrix::<f64>::zeros(n_motifs, n_cols);
        for j in 0..n_cols {
            let coef = ridge(&scores, &targets.column(j).into_owned(), self.config.ridge_alpha)?;
            warm.set_column(j, &coef);
        }
        let warm = center_rows(&warm);

        let burn = ((self.config.iterations as f64)*self.config.burn_fraction) as usize;
        let mut rng = seeded_rng(self.config.seed);

        let mut act = DMatrix::<f64>::zeros(n_motifs, n_cols);
        let mut mean = DMatrix::<f64>::zeros(n_motifs, n_cols);
        let mut std = DMatrix::<f64>::zeros(n_motifs, n_cols);

        for (j, name) in y.columns().iter().enumerate() {

            info!("fitting {}", name);

            let start: DVector<f64> = warm.column(j).into_owned();
            let target: DVector<f64> = targets.column(j).into_owned();

            let mut model = self.builder.build(n_motifs, &start, &target, &scores)?;
            model.find_map()?;
            let trace = model.sample(self.config.iterations, burn, self.config.thin, &mut rng)?;

            let last = model.value("a").ok_or_else(|| MoapError::Model("model has no activity parameter 'a'".to_string()))?;
            let (m, s) = match (trace.mean("a"), trace.std("a")) {
                (Some(m), Some(s)) => (m, s),
                _ => return Err(MoapError::Model(format!("no activity draws were kept for {}", name))),
            };

            act.set_column(j, &last);
            mean.set_column(j, &m);
            std.set_column(j, &s);
        }

        let zscore = mean.zip_map(&std, |m, s| if s > 0.0 { m/s } else { 0.0 });

        let motifs = x.motifs().to_vec();
        let columns = y.columns().to_vec();

        self.ridge = Some(ActivityTable::new(motifs.clone(), columns.clone(), warm)?);
        self.act = Some(ActivityTable::new(motifs.clone(), columns.clone(), act)?);
        self.trace_mean = Some(ActivityTable::new(motifs.clone(), columns.clone(), mean)?);
        self.trace_std = Some(ActivityTable::new(motifs.clone(), columns.clone(), std)?);
        self.zscore = Some(ActivityTable::new(motifs, columns, zscore)?);
        Ok(())
    }

    fn activity(&self) -> Option<&ActivityTable> {
        self.act.as_ref()
    }

    fn method(&self) -> Method {
        Method::Mara
    }
}
