use itertools::Itertools;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::classifier::CdClassifier;
use crate::cluster::{pairwise_distances, Dendrogram};
use crate::data_struct::{scale_columns, ActivityTable, LabelMatrix, MoapError, ScoreMatrix};
use crate::linear::bootstrap_indices;
use crate::stats::{argmax_first, mean, median};
use crate::{seeded_rng, thread_pool, Method, Moap, ALPHA_GRID, DEFAULT_THREADS};

const FIRST_LEVEL: usize = 3;
const EVAL_OVERSAMPLE: f64 = 1.25;
const EVAL_TRAIN_FRACTION: f64 = 0.8;
const MIN_BOOTSTRAP_FRACTION: f64 = 0.5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoreConfig {
    pub threshold: f64,
    pub margin: f64,
    pub nsample: usize,
    pub nbootstrap: usize,
    pub eval_repeats: usize,
    pub n_threads: usize,
    pub seed: Option<u64>,
}

impl Default for MoreConfig {
    fn default() -> Self {
        MoreConfig {
            threshold: 0.5,
            margin: 0.5,
            nsample: 1000,
            nbootstrap: 10,
            eval_repeats: 10,
            n_threads: DEFAULT_THREADS,
            seed: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelOutcome {
    /// Every set got an averaged coefficient vector.
    Fitted,
    /// No region passed set selection; the next level was tried.
    NoRegions,
    /// The cut gave fewer groups than asked for. Ends the ensemble.
    TooSimilar,
    /// Too many bootstrap draws missed a set. Ends the ensemble.
    InsufficientBootstrap,
}

/// What happened at one cut of the cluster tree.
#[derive(Clone, Debug, PartialEq)]
pub struct LevelReport {
    pub n_clusters: usize,
    pub sets: Vec<Vec<String>>,
    pub alpha: Option<f64>,
    pub outcome: LevelOutcome,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlphaScore {
    pub alpha: f64,
    pub accuracy: f64,
    pub fraction: f64,
}

/// Regions that passed set selection, as rows of the score matrix, with their set index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Qualified {
    pub rows: Vec<usize>,
    pub labels: Vec<usize>,
}

impl Qualified {

    pub fn from_membership(membership: &[Option<usize>]) -> Self {
        let (rows, labels) = membership.iter().enumerate().filter_map(|(r, m)| m.map(|s| (r, s))).unzip();
        Qualified { rows, labels }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Scores and labels of the chosen qualified regions.
    fn draw(&self, x: &DMatrix<f64>, picks: &[usize]) -> (DMatrix<f64>, Vec<usize>) {
        let rows: Vec<usize> = picks.iter().map(|&p| self.rows[p]).collect();
        (x.select_rows(rows.iter()), picks.iter().map(|&p| self.labels[p]).collect())
    }
}

/// Assigns every region to at most one set of label columns.
///
/// A region belongs to a set if its highest value inside the set is at least
/// `threshold` and exceeds its highest value outside the set by less than
/// `margin`. A gap of exactly `margin` does not count. When a region qualifies
/// for several sets the last one wins.
pub fn select_sets(y: &DMatrix<f64>, sets: &[Vec<usize>], threshold: f64, margin: f64) -> Vec<Option<usize>> {

    y.row_iter().map(|row| {
        let mut chosen = None;
        for (s, set) in sets.iter().enumerate() {
            let inside = set.iter().map(|&c| row[c]).fold(f64::NEG_INFINITY, f64::max);
            let outside = (0..row.len()).filter(|c| !set.contains(c)).map(|c| row[c]).fold(f64::NEG_INFINITY, f64::max);
            if inside >= threshold && inside - outside < margin {
                chosen = Some(s);
            }
        }
        chosen
    }).collect()
}

/// Trains the l1/l2 classifier used throughout the ensemble.
pub fn fit_model(x: &DMatrix<f64>, y: &[usize], n_sets: usize, alpha: f64, c: f64) -> CdClassifier {
    let mut clf = CdClassifier::new(alpha, c, n_sets > 2);
    clf.fit(x, y, n_sets);
    clf
}

/// Accuracy and sparsity of one alpha over `repeats` random train/test draws
/// from the qualified regions. Reports medians.
pub fn eval_model(x: &DMatrix<f64>, qualified: &Qualified, n_sets: usize, alpha: f64, nsample: usize, repeats: usize, rng: &mut StdRng) -> AlphaScore {

    let draws = ((nsample as f64)*EVAL_OVERSAMPLE).floor() as usize;
    let n_train = (((draws as f64)*EVAL_TRAIN_FRACTION).floor() as usize + 1).min(draws);
    let c = 1.0/(x.nrows().max(1) as f64);

    let mut accs = Vec::with_capacity(repeats);
    let mut fractions = Vec::with_capacity(repeats);

    for _ in 0..repeats {
        let picks = bootstrap_indices(qualified.len(), draws, rng);
        let (x_train, y_train) = qualified.draw(x, &picks[..n_train.min(picks.len())]);
        let (x_test, y_test) = qualified.draw(x, &picks[n_train.min(picks.len())..]);

        let clf = fit_model(&x_train, &y_train, n_sets, alpha, c);
        accs.push(clf.score(&x_test, &y_test));
        fractions.push(clf.n_nonzero(true));
    }

    AlphaScore { alpha, accuracy: median(&accs), fraction: median(&fractions) }
}

/// Scores every alpha of the grid on the pool and keeps the most accurate. Ties go to the larger alpha.
pub fn select_alpha(pool: &rayon::ThreadPool, x: &DMatrix<f64>, qualified: &Qualified, n_sets: usize,
                    nsample: usize, repeats: usize, rng: &mut StdRng) -> AlphaScore {

    let seeds: Vec<u64> = ALPHA_GRID.iter().map(|_| rng.gen()).collect();

    let scores: Vec<AlphaScore> = pool.install(|| ALPHA_GRID.par_iter().zip(seeds.par_iter()).map(|(&alpha, &seed)| {
        let mut child = StdRng::seed_from_u64(seed);
        eval_model(x, qualified, n_sets, alpha, nsample, repeats, &mut child)
    }).collect());

    let accuracies: Vec<f64> = scores.iter().map(|s| s.accuracy).collect();
    let best = scores[argmax_first(&accuracies).unwrap_or(0)];

    info!("alpha {}  accuracy: {}  fraction: {}", best.alpha, best.accuracy, best.fraction);
    best
}

/// Dendrogram driven ensemble of bootstrapped sparse classifiers.
///
/// The label columns are clustered by their profiles over the regions. Each cut
/// of that tree, from 3 groups upwards, defines sets of columns; regions that
/// clearly belong to one set train a classifier that separates the sets, and
/// the bootstrap averaged coefficients of a set are credited to every column
/// in it. A column's activity is the mean over the levels it was credited at.
pub struct MoreMoap {
    config: MoreConfig,
    act: Option<ActivityTable>,
    levels: Vec<LevelReport>,
    contributions: Vec<Vec<String>>,
    unresolved: Vec<String>,
}

impl MoreMoap {

    pub fn new(config: MoreConfig) -> Self {
        MoreMoap { config, act: None, levels: Vec::new(), contributions: Vec::new(), unresolved: Vec::new() }
    }

    pub fn config(&self) -> &MoreConfig {
        &self.config
    }

    pub fn levels(&self) -> &[LevelReport] {
        &self.levels
    }

    /// Label columns no level produced an estimate for. Their activity is NaN.
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    /// Names of the level/set results averaged into a label column, e.g. "k3_set2".
    pub fn contributions(&self, column: &str) -> Option<&[String]> {
        let idx = self.act.as_ref()?.columns().iter().position(|c| c == column)?;
        self.contributions.get(idx).map(|c| c.as_slice())
    }

    /// Bootstrap fits of one level. None if too many draws had to be skipped.
    fn run_bootstrap_model(&self, pool: &rayon::ThreadPool, x: &DMatrix<f64>, qualified: &Qualified, n_sets: usize,
                           alpha: f64, nsample: usize, rng: &mut StdRng) -> Option<Vec<DMatrix<f64>>> {

        let c = 1.0/(x.nrows().max(1) as f64);

        info!("running {} bootstraps", self.config.nbootstrap);

        let mut data: Vec<(DMatrix<f64>, Vec<usize>)> = Vec::with_capacity(self.config.nbootstrap);
        for b in 0..self.config.nbootstrap {
            let picks = bootstrap_indices(qualified.len(), nsample, rng);
            let (x_small, y_small) = qualified.draw(x, &picks);
            if y_small.iter().unique().count() != n_sets {
                warn!("bootstrap {} misses a set, skipped", b);
                continue;
            }
            data.push((x_small, y_small));
        }

        let fits: Vec<CdClassifier> = pool.install(|| data.par_iter().map(|(xs, ys)| fit_model(xs, ys, n_sets, alpha, c)).collect());

        if !fits.is_empty() {
            let accs: Vec<f64> = fits.iter().zip(&data).map(|(clf, (xs, ys))| clf.score(xs, ys)).collect();
            let fractions: Vec<f64> = fits.iter().map(|clf| clf.n_nonzero(true)).collect();
            info!("average accuracy {}", mean(&accs));
            info!("average fraction {}", mean(&fractions));
        }

        let n_columns = fits.len()*n_sets;
        if fits.is_empty() || (n_columns as f64) < MIN_BOOTSTRAP_FRACTION*((self.config.nbootstrap*n_sets) as f64) {
            return None;
        }

        //motifs x sets per fit; a set without an output row (binary case) gets zeros
        Some(fits.iter().map(|clf| {
            let coef = clf.coef();
            DMatrix::from_fn(x.ncols(), n_sets, |m, s| if s < coef.nrows() { coef[(s, m)] } else { 0.0 })
        }).collect())
    }
}

impl Moap for MoreMoap {

    fn fit(&mut self, x: &ScoreMatrix, y: &LabelMatrix) -> Result<(), MoapError> {

        self.act = None;
        self.levels.clear();
        self.contributions.clear();
        self.unresolved.clear();

        if self.config.nbootstrap == 0 {
            return Err(MoapError::InputType("need at least one bootstrap".to_string()));
        }

        let scores = y.aligned_scores(x)?;
        let n_cols = y.n_columns();
        let columns = y.columns();

        let tree = Dendrogram::ward(&pairwise_distances(&y.values().transpose()));
        let y_scaled = scale_columns(y.values());

        let mut rng = seeded_rng(self.config.seed);
        let pool = thread_pool(self.config.n_threads)?;

        let mut accumulated: Vec<Vec<(String, DVector<f64>)>> = vec![Vec::new(); n_cols];
        let mut levels: Vec<LevelReport> = Vec::new();

        for nclus in FIRST_LEVEL..=n_cols {

            let labels = tree.cut(nclus);
            let n_groups = labels.iter().copied().max().unwrap_or(0);

            let sets: Vec<Vec<usize>> = (1..=n_groups).map(|g| (0..n_cols).filter(|&c| labels[c] == g).collect()).collect();
            let set_names: Vec<Vec<String>> = sets.iter().map(|s| s.iter().map(|&c| columns[c].clone()).collect()).collect();

            let mut report = LevelReport { n_clusters: nclus, sets: set_names, alpha: None, outcome: LevelOutcome::Fitted };

            if n_groups < nclus {
                warn!("remaining clusters are too similar");
                report.outcome = LevelOutcome::TooSimilar;
                levels.push(report);
                break;
            }

            info!("{} clusters: {}", nclus, report.sets.iter().map(|s| s.join("_")).join(", "));

            let qualified = Qualified::from_membership(&select_sets(&y_scaled, &sets, self.config.threshold, self.config.margin));

            if qualified.is_empty() {
                info!("no sets with these filters, no result for {} clusters", nclus);
                report.outcome = LevelOutcome::NoRegions;
                levels.push(report);
                continue;
            }

            let nsample = self.config.nsample.min(qualified.len()/2);
            if nsample < self.config.nsample {
                info!("setting nsample to {}", nsample);
            }

            info!("selecting alpha");
            let best = select_alpha(&pool, &scores, &qualified, nclus, nsample, self.config.eval_repeats, &mut rng);
            report.alpha = Some(best.alpha);

            let Some(fits) = self.run_bootstrap_model(&pool, &scores, &qualified, nclus, best.alpha, nsample, &mut rng) else {
                warn!("not enough for bootstrap");
                report.outcome = LevelOutcome::InsufficientBootstrap;
                levels.push(report);
                break;
            };

            for (i, set) in sets.iter().enumerate() {
                let mut act = DVector::<f64>::zeros(scores.ncols());
                for coef in &fits {
                    act += coef.column(i);
                }
                act /= fits.len() as f64;
                for &col in set {
                    accumulated[col].push((format!("k{}_set{}", nclus, i+1), act.clone()));
                }
            }

            levels.push(report);
        }

        let mut act = DMatrix::<f64>::from_element(scores.ncols(), n_cols, f64::NAN);
        let mut unresolved = Vec::new();

        for (col, parts) in accumulated.iter().enumerate() {
            if parts.is_empty() {
                unresolved.push(columns[col].clone());
                continue;
            }
            let mut sum = DVector::<f64>::zeros(scores.ncols());
            for (_, part) in parts {
                sum += part;
            }
            act.set_column(col, &(sum/(parts.len() as f64)));
        }

        if !unresolved.is_empty() {
            warn!("no activity for {}", unresolved.join(", "));
        }

        self.contributions = accumulated.into_iter().map(|parts| parts.into_iter().map(|(name, _)| name).collect()).collect();
        self.levels = levels;
        self.unresolved = unresolved;
        self.act = Some(ActivityTable::new(x.motifs().to_vec(), columns.to_vec(), act)?);
        Ok(())
    }

    fn activity(&self) -> Option<&ActivityTable> {
        self.act.as_ref()
    }

    fn method(&self) -> Method {
        Method::More
    }
}
