use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MoapError {
    #[error("input shape error: {0}")]
    InputShape(String),
    #[error("input type error: {0}")]
    InputType(String),
    #[error("could not build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("model failure: {0}")]
    Model(String),
}

fn check_unique(names: &[String], what: &str) -> Result<(), MoapError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(names.len());
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(MoapError::InputShape(format!("duplicate {} '{}'", what, name)));
        }
    }
    Ok(())
}

/// Region x motif scores. Rows are regions, columns are motifs.
#[derive(Clone, Debug)]
pub struct ScoreMatrix {
    regions: Vec<String>,
    motifs: Vec<String>,
    values: DMatrix<f64>,
}

impl ScoreMatrix {

    pub fn new(regions: Vec<String>, motifs: Vec<String>, values: DMatrix<f64>) -> Result<Self, MoapError> {

        if values.nrows() != regions.len() || values.ncols() != motifs.len() {
            return Err(MoapError::InputShape(format!(
                "score values are {}x{} but there are {} regions and {} motifs",
                values.nrows(), values.ncols(), regions.len(), motifs.len())));
        }

        check_unique(&regions, "region")?;
        check_unique(&motifs, "motif")?;

        Ok(ScoreMatrix { regions, motifs, values })
    }

    pub fn from_rows(regions: Vec<String>, motifs: Vec<String>, rows: &[Vec<f64>]) -> Result<Self, MoapError> {

        if rows.iter().any(|r| r.len() != motifs.len()) {
            return Err(MoapError::InputShape("every score row needs one value per motif".to_string()));
        }

        let values = DMatrix::from_fn(rows.len(), motifs.len(), |i, j| rows[i][j]);
        Self::new(regions, motifs, values)
    }

    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    pub fn motifs(&self) -> &[String] {
        &self.motifs
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn n_regions(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_motifs(&self) -> usize {
        self.values.ncols()
    }

    /// True if every score is a non-negative whole number, ie a motif count.
    pub fn is_count_matrix(&self) -> bool {
        self.values.iter().all(|&v| v.is_finite() && v >= 0.0 && v.fract() == 0.0)
    }

}

/// Region aligned label table. Every column is numeric: categorical labels are
/// stored as codes and remember their level names.
#[derive(Clone, Debug)]
pub struct LabelMatrix {
    regions: Vec<String>,
    columns: Vec<String>,
    values: DMatrix<f64>,
    levels: Option<Vec<String>>,
}

/// Class assignment of a single label column: `names[codes[i]]` is the class of region i.
#[derive(Clone, Debug, PartialEq)]
pub struct Classes {
    pub names: Vec<String>,
    pub codes: Vec<usize>,
}

impl Classes {
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

impl LabelMatrix {

    pub fn new(regions: Vec<String>, columns: Vec<String>, values: DMatrix<f64>) -> Result<Self, MoapError> {

        if values.nrows() != regions.len() || values.ncols() != columns.len() {
            return Err(MoapError::InputShape(format!(
                "label values are {}x{} but there are {} regions and {} columns",
                values.nrows(), values.ncols(), regions.len(), columns.len())));
        }

        check_unique(&regions, "region")?;
        check_unique(&columns, "label column")?;

        Ok(LabelMatrix { regions, columns, values, levels: None })
    }

    pub fn from_column(regions: Vec<String>, name: &str, values: Vec<f64>) -> Result<Self, MoapError> {
        let n = values.len();
        Self::new(regions, vec![name.to_string()], DMatrix::from_vec(n, 1, values))
    }

    /// Single categorical column. Codes follow the sorted order of the class names.
    pub fn from_classes<S: AsRef<str>>(regions: Vec<String>, name: &str, classes: &[S]) -> Result<Self, MoapError> {

        let levels: Vec<String> = classes.iter().map(|c| c.as_ref().to_string()).sorted().dedup().collect();
        let code_of: HashMap<&str, usize> = levels.iter().enumerate().map(|(i, l)| (l.as_str(), i)).collect();

        let codes: Vec<f64> = classes.iter().map(|c| code_of[c.as_ref()] as f64).collect();

        let mut labels = Self::from_column(regions, name, codes)?;
        labels.levels = Some(levels);
        Ok(labels)
    }

    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn n_regions(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.values.ncols()
    }

    fn label_name(&self, value: f64) -> String {
        match &self.levels {
            Some(levels) if value >= 0.0 && (value as usize) < levels.len() => levels[value as usize].clone(),
            _ => format!("{}", value),
        }
    }

    pub fn require_single_column(&self) -> Result<(), MoapError> {
        if self.n_columns() != 1 {
            return Err(MoapError::InputShape(format!("y needs to have 1 label column, not {}", self.n_columns())));
        }
        Ok(())
    }

    /// Distinct labels of the single column, in order of first appearance.
    pub fn classes_by_appearance(&self) -> Result<Classes, MoapError> {

        self.require_single_column()?;

        let mut distinct: Vec<f64> = Vec::new();
        let codes: Vec<usize> = self.values.column(0).iter().map(|&v| {
            match distinct.iter().position(|&d| d == v) {
                Some(i) => i,
                None => { distinct.push(v); distinct.len()-1 },
            }
        }).collect();

        if distinct.is_empty() {
            return Err(MoapError::InputType("label column holds no classes".to_string()));
        }

        Ok(Classes { names: distinct.iter().map(|&v| self.label_name(v)).collect(), codes })
    }

    /// Distinct labels of the single column, sorted. This is the encoding the classifiers use.
    pub fn classes_sorted(&self) -> Result<Classes, MoapError> {

        self.require_single_column()?;

        let distinct: Vec<f64> = self.values.column(0).iter().copied().sorted_by(|a, b| a.total_cmp(b)).dedup().collect();

        if distinct.is_empty() {
            return Err(MoapError::InputType("label column holds no classes".to_string()));
        }

        let codes: Vec<usize> = self.values.column(0).iter()
                                    .map(|v| distinct.iter().position(|d| d == v).unwrap_or(0)).collect();

        Ok(Classes { names: distinct.iter().map(|&v| self.label_name(v)).collect(), codes })
    }

    /// Returns the scores of `x` in the row order of these labels.
    ///
    /// Row counts must agree. If the region ids are the same set but in another
    /// order the scores are reordered; ids that cannot be found are an error.
    pub fn aligned_scores(&self, x: &ScoreMatrix) -> Result<DMatrix<f64>, MoapError> {

        if x.n_regions() != self.n_regions() {
            return Err(MoapError::InputShape(format!(
                "number of regions is not equal: {} scored, {} labeled", x.n_regions(), self.n_regions())));
        }

        if x.regions() == self.regions() {
            return Ok(x.values().clone());
        }

        let row_of: HashMap<&str, usize> = x.regions().iter().enumerate().map(|(i, r)| (r.as_str(), i)).collect();

        let mut order: Vec<usize> = Vec::with_capacity(self.n_regions());
        for region in &self.regions {
            match row_of.get(region.as_str()) {
                Some(&i) => order.push(i),
                None => return Err(MoapError::InputShape(format!("region '{}' has labels but no scores", region))),
            }
        }

        Ok(x.values().select_rows(order.iter()))
    }
}

/// Motif x column activity estimates. Missing estimates are NaN.
#[derive(Clone, Debug)]
pub struct ActivityTable {
    motifs: Vec<String>,
    columns: Vec<String>,
    values: DMatrix<f64>,
}

impl ActivityTable {

    pub fn new(motifs: Vec<String>, columns: Vec<String>, values: DMatrix<f64>) -> Result<Self, MoapError> {
        if values.nrows() != motifs.len() || values.ncols() != columns.len() {
            return Err(MoapError::InputShape(format!(
                "activity values are {}x{} but there are {} motifs and {} columns",
                values.nrows(), values.ncols(), motifs.len(), columns.len())));
        }
        Ok(ActivityTable { motifs, columns, values })
    }

    pub fn motifs(&self) -> &[String] {
        &self.motifs
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn shape(&self) -> (usize, usize) {
        self.values.shape()
    }

    pub fn column(&self, name: &str) -> Option<DVector<f64>> {
        self.columns.iter().position(|c| c == name).map(|j| self.values.column(j).into_owned())
    }

    pub fn get(&self, motif: &str, column: &str) -> Option<f64> {
        let i = self.motifs.iter().position(|m| m == motif)?;
        let j = self.columns.iter().position(|c| c == column)?;
        Some(self.values[(i, j)])
    }

    /// False if the column is absent or holds no estimate at all.
    pub fn has_result(&self, column: &str) -> bool {
        self.column(column).map_or(false, |c| c.iter().any(|v| !v.is_nan()))
    }

    pub fn all_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Per motif flag: is the motif's activity outside the permutation null for any column.
#[derive(Clone, Debug, PartialEq)]
pub struct Significance {
    motifs: Vec<String>,
    flags: Vec<bool>,
}

impl Significance {

    pub fn new(motifs: Vec<String>, flags: Vec<bool>) -> Result<Self, MoapError> {
        if motifs.len() != flags.len() {
            return Err(MoapError::InputShape("one significance flag per motif is required".to_string()));
        }
        Ok(Significance { motifs, flags })
    }

    pub fn motifs(&self) -> &[String] {
        &self.motifs
    }

    pub fn flags(&self) -> &[bool] {
        &self.flags
    }

    pub fn get(&self, motif: &str) -> Option<bool> {
        self.motifs.iter().position(|m| m == motif).map(|i| self.flags[i])
    }

    pub fn n_significant(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }
}

/// Zero mean, unit (population) variance per column. Constant columns are only centred.
pub fn scale_columns(m: &DMatrix<f64>) -> DMatrix<f64> {

    let mut scaled = m.clone();
    let n = m.nrows() as f64;
    if m.nrows() == 0 { return scaled; }

    for mut col in scaled.column_iter_mut() {
        let mean = col.sum()/n;
        let var = col.iter().map(|v| (v-mean).powi(2)).sum::<f64>()/n;
        let sd = if var > 0.0 { var.sqrt() } else { 1.0 };
        for v in col.iter_mut() {
            *v = (*v-mean)/sd;
        }
    }
    scaled
}

pub fn center_columns(m: &DMatrix<f64>) -> DMatrix<f64> {
    let mut centered = m.clone();
    if m.nrows() == 0 { return centered; }
    let n = m.nrows() as f64;
    for mut col in centered.column_iter_mut() {
        let mean = col.sum()/n;
        col.add_scalar_mut(-mean);
    }
    centered
}

pub fn center_rows(m: &DMatrix<f64>) -> DMatrix<f64> {
    let mut centered = m.clone();
    if m.ncols() == 0 { return centered; }
    let n = m.ncols() as f64;
    for mut row in centered.row_iter_mut() {
        let mean = row.sum()/n;
        row.add_scalar_mut(-mean);
    }
    centered
}

#[cfg(test)]
mod tester {

    use super::*;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn score_matrix_checks() {

        let m = DMatrix::from_element(3, 2, 1.0);
        assert!(ScoreMatrix::new(names("r", 3), names("m", 2), m.clone()).is_ok());
        assert!(matches!(ScoreMatrix::new(names("r", 2), names("m", 2), m.clone()), Err(MoapError::InputShape(_))));

        let dup = vec!["r0".to_string(), "r0".to_string(), "r1".to_string()];
        assert!(matches!(ScoreMatrix::new(dup, names("m", 2), m), Err(MoapError::InputShape(_))));

        let counts = ScoreMatrix::from_rows(names("r", 2), names("m", 2), &[vec![0.0, 3.0], vec![1.0, 2.0]]).unwrap();
        assert!(counts.is_count_matrix());
        let scores = ScoreMatrix::from_rows(names("r", 2), names("m", 2), &[vec![0.5, 3.0], vec![1.0, 2.0]]).unwrap();
        assert!(!scores.is_count_matrix());
    }

    #[test]
    fn classes_keep_their_names() {

        let labels = LabelMatrix::from_classes(names("r", 5), "cluster", &["b", "a", "c", "a", "b"]).unwrap();

        let sorted = labels.classes_sorted().unwrap();
        assert_eq!(sorted.names, vec!["a", "b", "c"]);
        assert_eq!(sorted.codes, vec![1, 0, 2, 0, 1]);

        let seen = labels.classes_by_appearance().unwrap();
        assert_eq!(seen.names, vec!["b", "a", "c"]);
        assert_eq!(seen.codes, vec![0, 1, 2, 1, 0]);

        let numeric = LabelMatrix::from_column(names("r", 4), "cluster", vec![2.0, 0.0, 2.0, 1.0]).unwrap();
        assert_eq!(numeric.classes_by_appearance().unwrap().names, vec!["2", "0", "1"]);
        assert_eq!(numeric.classes_sorted().unwrap().names, vec!["0", "1", "2"]);
    }

    #[test]
    fn alignment_reorders_regions() {

        let x = ScoreMatrix::from_rows(vec!["a".into(), "b".into()], names("m", 1), &[vec![1.0], vec![2.0]]).unwrap();
        let y = LabelMatrix::from_column(vec!["b".into(), "a".into()], "c", vec![0.0, 1.0]).unwrap();

        let aligned = y.aligned_scores(&x).unwrap();
        assert_eq!(aligned[(0, 0)], 2.0);
        assert_eq!(aligned[(1, 0)], 1.0);

        let short = LabelMatrix::from_column(vec!["a".into()], "c", vec![0.0]).unwrap();
        assert!(matches!(short.aligned_scores(&x), Err(MoapError::InputShape(_))));

        let stranger = LabelMatrix::from_column(vec!["a".into(), "z".into()], "c", vec![0.0, 1.0]).unwrap();
        assert!(matches!(stranger.aligned_scores(&x), Err(MoapError::InputShape(_))));
    }

    #[test]
    fn scaling_and_centering() {

        let m = DMatrix::from_row_slice(3, 2, &[1.0, 5.0, 2.0, 5.0, 3.0, 5.0]);
        let s = scale_columns(&m);
        assert!(s.column(0).sum().abs() < 1e-12);
        let var = s.column(0).iter().map(|v| v*v).sum::<f64>()/3.0;
        assert!((var-1.0).abs() < 1e-12);
        assert!(s.column(1).iter().all(|&v| v == 0.0));

        let r = center_rows(&m);
        assert!(r.row(0).sum().abs() < 1e-12);
        let c = center_columns(&m);
        assert!(c.column(0).sum().abs() < 1e-12);
    }

    #[test]
    fn missing_activity_is_not_zero() {

        let values = DMatrix::from_row_slice(2, 2, &[0.0, f64::NAN, 0.0, f64::NAN]);
        let act = ActivityTable::new(names("m", 2), vec!["kept".into(), "lost".into()], values).unwrap();
        assert!(act.has_result("kept"));
        assert!(!act.has_result("lost"));
        assert!(!act.has_result("absent"));
        assert_eq!(act.get("m1", "kept"), Some(0.0));
    }
}
