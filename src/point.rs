use log::info;
use nalgebra::DMatrix;

use crate::data_struct::{ActivityTable, LabelMatrix, MoapError, ScoreMatrix};
use crate::stats::{benjamini_hochberg, hypergeom_sf_inclusive, ks_2samp};
use crate::{Method, Moap};

/// Per cluster p-values (clusters x motifs) turned into the two output tables:
/// -log10 of the raw p-values, and the Benjamini-Hochberg adjusted values over all of them.
fn tables_from_pvalues(pvals: &DMatrix<f64>, motifs: &[String], clusters: Vec<String>) -> Result<(ActivityTable, ActivityTable), MoapError> {

    let (n_clusters, n_motifs) = pvals.shape();

    let flat: Vec<f64> = pvals.transpose().iter().copied().collect();
    let adjusted = benjamini_hochberg(&flat);

    //transpose() above is column major motifs x clusters, so this rebuilds the same layout
    let fdr = DMatrix::from_vec(n_motifs, n_clusters, adjusted);
    let act = pvals.transpose().map(|p| if p >= 1.0 { 0.0 } else { -p.log10() });

    Ok((ActivityTable::new(motifs.to_vec(), clusters.clone(), act)?,
        ActivityTable::new(motifs.to_vec(), clusters, fdr)?))
}

/// Motif activity as the hypergeometric enrichment of regions with at least
/// one motif occurrence in a cluster versus all regions.
///
/// Needs motif counts. Reports -log10 of the uncorrected p-value; the
/// Benjamini-Hochberg adjusted values are available separately from [`ClassicMoap::fdr`].
#[derive(Default)]
pub struct ClassicMoap {
    act: Option<ActivityTable>,
    fdr: Option<ActivityTable>,
}

impl ClassicMoap {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn fdr(&self) -> Option<&ActivityTable> {
        self.fdr.as_ref()
    }
}

impl Moap for ClassicMoap {

    fn fit(&mut self, x: &ScoreMatrix, y: &LabelMatrix) -> Result<(), MoapError> {

        self.act = None;
        self.fdr = None;

        let counts = y.aligned_scores(x)?;
        let classes = y.classes_by_appearance()?;

        if !x.is_count_matrix() {
            return Err(MoapError::InputType("need motif counts, not scores".to_string()));
        }

        let total = counts.nrows() as u64;
        let n_motifs = counts.ncols();

        let mut pvals = DMatrix::<f64>::zeros(classes.len(), n_motifs);

        for cluster in 0..classes.len() {

            let in_cluster: Vec<bool> = classes.codes.iter().map(|&c| c == cluster).collect();
            let draws = in_cluster.iter().filter(|&&b| b).count() as u64;

            for m in 0..n_motifs {
                let col = counts.column(m);
                let pos_true = col.iter().zip(&in_cluster).filter(|&(&v, &inside)| inside && v > 0.0).count() as u64;
                let neg_true = col.iter().zip(&in_cluster).filter(|&(&v, &inside)| !inside && v > 0.0).count() as u64;

                pvals[(cluster, m)] = hypergeom_sf_inclusive(pos_true, total, pos_true+neg_true, draws)?;
            }
        }

        info!("hypergeometric p-values for {} clusters and {} motifs", classes.len(), n_motifs);

        let (act, fdr) = tables_from_pvalues(&pvals, x.motifs(), classes.names)?;
        self.act = Some(act);
        self.fdr = Some(fdr);
        Ok(())
    }

    fn activity(&self) -> Option<&ActivityTable> {
        self.act.as_ref()
    }

    fn method(&self) -> Method {
        Method::Classic
    }
}

/// Motif activity as the Kolmogorov-Smirnov p-value of the motif score
/// distribution in a cluster against the distribution in all other clusters.
///
/// Reports -log10 of the uncorrected p-value; adjusted values come from [`KsMoap::fdr`].
#[derive(Default)]
pub struct KsMoap {
    act: Option<ActivityTable>,
    fdr: Option<ActivityTable>,
}

impl KsMoap {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn fdr(&self) -> Option<&ActivityTable> {
        self.fdr.as_ref()
    }
}

impl Moap for KsMoap {

    fn fit(&mut self, x: &ScoreMatrix, y: &LabelMatrix) -> Result<(), MoapError> {

        self.act = None;
        self.fdr = None;

        let scores = y.aligned_scores(x)?;
        let classes = y.classes_by_appearance()?;
        let n_motifs = scores.ncols();

        let mut pvals = DMatrix::<f64>::zeros(classes.len(), n_motifs);

        for cluster in 0..classes.len() {
            for m in 0..n_motifs {
                let (pos, neg): (Vec<(usize, f64)>, Vec<(usize, f64)>) = scores.column(m).iter().copied().enumerate()
                                                                            .partition(|&(i, _)| classes.codes[i] == cluster);
                let pos: Vec<f64> = pos.into_iter().map(|(_, v)| v).collect();
                let neg: Vec<f64> = neg.into_iter().map(|(_, v)| v).collect();
                pvals[(cluster, m)] = ks_2samp(&pos, &neg).1;
            }
        }

        info!("Kolmogorov-Smirnov p-values for {} clusters and {} motifs", classes.len(), n_motifs);

        let (act, fdr) = tables_from_pvalues(&pvals, x.motifs(), classes.names)?;
        self.act = Some(act);
        self.fdr = Some(fdr);
        Ok(())
    }

    fn activity(&self) -> Option<&ActivityTable> {
        self.act.as_ref()
    }

    fn method(&self) -> Method {
        Method::Ks
    }
}

#[cfg(test)]
mod tester {

    use super::*;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    //Motif 0 only occurs in cluster "a", motif 1 everywhere
    fn enriched() -> (ScoreMatrix, LabelMatrix) {
        let n = 40;
        let classes: Vec<&str> = (0..n).map(|i| if i < 10 { "a" } else if i < 25 { "b" } else { "c" }).collect();
        let rows: Vec<Vec<f64>> = (0..n).map(|i| vec![if i < 10 { 2.0 } else { 0.0 }, 1.0]).collect();
        let x = ScoreMatrix::from_rows(names("r", n), names("m", 2), &rows).unwrap();
        let y = LabelMatrix::from_classes(names("r", n), "cluster", &classes).unwrap();
        (x, y)
    }

    #[test]
    fn classic_finds_enrichment() {

        let (x, y) = enriched();
        let mut moap = ClassicMoap::new();
        moap.fit(&x, &y).unwrap();

        let act = moap.activity().unwrap();
        assert_eq!(act.shape(), (2, 3));
        assert_eq!(act.columns(), &["a".to_string(), "b".to_string(), "c".to_string()]);
        assert!(act.all_finite());
        assert!(act.values().iter().all(|&v| v >= 0.0));

        //1/C(40,10)
        assert!(act.get("m0", "a").unwrap() > 8.0);
        assert_eq!(act.get("m0", "b").unwrap(), 0.0);
        //a motif present in every region is never enriched
        assert!(act.get("m1", "a").unwrap().abs() < 1e-9);

        let fdr = moap.fdr().unwrap();
        assert_eq!(fdr.shape(), (2, 3));
        assert!(fdr.values().iter().all(|&v| v > 0.0 && v <= 1.0));
    }

    #[test]
    fn classic_rejects_scores() {
        let (_, y) = enriched();
        let rows: Vec<Vec<f64>> = (0..40).map(|i| vec![0.5*(i as f64), 1.0]).collect();
        let x = ScoreMatrix::from_rows(names("r", 40), names("m", 2), &rows).unwrap();
        assert!(matches!(ClassicMoap::new().fit(&x, &y), Err(MoapError::InputType(_))));
    }

    #[test]
    fn failed_refit_drops_old_tables() {

        let (x, y) = enriched();
        let rows: Vec<Vec<f64>> = (0..40).map(|i| vec![0.5*(i as f64), 1.0]).collect();
        let scores = ScoreMatrix::from_rows(names("r", 40), names("m", 2), &rows).unwrap();

        let mut classic = ClassicMoap::new();
        classic.fit(&x, &y).unwrap();
        assert!(classic.fit(&scores, &y).is_err());
        assert!(classic.activity().is_none());
        assert!(classic.fdr().is_none());

        let mut ks = KsMoap::new();
        ks.fit(&x, &y).unwrap();
        let short = LabelMatrix::from_column(names("r", 39), "c", vec![0.0; 39]).unwrap();
        assert!(ks.fit(&x, &short).is_err());
        assert!(ks.activity().is_none());
        assert!(ks.fdr().is_none());
    }

    #[test]
    fn single_label_column_only() {

        let (x, _) = enriched();
        let values = DMatrix::from_element(40, 2, 1.0);
        let y = LabelMatrix::new(names("r", 40), vec!["a".into(), "b".into()], values).unwrap();

        assert!(matches!(ClassicMoap::new().fit(&x, &y), Err(MoapError::InputShape(_))));
        assert!(matches!(KsMoap::new().fit(&x, &y), Err(MoapError::InputShape(_))));

        let short = LabelMatrix::from_column(names("r", 39), "c", vec![0.0; 39]).unwrap();
        assert!(matches!(KsMoap::new().fit(&x, &short), Err(MoapError::InputShape(_))));
    }

    #[test]
    fn ks_separates_shifted_scores() {

        let (x, y) = enriched();
        let mut moap = KsMoap::new();
        moap.fit(&x, &y).unwrap();

        let act = moap.activity().unwrap();
        assert_eq!(act.shape(), (2, 3));
        assert!(act.all_finite());
        assert!(act.get("m0", "a").unwrap() > 3.0);
        assert_eq!(act.get("m1", "b").unwrap(), 0.0);
        assert_eq!(moap.method(), Method::Ks);
    }
}
