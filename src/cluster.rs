use nalgebra::DMatrix;

/// Euclidean distances between the rows of `obs`.
pub fn pairwise_distances(obs: &DMatrix<f64>) -> DMatrix<f64> {
    let n = obs.nrows();
    DMatrix::from_fn(n, n, |i, j| {
        if i == j { 0.0 } else { (obs.row(i) - obs.row(j)).norm() }
    })
}

/// One agglomeration step. Leaves are nodes 0..n, the i-th merge creates node n+i.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Merge {
    pub left: usize,
    pub right: usize,
    pub height: f64,
    pub size: usize,
}

#[derive(Clone, Debug)]
pub struct Dendrogram {
    n_leaves: usize,
    merges: Vec<Merge>,
}

impl Dendrogram {

    /// Ward linkage of the rows of `obs`, by the Lance-Williams recurrence.
    /// Ties go to the first pair in row major order.
    pub fn ward(obs: &DMatrix<f64>) -> Self {

        let n = obs.nrows();
        let mut dist = pairwise_distances(obs);

        //slot -> (node id, size); None once absorbed
        let mut slots: Vec<Option<(usize, usize)>> = (0..n).map(|i| Some((i, 1))).collect();
        let mut merges = Vec::with_capacity(n.saturating_sub(1));

        for step in 0..n.saturating_sub(1) {

            let mut best: Option<(usize, usize, f64)> = None;
            for i in 0..n {
                if slots[i].is_none() { continue; }
                for j in (i+1)..n {
                    if slots[j].is_none() { continue; }
                    let d = dist[(i, j)];
                    if best.map_or(true, |(_, _, b)| d < b) {
                        best = Some((i, j, d));
                    }
                }
            }

            let Some((i, j, height)) = best else { break };
            let (Some((node_i, size_i)), Some((node_j, size_j))) = (slots[i], slots[j]) else { break };

            for k in 0..n {
                let Some((_, size_k)) = slots[k] else { continue };
                if k == i || k == j { continue; }
                let (ni, nj, nk) = (size_i as f64, size_j as f64, size_k as f64);
                let d2 = ((ni+nk)*dist[(k, i)].powi(2) + (nj+nk)*dist[(k, j)].powi(2) - nk*height.powi(2))/(ni+nj+nk);
                let d = d2.max(0.0).sqrt();
                dist[(k, i)] = d;
                dist[(i, k)] = d;
            }

            merges.push(Merge { left: node_i.min(node_j), right: node_i.max(node_j), height, size: size_i+size_j });
            slots[i] = Some((n+step, size_i+size_j));
            slots[j] = None;
        }

        Dendrogram { n_leaves: n, merges }
    }

    pub fn n_leaves(&self) -> usize {
        self.n_leaves
    }

    pub fn merges(&self) -> &[Merge] {
        &self.merges
    }

    /// Flat clustering into at most `k` groups: every merge no higher than the
    /// lowest height that leaves k or fewer groups is applied. Tied heights can
    /// give fewer than `k` groups.
    ///
    /// Labels start at 1 and are numbered in order of first appearance over the leaves.
    pub fn cut(&self, k: usize) -> Vec<usize> {

        let n = self.n_leaves;
        let mut group: Vec<usize> = (0..n).collect();

        if k < n && k > 0 {

            let mut heights: Vec<f64> = self.merges.iter().map(|m| m.height).collect();
            heights.sort_by(|a, b| a.total_cmp(b));
            let threshold = heights[n-k-1];

            //node -> leaves below it
            let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();

            for merge in self.merges.iter().take_while(|m| m.height <= threshold) {
                let mut joined = std::mem::take(&mut members[merge.left]);
                joined.append(&mut std::mem::take(&mut members[merge.right]));
                let id = members.len();
                for &leaf in &joined {
                    group[leaf] = id;
                }
                members.push(joined);
            }
        }

        let mut seen: Vec<usize> = Vec::new();
        group.iter().map(|g| {
            match seen.iter().position(|s| s == g) {
                Some(p) => p+1,
                None => { seen.push(*g); seen.len() },
            }
        }).collect()
    }
}
