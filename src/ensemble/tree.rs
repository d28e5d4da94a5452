use serde::{Serialize, Deserialize};

/// Growth limits of one regression tree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
}

impl Default for TreeParams {
    fn default() -> Self {
        TreeParams { max_depth: 3, min_samples_split: 2, min_samples_leaf: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Leaf { value: f64 },
    Split { feature: usize, threshold: f64, left: usize, right: usize },
}

/// CART regression tree grown on Friedman's MSE improvement.
///
/// Nodes live in a flat vector with the root at index 0. Samples with
/// `x[feature] <= threshold` go left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub nodes: Vec<Node>,
}

struct Split {
    feature: usize,
    threshold: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

impl RegressionTree {
    /// Fits `targets` on the rows of `x` listed in `samples`. Leaves start
    /// at the mean target of their samples.
    pub fn fit(x: &[Vec<f64>], targets: &[f64], samples: &[usize], params: &TreeParams) -> RegressionTree {
        let mut tree = RegressionTree { nodes: Vec::new() };
        tree.grow(x, targets, samples.to_vec(), 0, params);
        tree
    }

    fn grow(&mut self, x: &[Vec<f64>], targets: &[f64], samples: Vec<usize>, depth: usize, params: &TreeParams) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { value: mean(targets, &samples) });

        if depth >= params.max_depth || samples.len() < params.min_samples_split.max(2) {
            return id;
        }
        let split = match best_split(x, targets, &samples, params.min_samples_leaf.max(1)) {
            Some(s) => s,
            None => return id,
        };
        let left = self.grow(x, targets, split.left, depth + 1, params);
        let right = self.grow(x, targets, split.right, depth + 1, params);
        self.nodes[id] = Node::Split { feature: split.feature, threshold: split.threshold, left, right };
        id
    }

    /// Index of the leaf `row` falls into.
    pub fn leaf_of(&self, row: &[f64]) -> usize {
        let mut id = 0;
        loop {
            match self.nodes[id] {
                Node::Leaf { .. } => return id,
                Node::Split { feature, threshold, left, right } => {
                    id = if row.get(feature).copied().unwrap_or(0.0) <= threshold { left } else { right };
                }
            }
        }
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        match self.nodes[self.leaf_of(row)] {
            Node::Leaf { value } => value,
            Node::Split { .. } => 0.0,
        }
    }

    /// Overwrites a leaf value; ignored for split nodes.
    pub fn set_leaf(&mut self, id: usize, new_value: f64) {
        if let Some(Node::Leaf { value }) = self.nodes.get_mut(id) {
            *value = new_value;
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| matches!(n, Node::Leaf { .. })).count()
    }
}

fn mean(targets: &[f64], samples: &[usize]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&i| targets[i]).sum::<f64>() / samples.len() as f64
}

/// Scans every feature for the threshold maximising
/// `n_l * n_r / n * (mean_l - mean_r)^2`.
fn best_split(x: &[Vec<f64>], targets: &[f64], samples: &[usize], min_leaf: usize) -> Option<Split> {
    let n = samples.len();
    let n_features = x.get(samples[0]).map(|r| r.len()).unwrap_or(0);
    let total: f64 = samples.iter().map(|&i| targets[i]).sum();
    let mut best: Option<(usize, f64, f64)> = None;

    for feature in 0..n_features {
        let mut order = samples.to_vec();
        order.sort_by(|&a, &b| x[a][feature].partial_cmp(&x[b][feature]).unwrap_or(std::cmp::Ordering::Equal));

        let mut left_sum = 0.0;
        for pos in 0..n - 1 {
            left_sum += targets[order[pos]];
            let n_left = pos + 1;
            let n_right = n - n_left;
            let (here, next) = (x[order[pos]][feature], x[order[pos + 1]][feature]);
            if here >= next || n_left < min_leaf || n_right < min_leaf {
                continue;
            }
            let diff = left_sum / n_left as f64 - (total - left_sum) / n_right as f64;
            let improvement = (n_left * n_right) as f64 / n as f64 * diff * diff;
            if improvement > best.map(|b| b.2).unwrap_or(1e-12) {
                let mut threshold = here / 2.0 + next / 2.0;
                if threshold >= next || !threshold.is_finite() {
                    threshold = here;
                }
                best = Some((feature, threshold, improvement));
            }
        }
    }

    best.map(|(feature, threshold, _)| {
        let (left, right): (Vec<usize>, Vec<usize>) = samples.iter().partition(|&&i| x[i][feature] <= threshold);
        Split { feature, threshold, left, right }
    })
}
