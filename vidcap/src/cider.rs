//! Consensus based caption scores, CIDEr and its CIDEr-D variant.
//!
//! Both scores compare tf-idf weighted n-gram vectors of the hypothesis and of each reference,
//! the document frequencies being computed on the references of the scored items.
use std::collections::{HashMap, HashSet};

use candle::Result;

use crate::refs::{Prediction, Refs};
use crate::Error;

/// A caption scoring function.
pub trait Scorer {
    fn name(&self) -> &'static str;

    /// Scores every hypothesis against the references of its item.
    ///
    /// Returns the corpus score, the mean of the per hypothesis scores, and the per hypothesis
    /// scores in input order.
    fn compute_score(&self, refs: &Refs, hyps: &[Prediction]) -> Result<(f64, Vec<f64>)>;
}

// N-gram counts indexed by order - 1, the n-grams are space joined.
type Counts = Vec<HashMap<String, usize>>;

fn precook(caption: &str, n: usize) -> Counts {
    let words = caption.split_whitespace().collect::<Vec<_>>();
    (1..=n)
        .map(|k| {
            let mut counts = HashMap::new();
            for ngram in words.windows(k) {
                *counts.entry(ngram.join(" ")).or_insert(0) += 1
            }
            counts
        })
        .collect()
}

struct Cooked {
    hyp: Counts,
    refs: Vec<Counts>,
}

// Weighted n-gram vector of a caption.
struct NgramVec<'a> {
    weights: Vec<HashMap<&'a str, f64>>,
    norms: Vec<f64>,
    // Number of bigrams, used by the length penalty.
    length: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Similarity {
    /// Products of the term weights.
    Consensus,
    /// Hypothesis weights clipped by the reference ones and a gaussian length penalty.
    Clipped { sigma: f64 },
}

struct Corpus {
    items: Vec<Cooked>,
    doc_freq: HashMap<String, f64>,
    ref_len: f64,
    n: usize,
}

impl Corpus {
    fn new(refs: &Refs, hyps: &[Prediction], n: usize) -> Result<Self> {
        if hyps.is_empty() {
            Err(Error::scorer("no hypothesis to score"))?
        }
        let mut items = Vec::with_capacity(hyps.len());
        for hyp in hyps.iter() {
            let item_refs = match refs.get(&hyp.item_id) {
                Some(item_refs) if !item_refs.is_empty() => item_refs,
                _ => Err(Error::scorer(format!(
                    "no reference caption for item {}",
                    hyp.item_id
                )))?,
            };
            items.push(Cooked {
                hyp: precook(&hyp.caption, n),
                refs: item_refs.iter().map(|r| precook(r, n)).collect(),
            })
        }
        let mut doc_freq = HashMap::new();
        for item in items.iter() {
            let ngrams = item
                .refs
                .iter()
                .flat_map(|r| r.iter().flat_map(|c| c.keys()))
                .collect::<HashSet<_>>();
            for ngram in ngrams {
                *doc_freq.entry(ngram.clone()).or_insert(0.) += 1.
            }
        }
        let ref_len = (items.len() as f64).ln();
        Ok(Self {
            items,
            doc_freq,
            ref_len,
            n,
        })
    }

    fn vec<'a>(&self, counts: &'a Counts) -> NgramVec<'a> {
        let mut weights = vec![HashMap::new(); self.n];
        let mut norms = vec![0.; self.n];
        let mut length = 0.;
        for (k, order) in counts.iter().enumerate() {
            for (ngram, &tf) in order.iter() {
                let df = self.doc_freq.get(ngram).copied().unwrap_or(0.).max(1.);
                let w = tf as f64 * (self.ref_len - df.ln());
                norms[k] += w * w;
                weights[k].insert(ngram.as_str(), w);
                if k == 1 {
                    length += tf as f64
                }
            }
        }
        for norm in norms.iter_mut() {
            *norm = norm.sqrt()
        }
        NgramVec {
            weights,
            norms,
            length,
        }
    }

    fn sim(&self, hyp: &NgramVec, r: &NgramVec, similarity: Similarity) -> Vec<f64> {
        let delta = hyp.length - r.length;
        (0..self.n)
            .map(|k| {
                let mut val = 0.;
                for (ngram, &h) in hyp.weights[k].iter() {
                    if let Some(&w) = r.weights[k].get(ngram) {
                        val += match similarity {
                            Similarity::Consensus => h * w,
                            Similarity::Clipped { .. } => h.min(w) * w,
                        }
                    }
                }
                if hyp.norms[k] != 0. && r.norms[k] != 0. {
                    val /= hyp.norms[k] * r.norms[k]
                }
                if let Similarity::Clipped { sigma } = similarity {
                    val *= (-(delta * delta) / (2. * sigma * sigma)).exp()
                }
                val
            })
            .collect()
    }

    fn scores(&self, similarity: Similarity) -> Vec<f64> {
        self.items
            .iter()
            .map(|item| {
                let hyp = self.vec(&item.hyp);
                let mut per_order = vec![0.; self.n];
                for r in item.refs.iter() {
                    let r = self.vec(r);
                    for (acc, v) in per_order.iter_mut().zip(self.sim(&hyp, &r, similarity)) {
                        *acc += v
                    }
                }
                let mean = per_order.iter().sum::<f64>() / self.n as f64;
                mean / item.refs.len() as f64 * 10.
            })
            .collect()
    }
}

fn corpus_score(scores: Vec<f64>) -> (f64, Vec<f64>) {
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    (mean, scores)
}

/// CIDEr: cosine similarity of tf-idf n-gram vectors averaged over the orders 1 to `n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cider {
    pub n: usize,
}

impl Default for Cider {
    fn default() -> Self {
        Self { n: 4 }
    }
}

impl Scorer for Cider {
    fn name(&self) -> &'static str {
        "CIDEr"
    }

    fn compute_score(&self, refs: &Refs, hyps: &[Prediction]) -> Result<(f64, Vec<f64>)> {
        let corpus = Corpus::new(refs, hyps, self.n)?;
        Ok(corpus_score(corpus.scores(Similarity::Consensus)))
    }
}

/// CIDEr-D, the variant that is harder to game: repeated n-grams are clipped to their
/// reference count and length differences are penalised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CiderD {
    pub n: usize,
    pub sigma: f64,
}

impl Default for CiderD {
    fn default() -> Self {
        Self { n: 4, sigma: 6. }
    }
}

impl Scorer for CiderD {
    fn name(&self) -> &'static str {
        "CIDEr-D"
    }

    fn compute_score(&self, refs: &Refs, hyps: &[Prediction]) -> Result<(f64, Vec<f64>)> {
        let corpus = Corpus::new(refs, hyps, self.n)?;
        let similarity = Similarity::Clipped { sigma: self.sigma };
        Ok(corpus_score(corpus.scores(similarity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(id: &str, caption: &str) -> Prediction {
        Prediction {
            item_id: id.to_string(),
            caption: caption.to_string(),
        }
    }

    fn refs() -> Refs {
        let mut refs = Refs::new();
        refs.insert("a".to_string(), vec!["a b".to_string(), "a c".to_string()]);
        refs.insert("b".to_string(), vec!["x y".to_string()]);
        refs
    }

    #[test]
    fn hand_computed_scores() -> Result<()> {
        // Every n-gram appears in a single item so all the weights are ln(2), item "a" gets
        // (1 + 1) for its first reference and 0.5 for the second one.
        let hyps = [pred("a", "a b"), pred("b", "x y")];
        for scorer in [&Cider::default() as &dyn Scorer, &CiderD::default()] {
            let (score, scores) = scorer.compute_score(&refs(), &hyps)?;
            assert!((scores[0] - 3.125).abs() < 1e-9, "{}", scorer.name());
            assert!((scores[1] - 5.).abs() < 1e-9, "{}", scorer.name());
            assert!((score - 4.0625).abs() < 1e-9, "{}", scorer.name());
        }
        Ok(())
    }

    #[test]
    fn ciderd_penalises_repetitions() -> Result<()> {
        let hyps = [pred("a", "a b a b a b"), pred("b", "x y")];
        let (_, cider) = Cider::default().compute_score(&refs(), &hyps)?;
        let (_, ciderd) = CiderD::default().compute_score(&refs(), &hyps)?;
        assert!(cider[0] > 0.);
        assert!(ciderd[0] < cider[0]);
        assert!((ciderd[1] - cider[1]).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn missing_references() {
        let hyps = [pred("zzz", "a b")];
        assert!(CiderD::default().compute_score(&refs(), &hyps).is_err());
        assert!(Cider::default().compute_score(&refs(), &[]).is_err());
    }
}
