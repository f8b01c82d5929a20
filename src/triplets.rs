//! Anchor / positive / negative sampling over a class-per-directory
//! dataset, augmentation, and triplet-loss evaluation of an embedding.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ndarray::Axis;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Serialize;

use crate::corpus::image_paths;
use crate::error::{Error, Result};
use crate::preprocess::ImageTensor;
use crate::vector::squared_euclidean;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triplet {
    pub anchor: PathBuf,
    pub positive: PathBuf,
    pub negative: PathBuf,
}

/// Infinite stream of triplets. Anchor and positive share a class, the
/// negative comes from another one.
pub struct TripletGenerator {
    classes: Vec<(String, Vec<PathBuf>)>,
    /// Indices into `classes` with at least two images.
    anchor_classes: Vec<usize>,
    rng: StdRng,
}

impl TripletGenerator {
    pub fn from_dir(root: &Path, seed: u64) -> Result<Self> {
        let mut classes = BTreeMap::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let images = image_paths(&path)?;
            if images.is_empty() {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            classes.insert(name, images);
        }
        Self::from_classes(classes.into_iter().collect(), seed)
    }

    pub fn from_classes(classes: Vec<(String, Vec<PathBuf>)>, seed: u64) -> Result<Self> {
        let classes: Vec<_> = classes.into_iter().filter(|(_, v)| !v.is_empty()).collect();
        if classes.len() < 2 {
            return Err(Error::Dataset(format!(
                "need at least two classes, found {}",
                classes.len()
            )));
        }
        let anchor_classes: Vec<usize> = classes
            .iter()
            .enumerate()
            .filter(|(_, (_, v))| v.len() >= 2)
            .map(|(i, _)| i)
            .collect();
        if anchor_classes.is_empty() {
            return Err(Error::Dataset(
                "no class has two images to form an anchor/positive pair".into(),
            ));
        }
        tracing::info!(
            "triplet dataset: {} classes, {} usable as anchors",
            classes.len(),
            anchor_classes.len()
        );
        Ok(Self {
            classes,
            anchor_classes,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|(n, _)| n.as_str())
    }

    /// Class name of an image path known to the generator.
    pub fn class_of(&self, path: &Path) -> Option<&str> {
        self.classes
            .iter()
            .find(|(_, v)| v.iter().any(|p| p == path))
            .map(|(n, _)| n.as_str())
    }

    pub fn next_triplet(&mut self) -> Triplet {
        let anchor_class = self.anchor_classes[self.rng.gen_range(0..self.anchor_classes.len())];
        let images = &self.classes[anchor_class].1;
        let a = self.rng.gen_range(0..images.len());
        let mut p = self.rng.gen_range(0..images.len() - 1);
        if p >= a {
            p += 1;
        }
        let (anchor, positive) = (images[a].clone(), images[p].clone());

        let mut negative_class = self.rng.gen_range(0..self.classes.len() - 1);
        if negative_class >= anchor_class {
            negative_class += 1;
        }
        let negatives = &self.classes[negative_class].1;
        let negative = negatives[self.rng.gen_range(0..negatives.len())].clone();

        Triplet {
            anchor,
            positive,
            negative,
        }
    }
}

impl Iterator for TripletGenerator {
    type Item = Triplet;

    fn next(&mut self) -> Option<Triplet> {
        Some(self.next_triplet())
    }
}

/// Random horizontal flip plus brightness jitter.
pub struct Augmenter {
    rng: StdRng,
    flip_probability: f64,
    max_brightness_delta: f32,
}

impl Augmenter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            flip_probability: 0.5,
            max_brightness_delta: 0.1,
        }
    }

    pub fn with_flip_probability(mut self, p: f64) -> Self {
        self.flip_probability = p.clamp(0.0, 1.0);
        self
    }

    pub fn with_brightness(mut self, delta: f32) -> Self {
        self.max_brightness_delta = delta.abs();
        self
    }

    pub fn apply(&mut self, image: &mut ImageTensor) {
        if self.rng.gen_bool(self.flip_probability) {
            image.invert_axis(Axis(1));
        }
        if self.max_brightness_delta > 0.0 {
            let d = self.max_brightness_delta;
            let delta = self.rng.gen_range(-d..=d);
            image.mapv_inplace(|x| (x + delta).clamp(0.0, 1.0));
        }
    }
}

/// `max(‖a−p‖² − ‖a−n‖² + margin, 0)`
pub fn triplet_loss(anchor: &[f32], positive: &[f32], negative: &[f32], margin: f32) -> f32 {
    let ap = squared_euclidean(anchor, positive);
    let an = squared_euclidean(anchor, negative);
    (ap - an + margin).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TripletReport {
    pub count: usize,
    pub mean_loss: f32,
    /// Share of triplets where the positive is strictly closer than the
    /// negative.
    pub accuracy: f32,
}

/// Embed each triplet with `embed` and score it.
pub fn evaluate_triplets<F, I>(mut embed: F, triplets: I, margin: f32) -> Result<TripletReport>
where
    F: FnMut(&Path) -> Result<Vec<f32>>,
    I: IntoIterator<Item = Triplet>,
{
    let mut count = 0usize;
    let mut loss_sum = 0f64;
    let mut correct = 0usize;
    for t in triplets {
        let a = embed(&t.anchor)?;
        let p = embed(&t.positive)?;
        let n = embed(&t.negative)?;
        loss_sum += triplet_loss(&a, &p, &n, margin) as f64;
        if squared_euclidean(&a, &p) < squared_euclidean(&a, &n) {
            correct += 1;
        }
        count += 1;
    }
    if count == 0 {
        return Err(Error::Dataset("no triplets to evaluate".into()));
    }
    Ok(TripletReport {
        count,
        mean_loss: (loss_sum / count as f64) as f32,
        accuracy: correct as f32 / count as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn classes() -> Vec<(String, Vec<PathBuf>)> {
        vec![
            ("cat".into(), vec!["cat/1.jpg".into(), "cat/2.jpg".into(), "cat/3.jpg".into()]),
            ("dog".into(), vec!["dog/1.jpg".into()]),
            ("owl".into(), vec!["owl/1.jpg".into(), "owl/2.jpg".into()]),
        ]
    }

    #[test]
    fn triplets_respect_classes() {
        let mut g = TripletGenerator::from_classes(classes(), 11).unwrap();
        for t in g.by_ref().take(200) {
            let ca = t.anchor.parent().unwrap().to_path_buf();
            assert_eq!(t.positive.parent().unwrap(), ca);
            assert_ne!(t.anchor, t.positive);
            assert_ne!(t.negative.parent().unwrap(), ca);
            // a single-image class never anchors
            assert_ne!(ca, PathBuf::from("dog"));
        }
    }

    #[test]
    fn seeded_generators_agree() {
        let a: Vec<_> = TripletGenerator::from_classes(classes(), 5).unwrap().take(20).collect();
        let b: Vec<_> = TripletGenerator::from_classes(classes(), 5).unwrap().take(20).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn needs_two_classes_and_a_pair() {
        let one: Vec<(String, Vec<PathBuf>)> = vec![("cat".into(), vec!["a.jpg".into(), "b.jpg".into()])];
        assert!(TripletGenerator::from_classes(one, 0).is_err());
        let singles: Vec<(String, Vec<PathBuf>)> = vec![
            ("cat".into(), vec!["a.jpg".into()]),
            ("dog".into(), vec!["b.jpg".into()]),
        ];
        assert!(TripletGenerator::from_classes(singles, 0).is_err());
    }

    #[test]
    fn class_lookup() {
        let g = TripletGenerator::from_classes(classes(), 0).unwrap();
        assert_eq!(g.class_of(Path::new("owl/2.jpg")), Some("owl"));
        assert_eq!(g.class_of(Path::new("fox/1.jpg")), None);
        assert_eq!(g.class_names().collect::<Vec<_>>(), vec!["cat", "dog", "owl"]);
    }

    #[test]
    fn loss_is_zero_past_margin() {
        let a = [0.0, 0.0];
        assert_eq!(triplet_loss(&a, &[0.1, 0.0], &[2.0, 0.0], 0.5), 0.0);
        let l = triplet_loss(&a, &[1.0, 0.0], &[1.0, 0.0], 0.5);
        assert!((l - 0.5).abs() < 1e-6);
    }

    #[test]
    fn evaluation_counts_ordered_triplets() {
        let lookup = |p: &Path| -> Result<Vec<f32>> {
            Ok(match p.to_str().unwrap() {
                "a" => vec![0.0, 0.0],
                "near" => vec![0.1, 0.0],
                "far" => vec![3.0, 0.0],
                _ => vec![1.0, 1.0],
            })
        };
        let t = |a: &str, p: &str, n: &str| Triplet {
            anchor: a.into(),
            positive: p.into(),
            negative: n.into(),
        };
        let report =
            evaluate_triplets(lookup, vec![t("a", "near", "far"), t("a", "far", "near")], 0.2)
                .unwrap();
        assert_eq!(report.count, 2);
        assert!((report.accuracy - 0.5).abs() < 1e-6);
        // second triplet: 9 - 0.01 + 0.2
        assert!((report.mean_loss - 9.19 / 2.0).abs() < 1e-4);
    }

    #[test]
    fn augmenter_flips_and_clamps() {
        let mut img = Array3::from_shape_fn((2, 3, 3), |(_, x, _)| x as f32 * 0.5);
        let mut aug = Augmenter::new(1).with_flip_probability(1.0).with_brightness(0.0);
        aug.apply(&mut img);
        assert_eq!(img[[0, 0, 0]], 1.0);
        assert_eq!(img[[0, 2, 0]], 0.0);

        let mut bright = Array3::from_elem((2, 2, 3), 0.98f32);
        Augmenter::new(3)
            .with_flip_probability(0.0)
            .with_brightness(0.5)
            .apply(&mut bright);
        assert!(bright.iter().all(|&x| (0.0..=1.0).contains(&x)));
    }
}
