//! Image / segmentation-mask pair loading.
//!
//! Feeds the conditional flow: each sample is an RGB image, a binary mask for
//! one object class drawn from the segmentation annotation, and the one-hot
//! class vector used as conditioning context. Directory layout:
//!
//! ```text
//! <root>/images/<split>/*.jpg
//! <root>/annotations/<split>/*.png
//! <root>/../labels.txt            ("id: name" per line)
//! ```
//!
//! Mask decoding picks one class present in the annotation uniformly at
//! random; classes with too little pixel coverage collapse to the background
//! label 0. All randomness is seeded through the config.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::GrayImage;
use ndarray::{Array1, Array2, Array3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{Error, Result};

/// Split name that gets the large sample budget.
pub const TRAIN_SPLIT: &str = "train2017";

/// How many pairs a split is truncated to after the sorted directory scan.
const TRAIN_SAMPLE_BUDGET: usize = 16 * 600;
const EVAL_SAMPLE_BUDGET: usize = 16 * 10;

/// Side length of the decoded binary mask.
pub const MASK_SIZE: u32 = 128;

/// Classes covering fewer pixels than this are treated as background.
const MIN_CLASS_PIXELS: usize = 10_000;

/// Decode an RGB image to a `(3, height, width)` array, optionally resizing.
pub fn decode_img(path: &Path, resize: Option<(u32, u32)>) -> Result<Array3<f32>> {
    let mut img = image::open(path)?;
    if let Some((width, height)) = resize {
        img = img.resize_exact(width, height, FilterType::Lanczos3);
    }
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    Ok(Array3::from_shape_fn(
        (3, h as usize, w as usize),
        |(c, y, x)| rgb.get_pixel(x as u32, y as u32).0[c] as f32,
    ))
}

/// Decode a segmentation annotation into a `(MASK_SIZE, MASK_SIZE)` binary
/// mask (values 0 or 255) and a class label.
///
/// One class id present in the annotation (and `< num_classes`) is chosen
/// uniformly at random. If it covers at least [`MIN_CLASS_PIXELS`] pixels the
/// label is `id + 1` and the mask marks its pixels; otherwise the label is 0
/// and the mask is empty.
pub fn decode_mask(
    path: &Path,
    num_classes: usize,
    rng: &mut impl Rng,
) -> Result<(Array2<f32>, usize)> {
    let seg = image::open(path)?.to_luma8();
    let (w, h) = seg.dimensions();

    let mut counts: BTreeMap<u8, usize> = BTreeMap::new();
    for p in seg.pixels() {
        let v = p.0[0];
        if (v as usize) < num_classes {
            *counts.entry(v).or_default() += 1;
        }
    }

    let mut mask = GrayImage::new(w, h);
    let mut label_id = 0usize;
    if !counts.is_empty() {
        let ids: Vec<u8> = counts.keys().copied().collect();
        let chosen = ids[rng.random_range(0..ids.len())];
        if counts[&chosen] >= MIN_CLASS_PIXELS {
            for (x, y, p) in seg.enumerate_pixels() {
                if p.0[0] == chosen {
                    mask.put_pixel(x, y, image::Luma([255u8]));
                }
            }
            label_id = chosen as usize + 1;
        }
    }

    let resized = image::imageops::resize(&mask, MASK_SIZE, MASK_SIZE, FilterType::Triangle);
    let arr = Array2::from_shape_fn((MASK_SIZE as usize, MASK_SIZE as usize), |(y, x)| {
        resized.get_pixel(x as u32, y as u32).0[0] as f32
    });
    Ok((arr, label_id))
}

fn list_sorted(dir: &Path, ext: &str, budget: usize) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(ext))
        })
        .collect();
    paths.sort();
    paths.truncate(budget);
    Ok(paths)
}

/// Sorted, budget-truncated listing of one split's image/annotation paths.
#[derive(Debug, Clone)]
pub struct PairIndex {
    pub images: Vec<PathBuf>,
    pub annotations: Vec<PathBuf>,
}

impl PairIndex {
    pub fn scan(root: &Path, split: &str) -> Result<Self> {
        let budget = if split == TRAIN_SPLIT {
            TRAIN_SAMPLE_BUDGET
        } else {
            EVAL_SAMPLE_BUDGET
        };
        let images = list_sorted(&root.join("images").join(split), "jpg", budget)?;
        let annotations = list_sorted(&root.join("annotations").join(split), "png", budget)?;
        tracing::info!(
            split,
            images = images.len(),
            annotations = annotations.len(),
            "scanned segmentation pairs"
        );
        Ok(Self {
            images,
            annotations,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len().min(self.annotations.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_label_map(path: &Path, num_classes: usize) -> Result<BTreeMap<usize, String>> {
    let text = fs::read_to_string(path)?;
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, name) = line
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("malformed label line {line:?}")))?;
        let id: usize = id
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid label id in line {line:?}")))?;
        if id > num_classes {
            continue;
        }
        map.insert(id, name.trim().to_string());
    }
    Ok(map)
}

/// Construction parameters for [`SegmentationPairs`].
#[derive(Debug, Clone)]
pub struct SegmentationPairsConfig {
    pub root: PathBuf,
    pub split: String,
    /// Image resize target.
    pub width: u32,
    pub height: u32,
    pub num_classes: usize,
    /// Seed for the per-sample class choice.
    pub seed: u64,
}

impl Default for SegmentationPairsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            split: TRAIN_SPLIT.to_string(),
            width: 320,
            height: 576,
            num_classes: 80,
            seed: 0,
        }
    }
}

/// One decoded training sample.
#[derive(Debug, Clone)]
pub struct SegmentationSample {
    /// `(3, height, width)` image.
    pub image: Array3<f32>,
    /// `(MASK_SIZE, MASK_SIZE)` binary mask.
    pub mask: Array2<f32>,
    /// One-hot class vector, `class_size` wide.
    pub one_hot: Array1<f32>,
    pub label_id: usize,
    pub label: String,
}

/// Image / segmentation pair dataset with a label map and seeded decoding.
#[derive(Debug)]
pub struct SegmentationPairs {
    cfg: SegmentationPairsConfig,
    index: PairIndex,
    labelmap: BTreeMap<usize, String>,
    rng: ChaCha8Rng,
}

impl SegmentationPairs {
    pub fn open(cfg: SegmentationPairsConfig) -> Result<Self> {
        let labelmap = parse_label_map(&cfg.root.join("..").join("labels.txt"), cfg.num_classes)?;
        let index = PairIndex::scan(&cfg.root, &cfg.split)?;
        tracing::info!(classes = labelmap.len(), "loaded label map");
        let rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        Ok(Self {
            cfg,
            index,
            labelmap,
            rng,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of classes in the label map; the one-hot width.
    pub fn class_size(&self) -> usize {
        self.labelmap.len()
    }

    /// Decode the `idx`-th pair. The class choice inside the mask decode
    /// advances this dataset's RNG.
    pub fn get(&mut self, idx: usize) -> Result<SegmentationSample> {
        if idx >= self.len() {
            return Err(Error::Domain("sample index out of range"));
        }
        let image = decode_img(
            &self.index.images[idx],
            Some((self.cfg.width, self.cfg.height)),
        )?;
        let (mask, label_id) = decode_mask(
            &self.index.annotations[idx],
            self.cfg.num_classes,
            &mut self.rng,
        )?;
        let label = self
            .labelmap
            .get(&label_id)
            .cloned()
            .ok_or(Error::Domain("class label missing from label map"))?;

        let class_size = self.labelmap.len();
        if label_id >= class_size {
            return Err(Error::Domain("class label outside one-hot range"));
        }
        let mut one_hot = Array1::<f32>::zeros(class_size);
        one_hot[label_id] = 1.0;

        Ok(SegmentationSample {
            image,
            mask,
            one_hot,
            label_id,
            label,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cnflow-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn label_map_skips_out_of_range_ids() {
        let dir = scratch("labels");
        let path = dir.join("labels.txt");
        fs::write(&path, "0: unlabeled\n1: person\n2: bicycle\n95: toy\n").unwrap();
        let map = parse_label_map(&path, 2).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map[&1], "person");
        assert!(!map.contains_key(&95));
        fs::write(&path, "not a label line\n").unwrap();
        assert!(parse_label_map(&path, 2).is_err());
    }

    #[test]
    fn mask_decoding_thresholds_small_classes() {
        let dir = scratch("masks");
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        // Class 3 covers 120x150 = 18000 pixels: above threshold.
        let mut big = GrayImage::new(200, 150);
        for y in 0..150 {
            for x in 0..120 {
                big.put_pixel(x, y, image::Luma([3u8]));
            }
        }
        // Fill the rest with an id outside num_classes so only 3 is eligible.
        for y in 0..150 {
            for x in 120..200 {
                big.put_pixel(x, y, image::Luma([200u8]));
            }
        }
        let big_path = dir.join("big.png");
        big.save(&big_path).unwrap();
        let (mask, label) = decode_mask(&big_path, 80, &mut rng).unwrap();
        assert_eq!(label, 4);
        assert_eq!(mask.dim(), (MASK_SIZE as usize, MASK_SIZE as usize));
        assert!(mask.iter().any(|&v| v > 0.0));

        // Class 5 covers only 16 pixels: background.
        let mut small = GrayImage::from_pixel(200, 150, image::Luma([200u8]));
        for y in 0..4 {
            for x in 0..4 {
                small.put_pixel(x, y, image::Luma([5u8]));
            }
        }
        let small_path = dir.join("small.png");
        small.save(&small_path).unwrap();
        let (mask, label) = decode_mask(&small_path, 80, &mut rng).unwrap();
        assert_eq!(label, 0);
        assert!(mask.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn pairs_decode_end_to_end() {
        let base = scratch("pairs");
        let root = base.join("dataset");
        let split = "val2017";
        fs::create_dir_all(root.join("images").join(split)).unwrap();
        fs::create_dir_all(root.join("annotations").join(split)).unwrap();
        fs::write(base.join("labels.txt"), "0: unlabeled\n1: person\n2: cat\n").unwrap();

        for stem in ["a", "b"] {
            let img = RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
            img.save(root.join("images").join(split).join(format!("{stem}.jpg")))
                .unwrap();
            // Class 1 everywhere; 8x8 is far below the coverage threshold, so
            // these decode to background.
            let seg = GrayImage::from_pixel(8, 8, image::Luma([1u8]));
            seg.save(
                root.join("annotations")
                    .join(split)
                    .join(format!("{stem}.png")),
            )
            .unwrap();
        }

        let mut ds = SegmentationPairs::open(SegmentationPairsConfig {
            root,
            split: split.to_string(),
            width: 16,
            height: 12,
            num_classes: 2,
            seed: 7,
        })
        .unwrap();

        assert_eq!(ds.len(), 2);
        assert_eq!(ds.class_size(), 3);
        let sample = ds.get(0).unwrap();
        assert_eq!(sample.image.dim(), (3, 12, 16));
        assert_eq!(sample.mask.dim(), (128, 128));
        assert_eq!(sample.one_hot.len(), 3);
        assert_eq!(sample.label_id, 0);
        assert_eq!(sample.label, "unlabeled");
        assert_eq!(sample.one_hot[0], 1.0);
        assert!(ds.get(5).is_err());
    }
}
