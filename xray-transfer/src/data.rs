use std::collections::HashMap;
use std::fs::read_dir;
use std::path::{ Path, PathBuf };

use image::imageops::FilterType;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use tch::{ Device, Kind, Tensor };
use tracing::warn;

use crate::error::{ Error, Result };

const VALID_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Image tree with one sub-directory per class. Class indices follow the
/// sorted directory names so train and validation splits agree.
pub struct Dataset {
    entries: Vec<(i64, PathBuf)>,
    class_to_idx: HashMap<String, i64>,
}

impl Dataset {
    /// Walk the root folder and gather images and classes.
    pub fn new<T: AsRef<Path>>(root: T) -> Result<Dataset> {
        let root = root.as_ref().to_path_buf();

        let mut class_dirs: Vec<PathBuf> = read_dir(&root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        class_dirs.sort();

        if class_dirs.is_empty() {
            return Err(Error::dataset(&root, "no class directories"));
        }

        let mut entries: Vec<(i64, PathBuf)> = Vec::new();
        let mut class_to_idx: HashMap<String, i64> = HashMap::new();

        for (class_idx, class_dir) in class_dirs.iter().enumerate() {
            let class_name = class_dir
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| Error::dataset(class_dir, "unreadable class name"))?;
            class_to_idx.insert(class_name.to_string(), class_idx as i64);

            for file in read_dir(class_dir)? {
                let path = file?.path();
                let ext = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.to_lowercase());
                if path.is_file() && ext.is_some_and(|ext| VALID_EXTENSIONS.contains(&ext.as_str())) {
                    entries.push((class_idx as i64, path));
                }
            }
        }

        if entries.is_empty() {
            return Err(Error::dataset(&root, "no images found"));
        }

        Ok(Dataset { entries, class_to_idx })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_classes(&self) -> i64 {
        self.class_to_idx.len() as i64
    }

    /// (class name, encoded index) pairs, index-ordered.
    pub fn classes(&self) -> Vec<(String, String)> {
        let mut classes: Vec<(String, i64)> = self.class_to_idx
            .iter()
            .map(|(name, idx)| (name.clone(), *idx))
            .collect();
        classes.sort_by_key(|(_, idx)| *idx);
        classes
            .into_iter()
            .map(|(name, idx)| (name, idx.to_string()))
            .collect()
    }

}

/// Load one image as a normalized float tensor of shape `[3, H, W]`.
pub fn load_image(path: &Path, resolution: (i64, i64), augment: bool) -> Result<Tensor> {
    let (height, width) = resolution;
    let mut img = image::open(path)?;
    if augment && rand::thread_rng().gen_bool(0.5) {
        img = img.fliph();
    }
    let img = img.resize_exact(width as u32, height as u32, FilterType::Triangle);
    let raw = img.to_rgb8().into_raw();

    let tensor =
        Tensor::from_data_size(&raw, &[height, width, 3], Kind::Uint8)
            .permute([2, 0, 1])
            .to_kind(Kind::Float) / 255.0;
    Ok(normalize(tensor))
}

fn normalize(image: Tensor) -> Tensor {
    let mean = Tensor::from_slice(&IMAGENET_MEAN).view([3, 1, 1]);
    let std = Tensor::from_slice(&IMAGENET_STD).view([3, 1, 1]);
    (image - mean) / std
}

/// Batching iterator over a `Dataset`. Yields `(images, labels)` pairs,
/// reshuffles at each rewind when asked to, and skips unreadable files with
/// a warning rather than killing a long run.
pub struct Loader {
    dataset: Dataset,
    batch_size: i64,
    device: Device,
    shuffle: bool,
    augment: bool,
    resolution: (i64, i64),
    order: Vec<usize>,
    cursor: usize,
}

impl Loader {
    pub fn new(
        dataset: Dataset,
        batch_size: i64,
        device: Device,
        shuffle: bool,
        augment: bool,
        resolution: (i64, i64)
    ) -> Loader {
        let order: Vec<usize> = (0..dataset.len()).collect();
        Loader { dataset, batch_size, device, shuffle, augment, resolution, order, cursor: 0 }
    }

    /// Total number of images in the dataset.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Number of batches per full pass.
    pub fn len_batch(&self) -> usize {
        let batch = self.batch_size as usize;
        (self.dataset.len() + batch - 1) / batch
    }

    pub fn classes(&self) -> Vec<(String, String)> {
        self.dataset.classes()
    }

    pub fn num_classes(&self) -> i64 {
        self.dataset.num_classes()
    }
}

impl Iterator for Loader {
    type Item = (Tensor, Tensor);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cursor >= self.order.len() {
                // rewind for the next epoch
                self.cursor = 0;
                return None;
            }
            if self.cursor == 0 && self.shuffle {
                self.order.shuffle(&mut rand::thread_rng());
            }

            let start = self.cursor;
            let end = (start + (self.batch_size as usize)).min(self.order.len());
            self.cursor = end;

            let loaded: Vec<(Tensor, i64)> = self.order[start..end]
                .par_iter()
                .filter_map(|&idx| {
                    let (label, path) = &self.dataset.entries[idx];
                    match load_image(path, self.resolution, self.augment) {
                        Ok(image) => Some((image, *label)),
                        Err(err) => {
                            warn!("skipping {}: {err}", path.display());
                            None
                        }
                    }
                })
                .collect();

            if loaded.is_empty() {
                continue;
            }

            let images: Vec<Tensor> = loaded
                .iter()
                .map(|(image, _)| image.shallow_clone())
                .collect();
            let labels: Vec<i64> = loaded
                .iter()
                .map(|(_, label)| *label)
                .collect();

            let images = Tensor::stack(&images, 0).to_device(self.device);
            let labels = Tensor::from_slice(&labels).to_kind(Kind::Int64).to_device(self.device);
            return Some((images, labels));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_png(path: &Path, value: u8) {
        let image = image::RgbImage::from_pixel(32, 32, image::Rgb([value, value, value]));
        image.save(path).unwrap();
    }

    fn fixture(root: &Path) -> Dataset {
        for (class, count) in [("effusion", 3), ("normal", 2)] {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..count {
                write_png(&dir.join(format!("{i}.png")), (i * 40) as u8);
            }
        }
        Dataset::new(root).unwrap()
    }

    #[test]
    fn test_dataset_walks_classes() {
        let root = std::env::temp_dir().join("xray_transfer_dataset_test");
        let _ = fs::remove_dir_all(&root);
        let dataset = fixture(&root);

        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.num_classes(), 2);
        // sorted directory names decide the encoding
        assert_eq!(dataset.classes()[0].0, "effusion");
        assert_eq!(dataset.classes()[1], ("normal".to_string(), "1".to_string()));
    }

    #[test]
    fn test_dataset_missing_root() {
        let missing = std::env::temp_dir().join("xray_transfer_does_not_exist");
        assert!(Dataset::new(&missing).is_err());
    }

    #[test]
    fn test_loader_batches_and_rewinds() {
        let root = std::env::temp_dir().join("xray_transfer_loader_test");
        let _ = fs::remove_dir_all(&root);
        let dataset = fixture(&root);

        let mut loader = Loader::new(dataset, 2, Device::Cpu, false, false, (32, 32));
        assert_eq!(loader.len(), 5);
        assert_eq!(loader.len_batch(), 3);

        let batches: Vec<_> = loader.by_ref().collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].0.size(), vec![2, 3, 32, 32]);
        assert_eq!(batches[2].0.size(), vec![1, 3, 32, 32]);

        // the loader rewinds after a full pass
        let second_pass: Vec<_> = loader.by_ref().collect();
        assert_eq!(second_pass.len(), 3);
    }

    #[test]
    fn test_load_image_shape() {
        let root = std::env::temp_dir().join("xray_transfer_image_test");
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        let path = root.join("sample.png");
        write_png(&path, 128);

        let tensor = load_image(&path, (64, 64), false).unwrap();
        assert_eq!(tensor.size(), vec![3, 64, 64]);
        assert_eq!(tensor.kind(), Kind::Float);
    }
}
