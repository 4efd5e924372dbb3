use std::{
    fs, panic,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
        network::downloader::download_file_as_bytes,
    },
    prelude::*,
};
use flate2::read::GzDecoder;
use image::{imageops::FilterType, ImageReader};
use rand::{thread_rng, Rng};
use rayon::prelude::*;
use tar::Archive;

use crate::LABELS;

pub const WIDTH: usize = 32;
pub const HEIGHT: usize = 32;
pub const CHANNEL_COUNT: usize = 3;

const PADDING: usize = 4;
const RECORD_SIZE: usize = 1 + CHANNEL_COUNT * HEIGHT * WIDTH;

const BINARY_DIR: &str = "cifar-10-batches-bin";
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";
const ARCHIVE_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";

pub const MEAN: [f32; 3] = [125.3 / 255., 123.0 / 255., 113.9 / 255.];
pub const STD: [f32; 3] = [63.0 / 255., 62.1 / 255., 66.7 / 255.];

pub type Image = [[[u8; WIDTH]; HEIGHT]; CHANNEL_COUNT];

#[derive(Debug, Clone)]
pub struct Cifar10Item {
    pub image: Image,
    pub label: u8,
}

pub struct Cifar10Dataset {
    pub dataset: InMemDataset<Cifar10Item>,
}

impl Dataset<Cifar10Item> for Cifar10Dataset {
    fn get(&self, index: usize) -> Option<Cifar10Item> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl Cifar10Dataset {
    fn new(items: Vec<Cifar10Item>) -> Self {
        Self {
            dataset: InMemDataset::new(items),
        }
    }

    /// Loads the train and test splits from `data_dir`.
    ///
    /// The binary distribution is preferred, either extracted as
    /// `cifar-10-batches-bin/` or with the batch files directly in `data_dir`.
    /// Otherwise `train/<label>/` and `test/<label>/` image folders are read.
    /// When neither is present and `download` is set, the official binary
    /// archive is fetched and extracted into `data_dir` first.
    pub fn load(data_dir: &Path, download: bool) -> Result<(Self, Self)> {
        if let Some(splits) = Self::read_local(data_dir)? {
            return Ok(splits);
        }

        if download {
            match download_archive(data_dir) {
                Ok(()) => {
                    if let Some(splits) = Self::read_local(data_dir)? {
                        return Ok(splits);
                    }
                }
                Err(err) => tracing::warn!("CIFAR-10 download failed: {err:#}"),
            }
        }

        bail!(
            "no CIFAR-10 data found in {}: expected {BINARY_DIR}/ or train/ and test/ folders",
            data_dir.display()
        )
    }

    fn read_local(data_dir: &Path) -> Result<Option<(Self, Self)>> {
        if let Some(binary_dir) = find_binary_dir(data_dir) {
            tracing::info!("Reading CIFAR-10 binary batches from {}", binary_dir.display());

            let train = TRAIN_FILES
                .iter()
                .map(|name| read_binary_file(&binary_dir.join(name)))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .flatten()
                .collect();
            let test = read_binary_file(&binary_dir.join(TEST_FILE))?;

            return Ok(Some((Self::new(train), Self::new(test))));
        }

        let (train_dir, test_dir) = (data_dir.join("train"), data_dir.join("test"));
        if train_dir.is_dir() && test_dir.is_dir() {
            tracing::info!("Reading CIFAR-10 image folders from {}", data_dir.display());

            return Ok(Some((
                Self::new(read_image_folder(&train_dir)?),
                Self::new(read_image_folder(&test_dir)?),
            )));
        }

        Ok(None)
    }
}

fn download_archive(data_dir: &Path) -> Result<()> {
    tracing::info!("Downloading CIFAR-10 from {ARCHIVE_URL}");

    // The downloader panics on network and HTTP errors.
    let bytes = panic::catch_unwind(|| {
        download_file_as_bytes(ARCHIVE_URL, "cifar-10-binary.tar.gz")
    })
    .map_err(|_| anyhow!("failed to download {ARCHIVE_URL}"))?;

    extract_archive(&bytes, data_dir)
}

/// Unpacks a gzipped tarball into `data_dir`.
pub fn extract_archive(bytes: &[u8], data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    Archive::new(GzDecoder::new(bytes))
        .unpack(data_dir)
        .with_context(|| format!("failed to extract CIFAR-10 archive into {}", data_dir.display()))
}

fn find_binary_dir(data_dir: &Path) -> Option<PathBuf> {
    [data_dir.join(BINARY_DIR), data_dir.to_path_buf()]
        .into_iter()
        .find(|dir| dir.join(TEST_FILE).is_file())
}

fn read_binary_file(path: &Path) -> Result<Vec<Cifar10Item>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_records(&bytes).with_context(|| format!("malformed CIFAR-10 batch {}", path.display()))
}

/// Parses `label, R plane, G plane, B plane` records.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<Cifar10Item>> {
    ensure!(
        bytes.len() % RECORD_SIZE == 0,
        "length {} is not a multiple of the {RECORD_SIZE} byte record size",
        bytes.len()
    );

    bytes
        .par_chunks_exact(RECORD_SIZE)
        .map(|record| {
            let label = record[0];
            ensure!((label as usize) < LABELS.len(), "label {label} out of range");

            let mut image = [[[0; WIDTH]; HEIGHT]; CHANNEL_COUNT];
            for (plane, pixels) in image.iter_mut().zip(record[1..].chunks_exact(HEIGHT * WIDTH)) {
                for (row, pixels) in plane.iter_mut().zip(pixels.chunks_exact(WIDTH)) {
                    row.copy_from_slice(pixels);
                }
            }

            Ok(Cifar10Item { image, label })
        })
        .collect()
}

fn read_image_folder(dir: &Path) -> Result<Vec<Cifar10Item>> {
    let mut paths = vec![];
    for (id, name) in LABELS.iter().enumerate() {
        let label_dir = dir.join(name);
        let entries = fs::read_dir(&label_dir)
            .with_context(|| format!("failed to list {}", label_dir.display()))?;
        paths.extend(entries.flatten().map(|entry| (entry.path(), id as u8)));
    }

    let items: Vec<_> = paths
        .par_iter()
        .filter_map(|(path, label)| {
            let image_raw = match ImageReader::open(path).map(|reader| reader.decode()) {
                Ok(Ok(image_raw)) => image_raw,
                Ok(Err(err)) => {
                    tracing::warn!("Skipping undecodable {}: {err}", path.display());
                    return None;
                }
                Err(err) => {
                    tracing::warn!("Skipping unreadable {}: {err}", path.display());
                    return None;
                }
            };

            let (width, height) = (image_raw.width() as usize, image_raw.height() as usize);
            let image_raw = if width == WIDTH && height == HEIGHT {
                image_raw
            } else {
                image_raw.resize_exact(WIDTH as u32, HEIGHT as u32, FilterType::Triangle)
            };
            let image_raw = image_raw.to_rgb8();

            let mut image = [[[0; WIDTH]; HEIGHT]; CHANNEL_COUNT];

            for (i, pixel) in image_raw.pixels().enumerate() {
                let h = i / WIDTH;
                let w = i % WIDTH;
                let [r, g, b] = pixel.0;
                image[0][h][w] = r;
                image[1][h][w] = g;
                image[2][h][w] = b;
            }

            Some(Cifar10Item {
                image,
                label: *label,
            })
        })
        .collect();

    Ok(items)
}

/// Crops a `HEIGHT x WIDTH` window at offset `(dy, dx)` out of the image
/// zero-padded by `PADDING` pixels on every side, then mirrors it when `flip` is set.
pub fn crop_and_flip(image: &Image, dy: usize, dx: usize, flip: bool) -> Image {
    let mut output = [[[0; WIDTH]; HEIGHT]; CHANNEL_COUNT];

    for (plane, output_plane) in image.iter().zip(output.iter_mut()) {
        for (y, output_row) in output_plane.iter_mut().enumerate() {
            let Some(source_y) = (y + dy).checked_sub(PADDING).filter(|&y| y < HEIGHT) else {
                continue;
            };
            for x in 0..WIDTH {
                let Some(source_x) = (x + dx).checked_sub(PADDING).filter(|&x| x < WIDTH) else {
                    continue;
                };
                let target_x = if flip { WIDTH - 1 - x } else { x };
                output_row[target_x] = plane[source_y][source_x];
            }
        }
    }

    output
}

fn augment<R: Rng>(image: &Image, rng: &mut R) -> Image {
    let dy = rng.gen_range(0..=2 * PADDING);
    let dx = rng.gen_range(0..=2 * PADDING);
    crop_and_flip(image, dy, dx, rng.gen_bool(0.5))
}

#[derive(Clone, Debug)]
pub struct Cifar10Batch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct Cifar10Batcher<B: Backend> {
    device: B::Device,
    augment: bool,
}

impl<B: Backend> Cifar10Batcher<B> {
    /// Batcher for training: random crop and horizontal flip before normalization.
    pub fn train(device: B::Device) -> Self {
        Self {
            device,
            augment: true,
        }
    }

    pub fn test(device: B::Device) -> Self {
        Self {
            device,
            augment: false,
        }
    }
}

impl<B: Backend> Batcher<Cifar10Item, Cifar10Batch<B>> for Cifar10Batcher<B> {
    fn batch(&self, items: Vec<Cifar10Item>) -> Cifar10Batch<B> {
        let mean = Tensor::<B, 1>::from_floats(MEAN, &self.device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(STD, &self.device).reshape([1, 3, 1, 1]);

        let mut rng = thread_rng();
        let images = items
            .iter()
            .map(|item| {
                if self.augment {
                    augment(&item.image, &mut rng)
                } else {
                    item.image
                }
            })
            .map(|image| TensorData::from(image).convert::<B::FloatElem>())
            .map(|data| Tensor::<B, 3>::from_data(data, &self.device))
            .map(|tensor| tensor.reshape([1, CHANNEL_COUNT, HEIGHT, WIDTH]))
            .map(|tensor| tensor / 255.)
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    [(item.label as i64).elem::<B::IntElem>()],
                    &self.device,
                )
            })
            .collect();

        let images = (Tensor::cat(images, 0) - mean) / std;
        let targets = Tensor::cat(targets, 0);

        Cifar10Batch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    fn record(label: u8, fill: impl Fn(usize, usize, usize) -> u8) -> Vec<u8> {
        let mut bytes = vec![label];
        for c in 0..CHANNEL_COUNT {
            for y in 0..HEIGHT {
                for x in 0..WIDTH {
                    bytes.push(fill(c, y, x));
                }
            }
        }
        bytes
    }

    fn gradient_image() -> Image {
        let mut image = [[[0; WIDTH]; HEIGHT]; CHANNEL_COUNT];
        for (c, plane) in image.iter_mut().enumerate() {
            for (y, row) in plane.iter_mut().enumerate() {
                for (x, pixel) in row.iter_mut().enumerate() {
                    *pixel = (c * 64 + y * 2 + x / 4) as u8 + 1;
                }
            }
        }
        image
    }

    #[test]
    fn parses_planes_in_channel_row_column_order() {
        let mut bytes = record(3, |c, y, x| (c * 100 + y + x) as u8);
        bytes.extend(record(9, |_, _, _| 7));

        let items = parse_records(&bytes).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].label, 3);
        assert_eq!(items[0].image[0][0][0], 0);
        assert_eq!(items[0].image[1][2][5], 107);
        assert_eq!(items[0].image[2][31][31], (200 + 31 + 31) as u8);
        assert_eq!(items[1].label, 9);
        assert!(items[1].image.iter().flatten().flatten().all(|&p| p == 7));
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("preact-resnet-celu-{name}-{}", std::process::id()));
        fs::remove_dir_all(&dir).ok();
        dir
    }

    /// Gzipped tarball laid out like the official binary distribution, one
    /// record per batch file.
    fn binary_archive() -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);

        let files = TRAIN_FILES.iter().chain([&TEST_FILE]).enumerate();
        for (label, name) in files {
            let bytes = record(label as u8, |c, y, x| (c + y + x) as u8);
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, format!("{BINARY_DIR}/{name}"), bytes.as_slice())
                .unwrap();
        }

        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn extracted_archive_loads_as_binary_layout() {
        let dir = scratch_dir("archive");

        extract_archive(&binary_archive(), &dir).unwrap();
        let (train, test) = Cifar10Dataset::load(&dir, false).unwrap();

        assert_eq!((train.len(), test.len()), (5, 1));
        let labels: Vec<_> = (0..5).filter_map(|i| train.get(i)).map(|item| item.label).collect();
        assert_eq!(labels, vec![0, 1, 2, 3, 4]);
        assert_eq!(test.get(0).unwrap().label, 5);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn corrupt_archive_is_an_error() {
        let dir = scratch_dir("corrupt-archive");

        assert!(extract_archive(b"not a tarball", &dir).is_err());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_dataset_without_download_is_an_error() {
        let dir = scratch_dir("missing-data");
        fs::create_dir_all(&dir).unwrap();

        let err = Cifar10Dataset::load(&dir, false).err().unwrap();

        assert!(err.to_string().starts_with("no CIFAR-10 data found"));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn rejects_truncated_records() {
        let mut bytes = record(0, |_, _, _| 0);
        bytes.pop();

        assert!(parse_records(&bytes).is_err());
    }

    #[test]
    fn rejects_unknown_labels() {
        let bytes = record(10, |_, _, _| 0);

        assert!(parse_records(&bytes).is_err());
    }

    #[test]
    fn centered_crop_without_flip_is_identity() {
        let image = gradient_image();

        assert_eq!(crop_and_flip(&image, PADDING, PADDING, false), image);
    }

    #[test]
    fn corner_crop_pads_with_zeros() {
        let image = gradient_image();
        let cropped = crop_and_flip(&image, 0, 0, false);

        for plane in 0..CHANNEL_COUNT {
            assert!(cropped[plane][..PADDING].iter().flatten().all(|&p| p == 0));
            assert!(cropped[plane]
                .iter()
                .all(|row| row[..PADDING].iter().all(|&p| p == 0)));
            assert_eq!(cropped[plane][PADDING][PADDING], image[plane][0][0]);
            assert_eq!(
                cropped[plane][HEIGHT - 1][WIDTH - 1],
                image[plane][HEIGHT - 1 - PADDING][WIDTH - 1 - PADDING]
            );
        }
    }

    #[test]
    fn flip_mirrors_columns() {
        let image = gradient_image();
        let flipped = crop_and_flip(&image, PADDING, PADDING, true);

        for c in 0..CHANNEL_COUNT {
            for y in 0..HEIGHT {
                for x in 0..WIDTH {
                    assert_eq!(flipped[c][y][x], image[c][y][WIDTH - 1 - x]);
                }
            }
        }
    }

    #[test]
    fn test_batcher_normalizes_per_channel() {
        let device = Default::default();
        let mut image = [[[0; WIDTH]; HEIGHT]; CHANNEL_COUNT];
        image[1] = [[255; WIDTH]; HEIGHT];
        let items = vec![
            Cifar10Item { image, label: 2 },
            Cifar10Item { image, label: 5 },
        ];

        let batch = Cifar10Batcher::<TestBackend>::test(device).batch(items);

        assert_eq!(batch.images.dims(), [2, 3, 32, 32]);
        let targets = batch.targets.into_data().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![2, 5]);

        let images = batch.images.into_data().to_vec::<f32>().unwrap();
        let plane = HEIGHT * WIDTH;
        assert!((images[0] - (0. - MEAN[0]) / STD[0]).abs() < 1e-4);
        assert!((images[plane] - (1. - MEAN[1]) / STD[1]).abs() < 1e-4);
        assert!((images[2 * plane + 17] - (0. - MEAN[2]) / STD[2]).abs() < 1e-4);
    }

    #[test]
    fn train_batcher_keeps_shape() {
        let device = Default::default();
        let items = vec![
            Cifar10Item {
                image: gradient_image(),
                label: 0,
            };
            3
        ];

        let batch = Cifar10Batcher::<TestBackend>::train(device).batch(items);

        assert_eq!(batch.images.dims(), [3, 3, 32, 32]);
        assert_eq!(batch.targets.dims(), [3]);
    }
}
