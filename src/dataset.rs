//! MNIST fetch, decode, and batch iteration.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use flate2::read::GzDecoder;
use rand::{seq::SliceRandom, SeedableRng};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download failed for {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("gzip decode error at {path}: {source}")]
    Gzip {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("idx parse error at {path}: {msg}")]
    Format { path: PathBuf, msg: String },
}

pub const MNIST_IMAGE_ROWS: usize = 28;
pub const MNIST_IMAGE_COLS: usize = 28;
pub const MNIST_CLASSES: usize = 10;

const DEFAULT_MIRROR: &str = "https://ossci-datasets.s3.amazonaws.com/mnist";

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// SHA256 of the published `.gz` archives, checked after download.
fn gz_checksum(name: &str) -> Option<&'static str> {
    match name {
        TRAIN_IMAGES => Some("440fcabf73cc546fa21475e81ea370265605f56be210a4024d2ca8f203523609"),
        TRAIN_LABELS => Some("3552534a0a558bbed6aed32b30c495cca23d567ec52cac8be1a0730e8010255c"),
        TEST_IMAGES => Some("8d422c7b0a1c1c79245a5bcf07fe86e33eeafee792b84584aec276f5a2dbc4e6"),
        TEST_LABELS => Some("f7ae60f92e00ec6debd23a6088c31dbd2371eca3ffa0defaefb259924204aec6"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MnistUsage {
    Training,
    Test,
}

impl MnistUsage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MnistUsage::Training => "train",
            MnistUsage::Test => "test",
        }
    }

    fn images_file(&self) -> &'static str {
        match self {
            MnistUsage::Training => TRAIN_IMAGES,
            MnistUsage::Test => TEST_IMAGES,
        }
    }

    fn labels_file(&self) -> &'static str {
        match self {
            MnistUsage::Training => TRAIN_LABELS,
            MnistUsage::Test => TEST_LABELS,
        }
    }
}

/// Where MNIST lives on disk and which mirror to pull missing files from.
#[derive(Debug, Clone)]
pub struct MnistSource {
    pub data_dir: PathBuf,
    pub mirror: String,
}

impl MnistSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            mirror: Self::mirror_from_env(),
        }
    }

    pub fn mirror_from_env() -> String {
        if let Ok(val) = std::env::var("MNIST_MIRROR") {
            if !val.trim().is_empty() {
                return val.trim_end_matches('/').to_string();
            }
        }
        DEFAULT_MIRROR.to_string()
    }

    /// One-time preparation for a split: fetch/decode whatever is missing,
    /// then parse the idx pair into memory.
    pub fn prepare(&self, usage: MnistUsage) -> DatasetResult<MnistData> {
        let images_path = self.ensure_raw(usage.images_file())?;
        let labels_path = self.ensure_raw(usage.labels_file())?;
        let (images, count, rows, cols) = parse_idx_images(&images_path)?;
        let labels = parse_idx_labels(&labels_path)?;
        if labels.len() != count {
            return Err(DatasetError::Format {
                path: labels_path,
                msg: format!("{count} images but {} labels", labels.len()),
            });
        }
        eprintln!(
            "[mnist] {} ready: {count} samples ({rows}x{cols})",
            usage.as_str()
        );
        Ok(MnistData {
            images,
            labels,
            rows,
            cols,
        })
    }

    /// Produce the decoded idx file, downloading and gunzipping as needed.
    /// Cached files are trusted; only fresh downloads are checksummed.
    fn ensure_raw(&self, name: &str) -> DatasetResult<PathBuf> {
        let raw = self.data_dir.join(name);
        if raw.exists() {
            return Ok(raw);
        }
        let gz = self.data_dir.join(format!("{name}.gz"));
        if !gz.exists() {
            self.download(name, &gz)?;
        }
        let gz_bytes = fs::read(&gz).map_err(|e| DatasetError::Io {
            path: gz.clone(),
            source: e,
        })?;
        let mut decoder = GzDecoder::new(gz_bytes.as_slice());
        let mut raw_bytes = Vec::new();
        decoder
            .read_to_end(&mut raw_bytes)
            .map_err(|e| DatasetError::Gzip {
                path: gz.clone(),
                source: e,
            })?;
        fs::write(&raw, &raw_bytes).map_err(|e| DatasetError::Io {
            path: raw.clone(),
            source: e,
        })?;
        eprintln!("[mnist] decoded {}", raw.display());
        Ok(raw)
    }

    fn download(&self, name: &str, gz: &Path) -> DatasetResult<()> {
        fs::create_dir_all(&self.data_dir).map_err(|e| DatasetError::Io {
            path: self.data_dir.clone(),
            source: e,
        })?;
        let url = format!("{}/{name}.gz", self.mirror);
        eprintln!("[mnist] downloading {url}");
        let mut resp = reqwest::blocking::get(&url)
            .and_then(|r| r.error_for_status())
            .map_err(|source| DatasetError::Download {
                url: url.clone(),
                source,
            })?;
        let total = resp.content_length();
        let mut bytes: Vec<u8> = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        let mut last_logged = 0usize;
        loop {
            let n = resp.read(&mut buf).map_err(|e| DatasetError::Io {
                path: gz.to_path_buf(),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&buf[..n]);
            if bytes.len() - last_logged >= 1 << 20 {
                match total {
                    Some(t) if t > 0 => eprintln!(
                        "[mnist] {name}.gz {:.0}% ({} / {t} bytes)",
                        bytes.len() as f64 / t as f64 * 100.0,
                        bytes.len()
                    ),
                    _ => eprintln!("[mnist] {name}.gz {} bytes", bytes.len()),
                }
                last_logged = bytes.len();
            }
        }
        if let Some(expected) = gz_checksum(name) {
            use sha2::Digest;
            let actual = format!("{:x}", sha2::Sha256::digest(&bytes));
            if actual != expected {
                return Err(DatasetError::Checksum {
                    path: gz.to_path_buf(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        fs::write(gz, &bytes).map_err(|e| DatasetError::Io {
            path: gz.to_path_buf(),
            source: e,
        })?;
        eprintln!("[mnist] saved {} ({} bytes)", gz.display(), bytes.len());
        Ok(())
    }
}

fn read_be_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let chunk: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(chunk))
}

fn parse_idx_images(path: &Path) -> DatasetResult<(Vec<f32>, usize, usize, usize)> {
    let bytes = fs::read(path).map_err(|e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let format_err = |msg: String| DatasetError::Format {
        path: path.to_path_buf(),
        msg,
    };
    let magic = read_be_u32(&bytes, 0).ok_or_else(|| format_err("truncated header".into()))?;
    if magic != IMAGES_MAGIC {
        return Err(format_err(format!(
            "bad magic {magic}, expected {IMAGES_MAGIC}"
        )));
    }
    let count = read_be_u32(&bytes, 4).ok_or_else(|| format_err("truncated header".into()))? as usize;
    let rows = read_be_u32(&bytes, 8).ok_or_else(|| format_err("truncated header".into()))? as usize;
    let cols = read_be_u32(&bytes, 12).ok_or_else(|| format_err("truncated header".into()))? as usize;
    // Header fields are untrusted; the product can overflow on crafted files.
    let expected_len = count
        .checked_mul(rows)
        .and_then(|v| v.checked_mul(cols))
        .and_then(|v| v.checked_add(16))
        .ok_or_else(|| format_err(format!("header dims {count}x{rows}x{cols} overflow")))?;
    if bytes.len() != expected_len {
        return Err(format_err(format!(
            "{} bytes on disk, header implies {expected_len}",
            bytes.len()
        )));
    }
    let images = bytes[16..].iter().map(|&b| b as f32 / 255.0).collect();
    Ok((images, count, rows, cols))
}

fn parse_idx_labels(path: &Path) -> DatasetResult<Vec<i64>> {
    let bytes = fs::read(path).map_err(|e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let format_err = |msg: String| DatasetError::Format {
        path: path.to_path_buf(),
        msg,
    };
    let magic = read_be_u32(&bytes, 0).ok_or_else(|| format_err("truncated header".into()))?;
    if magic != LABELS_MAGIC {
        return Err(format_err(format!(
            "bad magic {magic}, expected {LABELS_MAGIC}"
        )));
    }
    let count = read_be_u32(&bytes, 4).ok_or_else(|| format_err("truncated header".into()))? as usize;
    let expected_len = count
        .checked_add(8)
        .ok_or_else(|| format_err(format!("header count {count} overflows")))?;
    if bytes.len() != expected_len {
        return Err(format_err(format!(
            "{} bytes on disk, header implies {expected_len}",
            bytes.len()
        )));
    }
    if let Some(&bad) = bytes[8..].iter().find(|&&b| b as usize >= MNIST_CLASSES) {
        return Err(format_err(format!(
            "label {bad} outside 0..{MNIST_CLASSES}"
        )));
    }
    Ok(bytes[8..].iter().map(|&b| b as i64).collect())
}

/// Decoded split held fully in memory.
#[derive(Debug, Clone)]
pub struct MnistData {
    /// Pixels in [sample, row, col] order, normalized to [0, 1].
    pub images: Vec<f32>,
    pub labels: Vec<i64>,
    pub rows: usize,
    pub cols: usize,
}

impl MnistData {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: Option<u64>,
    pub drop_last: bool,
    /// Cap on the number of samples visited per full iteration.
    pub limit: Option<usize>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            seed: None,
            drop_last: true,
            limit: None,
        }
    }
}

/// A split plus its iteration policy. Iteration order is fixed per `iter`
/// call; the underlying data is never mutated.
pub struct MnistDataset {
    data: MnistData,
    cfg: DatasetConfig,
}

impl MnistDataset {
    pub fn new(data: MnistData, cfg: DatasetConfig) -> Self {
        Self { data, cfg }
    }

    /// Samples visible to iteration, after the limit clamp.
    pub fn len(&self) -> usize {
        match self.cfg.limit {
            Some(limit) => limit.min(self.data.len()),
            None => self.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_count(&self) -> usize {
        if self.cfg.batch_size == 0 {
            return 0;
        }
        if self.cfg.drop_last {
            self.len() / self.cfg.batch_size
        } else {
            self.len().div_ceil(self.cfg.batch_size)
        }
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.cfg
    }

    pub fn iter(&self) -> BatchIter<'_> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if self.cfg.shuffle {
            let mut rng = match self.cfg.seed {
                Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
                None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
            };
            order.shuffle(&mut rng);
        }
        BatchIter {
            data: &self.data,
            order,
            cursor: 0,
            batch_size: self.cfg.batch_size,
            drop_last: self.cfg.drop_last,
            images_buf: Vec::new(),
            labels_buf: Vec::new(),
        }
    }
}

pub fn load_dataset(
    usage: MnistUsage,
    source: &MnistSource,
    cfg: DatasetConfig,
) -> DatasetResult<MnistDataset> {
    let data = source.prepare(usage)?;
    Ok(MnistDataset::new(data, cfg))
}

pub struct MnistBatch<B: Backend> {
    /// Images as (batch, height, width).
    pub images: Tensor<B, 3>,
    pub targets: Tensor<B, 1, Int>,
}

pub struct BatchIter<'a> {
    data: &'a MnistData,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    drop_last: bool,
    images_buf: Vec<f32>,
    labels_buf: Vec<i64>,
}

impl BatchIter<'_> {
    pub fn next_batch<B: Backend>(&mut self, device: &B::Device) -> Option<MnistBatch<B>> {
        if self.batch_size == 0 || self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        if self.drop_last && end - self.cursor < self.batch_size {
            self.cursor = self.order.len();
            return None;
        }
        let start = self.cursor;
        self.cursor = end;

        self.images_buf.clear();
        self.labels_buf.clear();
        let px = self.data.rows * self.data.cols;
        for &i in &self.order[start..end] {
            self.images_buf
                .extend_from_slice(&self.data.images[i * px..(i + 1) * px]);
            self.labels_buf.push(self.data.labels[i]);
        }

        let batch_len = end - start;
        let images = Tensor::<B, 1>::from_floats(self.images_buf.as_slice(), device).reshape([
            batch_len,
            self.data.rows,
            self.data.cols,
        ]);
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(self.labels_buf.clone(), [batch_len]),
            device,
        );
        Some(MnistBatch { images, targets })
    }
}
