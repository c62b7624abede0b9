//! Data loader

use std::collections::HashSet;

use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

use crate::tensor::{Tensor, TensorError};

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error(
        "All input vectors must have the same dimension. Received different sizes: {input_dims:?}"
    )]
    InputDimensionMismatch { input_dims: HashSet<usize> },
    #[error("Labels must have the same length as the data")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Batch size must be at least 1")]
    ZeroBatchSize,
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// A minibatch, inputs are `[batch, dim]`
#[derive(Debug)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Vec<usize>,
}

impl Batch {
    fn from_rows(rows: &[&[f32]], labels: Vec<usize>) -> Result<Self, DataLoaderError> {
        let dim = rows.first().map_or(0, |r| r.len());
        let flat = rows.iter().flat_map(|r| r.iter().copied()).collect::<Vec<_>>();
        Ok(Self {
            inputs: Tensor::from_data(&[rows.len(), dim], &flat)?,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Splits the batch into at most `parts` contiguous shards of near equal size,
    /// one per device. Empty shards are left out.
    pub fn split(&self, parts: usize) -> Result<Vec<Batch>, DataLoaderError> {
        let parts = parts.max(1);
        let dim = self.inputs.shape().get(1).copied().unwrap_or(0);
        let data = self.inputs.to_array();
        let rows = data
            .as_slice()
            .map(|flat| flat.chunks(dim.max(1)).collect::<Vec<_>>())
            .unwrap_or_default();

        let shard = self.len().div_ceil(parts).max(1);
        rows.chunks(shard)
            .zip(self.labels.chunks(shard))
            .map(|(rows, labels)| Batch::from_rows(rows, labels.to_vec()))
            .collect()
    }
}

/// Data loader, returns batches of data and labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    data: Vec<Vec<f32>>,
    // class indices
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
}

impl DataLoader {
    pub fn new<D: Into<Vec<f32>>>(
        data: Vec<D>,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if data.len() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: data.len(),
            });
        }
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        let data = data.into_iter().map(Into::into).collect::<Vec<Vec<f32>>>();
        let input_dims = data.iter().map(|d| d.len()).collect::<HashSet<_>>();
        if input_dims.len() > 1 {
            return Err(DataLoaderError::InputDimensionMismatch { input_dims });
        }
        Ok(Self {
            data,
            labels,
            batch_size,
            shuffle,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates one epoch, shuffling with `rng` if enabled
    pub fn iter<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.data.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        DataLoaderIterator {
            loader: self,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches until the end of the dataset, the last one may be smaller
pub struct DataLoaderIterator<'a> {
    loader: &'a DataLoader,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Result<Batch, DataLoaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.loader.batch_size).min(self.indices.len());
        let indices = &self.indices[self.curr_iter..end];
        self.curr_iter = end;

        let rows = indices
            .iter()
            .map(|&i| self.loader.data[i].as_slice())
            .collect::<Vec<_>>();
        let labels = indices.iter().map(|&i| self.loader.labels[i]).collect();
        Some(Batch::from_rows(&rows, labels))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn rows(batch: &Batch) -> Vec<f32> {
        batch.inputs.to_array().iter().copied().collect()
    }

    #[test]
    fn test_dataloader() {
        let data = vec![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
        let labels = vec![1, 0, 1];
        let dataloader = DataLoader::new(data, labels, 2, false).unwrap();
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let mut iter = dataloader.iter(&mut rng);

        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.inputs.shape(), &[2, 3]);
        assert_eq!(rows(&first), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(first.labels, vec![1, 0]);

        // the last batch is smaller
        let last = iter.next().unwrap().unwrap();
        assert_eq!(last.inputs.shape(), &[1, 3]);
        assert_eq!(last.labels, vec![1]);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_dataloader_shuffle() {
        let data = (0..10).map(|i| vec![i as f32]).collect::<Vec<_>>();
        let labels = (0..10).collect::<Vec<_>>();
        let dataloader = DataLoader::new(data, labels, 10, true).unwrap();

        let batch = |seed| {
            let mut rng = Pcg64Mcg::seed_from_u64(seed);
            dataloader.iter(&mut rng).next().unwrap().unwrap()
        };
        let a = batch(42);
        let b = batch(42);
        assert_eq!(a.labels, b.labels);
        // rows move together with their labels
        assert_eq!(rows(&a), a.labels.iter().map(|&l| l as f32).collect::<Vec<_>>());
        let mut sorted = a.labels.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_into_towers() {
        let data = (0..5).map(|i| vec![i as f32, -(i as f32)]).collect::<Vec<_>>();
        let dataloader = DataLoader::new(data, vec![0, 1, 0, 1, 0], 5, false).unwrap();
        let batch = dataloader
            .iter(&mut Pcg64Mcg::seed_from_u64(0))
            .next()
            .unwrap()
            .unwrap();

        let shards = batch.split(2).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].inputs.shape(), &[3, 2]);
        assert_eq!(shards[1].labels, vec![1, 0]);
        assert_eq!(rows(&shards[1]), vec![3.0, -3.0, 4.0, -4.0]);

        // more devices than samples
        assert_eq!(batch.split(8).unwrap().len(), 5);
    }

    #[test]
    fn test_dataloader_errors() {
        // different length data and labels
        let data = vec![vec![1.0f32, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let labels = vec![1, 0, 1];
        let expected_label_len = labels.len();
        let expected_data_len = data.len();
        let dataloader = DataLoader::new(data, labels, 2, false);
        assert!(matches!(
            dataloader,
            Err(DataLoaderError::LabelLengthMismatch {
                label_len,
                data_len,
            }) if label_len == expected_label_len && data_len == expected_data_len
        ));

        let ragged = vec![vec![1.0f32], vec![1.0, 2.0]];
        assert!(matches!(
            DataLoader::new(ragged, vec![0, 1], 2, false),
            Err(DataLoaderError::InputDimensionMismatch { .. })
        ));
        assert!(matches!(
            DataLoader::new(vec![vec![1.0f32]], vec![0], 0, false),
            Err(DataLoaderError::ZeroBatchSize)
        ));
    }
}
