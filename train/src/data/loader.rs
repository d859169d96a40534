use super::{DataItem, EvalParams, RefDataset};
use crate::common::*;

/// A collated batch of samples.
#[derive(Debug)]
pub struct Batch {
    /// `[N, 3, S, S]`
    pub images: Tensor,
    /// `[N, L]`
    pub texts: Tensor,
    /// `[N, 1, S, S]`, only in training mode.
    pub targets: Option<Tensor>,
    /// One entry per sample, only in validation mode.
    pub params: Vec<EvalParams>,
}

impl Batch {
    pub fn collate(items: Vec<DataItem>) -> Result<Self> {
        ensure!(!items.is_empty(), "cannot collate an empty batch");
        let num_items = items.len();

        let mut images = Vec::with_capacity(num_items);
        let mut texts = Vec::with_capacity(num_items);
        let mut targets = Vec::with_capacity(num_items);
        let mut params = Vec::with_capacity(num_items);

        for item in items {
            let DataItem {
                image,
                text,
                target,
                params: item_params,
            } = item;
            images.push(image);
            texts.push(text);
            targets.extend(target);
            params.extend(item_params);
        }

        ensure!(
            targets.is_empty() || targets.len() == num_items,
            "either all or none of the samples have targets"
        );
        ensure!(
            params.is_empty() || params.len() == num_items,
            "either all or none of the samples have evaluation parameters"
        );

        let targets = if targets.is_empty() {
            None
        } else {
            Some(Tensor::f_stack(&targets, 0)?)
        };

        Ok(Self {
            images: Tensor::f_stack(&images, 0)?,
            texts: Tensor::f_stack(&texts, 0)?,
            targets,
            params,
        })
    }

    pub fn len(&self) -> usize {
        self.images.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            images: self.images.to_device(device),
            texts: self.texts.to_device(device),
            targets: self.targets.as_ref().map(|targets| targets.to_device(device)),
            params: self.params.clone(),
        }
    }
}

/// Loads batches on a background thread.
///
/// The producer runs at most `prefetch` batches ahead. It stops after the
/// first error, which is yielded as the last item. If the producer dies
/// before delivering every batch, the loader yields an error instead of
/// ending early, so that every rank runs the same number of steps or fails.
#[derive(Debug)]
pub struct BatchLoader {
    rx: flume::Receiver<Result<Batch>>,
    num_batches: usize,
    received: usize,
    finished: bool,
}

impl BatchLoader {
    pub fn new(
        dataset: Arc<RefDataset>,
        indices: Vec<usize>,
        batch_size: usize,
        drop_last: bool,
        prefetch: usize,
        seed: u64,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(prefetch > 0, "prefetch must be positive");

        let mut chunks: Vec<Vec<usize>> = indices
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        if drop_last && chunks.last().map_or(false, |chunk| chunk.len() < batch_size) {
            chunks.pop();
        }
        let num_batches = chunks.len();

        let (tx, rx) = flume::bounded(prefetch);
        thread::Builder::new()
            .name("batch-loader".into())
            .spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);

                for chunk in chunks {
                    let result: Result<Batch> = chunk
                        .iter()
                        .map(|&index| dataset.get(index, &mut rng))
                        .try_collect()
                        .and_then(Batch::collate);
                    let is_err = result.is_err();

                    // the receiver is gone when the consumer stopped early
                    if tx.send(result).is_err() || is_err {
                        break;
                    }
                }
            })?;

        Ok(Self {
            rx,
            num_batches,
            received: 0,
            finished: num_batches == 0,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

impl Iterator for BatchLoader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let result = match self.rx.recv() {
            Ok(result) => {
                self.received += 1;
                result
            }
            Err(_) => Err(format_err!(
                "the batch loader stopped after {} of {} batches",
                self.received,
                self.num_batches
            )),
        };
        self.finished = result.is_err() || self.received == self.num_batches;
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{
        DatasetMode, HashTokenizer, LazyStore, PromptType, Prompts, RefDatasetInit, SampleRecord,
        SampleSource,
    };
    use image::{DynamicImage, ImageOutputFormat, RgbImage};

    /// Serves a fixed image and panics on the key `broken`.
    struct FlakySource {
        keys: Vec<String>,
        image: Vec<u8>,
    }

    impl SampleSource for FlakySource {
        fn count(&self) -> usize {
            self.keys.len()
        }

        fn keys(&self) -> &[String] {
            &self.keys
        }

        fn get(&self, key: &str) -> Result<SampleRecord> {
            if key == "broken" {
                panic!("corrupted record '{}'", key);
            }
            let mut prompts = IndexMap::new();
            prompts.insert("sentence".to_string(), Prompts::One("a box".into()));
            Ok(SampleRecord {
                image_bytes: self.image.clone(),
                mask_bytes: None,
                mask_name: format!("{}.png", key),
                prompts,
            })
        }
    }

    fn flaky_dataset(keys: &[&str]) -> Result<Arc<RefDataset>> {
        let mut image = vec![];
        DynamicImage::ImageRgb8(RgbImage::new(8, 8)).write_to(&mut image, ImageOutputFormat::Png)?;
        let keys: Vec<String> = keys.iter().map(|key| key.to_string()).collect();

        let store = LazyStore::new(move || {
            Ok(Box::new(FlakySource {
                keys: keys.clone(),
                image: image.clone(),
            }) as Box<dyn SampleSource>)
        });
        let dataset = RefDatasetInit {
            mask_root: PathBuf::from("masks"),
            mode: DatasetMode::Val,
            input_size: 8,
            word_length: 4,
            prompt_type: PromptType::Named("sentence".into()),
            resize: false,
        }
        .build(store, Arc::new(HashTokenizer::new(16)?))?;
        Ok(Arc::new(dataset))
    }

    fn item(with_target: bool) -> DataItem {
        DataItem {
            image: Tensor::zeros(&[3, 4, 4], (Kind::Float, Device::Cpu)),
            text: Tensor::zeros(&[5], (Kind::Int64, Device::Cpu)),
            target: with_target.then(|| Tensor::zeros(&[1, 4, 4], (Kind::Float, Device::Cpu))),
            params: None,
        }
    }

    #[test]
    fn collate_training_items() -> Result<()> {
        let batch = Batch::collate(vec![item(true), item(true)])?;
        assert_eq!(batch.images.size(), vec![2, 3, 4, 4]);
        assert_eq!(batch.texts.size(), vec![2, 5]);
        assert_eq!(batch.targets.map(|t| t.size()), Some(vec![2, 1, 4, 4]));
        assert!(batch.params.is_empty());
        Ok(())
    }

    #[test]
    fn reject_mixed_items() {
        assert!(Batch::collate(vec![item(true), item(false)]).is_err());
        assert!(Batch::collate(vec![]).is_err());
    }

    #[test]
    fn deliver_every_batch() -> Result<()> {
        let dataset = flaky_dataset(&["0", "1", "2"])?;
        let loader = BatchLoader::new(dataset, vec![0, 1, 2], 2, false, 1, 0)?;
        assert_eq!(loader.num_batches(), 2);

        let sizes: Vec<usize> = loader.map(|batch| batch.map(|batch| batch.len())).try_collect()?;
        assert_eq!(sizes, vec![2, 1]);
        Ok(())
    }

    #[test]
    fn dead_producer_is_an_error() -> Result<()> {
        let dataset = flaky_dataset(&["0", "1", "broken", "3"])?;
        let loader = BatchLoader::new(dataset, vec![0, 1, 2, 3], 1, true, 1, 0)?;
        let results: Vec<_> = loader.collect();

        // two good batches, then an error in place of a short epoch
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok() && results[1].is_ok());
        let err = results[2].as_ref().err().map(|err| err.to_string());
        assert_eq!(
            err.as_deref(),
            Some("the batch loader stopped after 2 of 4 batches")
        );
        Ok(())
    }
}
