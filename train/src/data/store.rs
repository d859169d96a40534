use crate::common::*;

/// Candidate sentences of one prompt type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompts {
    One(String),
    Many(Vec<String>),
}

impl Prompts {
    /// The sentence list. An empty list yields a single empty sentence.
    pub fn sentences(&self) -> Vec<&str> {
        match self {
            Self::One(text) => vec![text.as_str()],
            Self::Many(texts) if texts.is_empty() => vec![""],
            Self::Many(texts) => texts.iter().map(|text| text.as_str()).collect(),
        }
    }
}

/// A raw sample as stored on disk.
#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub image_bytes: Vec<u8>,
    pub mask_bytes: Option<Vec<u8>>,
    /// The file name of the ground truth mask under the mask root.
    pub mask_name: String,
    /// Sentences grouped by prompt type, in stored order.
    pub prompts: IndexMap<String, Prompts>,
}

/// Keyed random access to raw samples.
pub trait SampleSource
where
    Self: Send + Sync,
{
    fn count(&self) -> usize;

    /// The ordered key set.
    fn keys(&self) -> &[String];

    fn get(&self, key: &str) -> Result<SampleRecord>;
}

type SourceOpener = Box<dyn Fn() -> Result<Box<dyn SampleSource>> + Send + Sync>;

/// A sample store handle that stays closed until the first access.
///
/// The open transition happens at most once per handle, so each worker
/// owns its own handle and opens it on its own thread. Any access opens
/// the store, including [LazyStore::len]. Threads sharing the handle
/// afterwards reuse the open source.
pub struct LazyStore {
    opener: SourceOpener,
    source: OnceCell<Box<dyn SampleSource>>,
}

impl std::fmt::Debug for LazyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyStore")
            .field("is_open", &self.is_open())
            .finish()
    }
}

impl LazyStore {
    pub fn new<F>(opener: F) -> Self
    where
        F: Fn() -> Result<Box<dyn SampleSource>> + Send + Sync + 'static,
    {
        Self {
            opener: Box::new(opener),
            source: OnceCell::new(),
        }
    }

    /// Opens a JSON index directory lazily.
    pub fn json_index<P>(dir: P) -> Self
    where
        P: AsRef<Path>,
    {
        let dir = dir.as_ref().to_owned();
        Self::new(move || {
            let source = JsonIndexSource::open(&dir)?;
            Ok(Box::new(source) as Box<dyn SampleSource>)
        })
    }

    pub fn is_open(&self) -> bool {
        self.source.get().is_some()
    }

    pub fn source(&self) -> Result<&dyn SampleSource> {
        let source = self.source.get_or_try_init(|| (self.opener)())?;
        Ok(source.as_ref())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.source()?.count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Gets the record at the position in key order.
    pub fn nth(&self, index: usize) -> Result<SampleRecord> {
        let source = self.source()?;
        let key = source
            .keys()
            .get(index)
            .ok_or_else(|| format_err!("invalid index {}", index))?;
        source.get(key)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct IndexEntry {
    key: String,
    image: PathBuf,
    mask: Option<PathBuf>,
    mask_name: String,
    prompts: IndexMap<String, Prompts>,
}

/// A directory with an `index.json` file listing the samples. Image and
/// mask paths are relative to the directory.
#[derive(Debug)]
pub struct JsonIndexSource {
    dir: PathBuf,
    keys: Vec<String>,
    entries: IndexMap<String, IndexEntry>,
}

impl JsonIndexSource {
    pub const INDEX_FILE: &'static str = "index.json";

    pub fn open<P>(dir: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let dir = dir.as_ref();
        let index_path = dir.join(Self::INDEX_FILE);
        let text = fs::read_to_string(&index_path)
            .with_context(|| format!("unable to read '{}'", index_path.display()))?;
        let entries: Vec<IndexEntry> = serde_json::from_str(&text)
            .with_context(|| format!("malformed index file '{}'", index_path.display()))?;

        let num_entries = entries.len();
        let entries: IndexMap<_, _> = entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        ensure!(
            entries.len() == num_entries,
            "duplicated keys in '{}'",
            index_path.display()
        );
        let keys: Vec<_> = entries.keys().cloned().collect();
        debug!("opened {} with {} records", dir.display(), keys.len());

        Ok(Self {
            dir: dir.to_owned(),
            keys,
            entries,
        })
    }
}

impl SampleSource for JsonIndexSource {
    fn count(&self) -> usize {
        self.keys.len()
    }

    fn keys(&self) -> &[String] {
        &self.keys
    }

    fn get(&self, key: &str) -> Result<SampleRecord> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| format_err!("no record with key '{}'", key))?;
        let image_path = self.dir.join(&entry.image);
        let image_bytes = fs::read(&image_path)
            .with_context(|| format!("unable to read '{}'", image_path.display()))?;
        let mask_bytes = entry
            .mask
            .as_ref()
            .map(|mask| {
                let mask_path = self.dir.join(mask);
                fs::read(&mask_path)
                    .with_context(|| format!("unable to read '{}'", mask_path.display()))
            })
            .transpose()?;

        Ok(SampleRecord {
            image_bytes,
            mask_bytes,
            mask_name: entry.mask_name.clone(),
            prompts: entry.prompts.clone(),
        })
    }
}
