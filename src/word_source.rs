use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The word could not be read this time
    Failed(String),
    /// The value read isn't a valid word
    Parse(String),
    Timeout,
    /// The source has lost its connection, nothing more can be read
    Disconnected,
}

impl std::error::Error for ReadError {}

impl Display for ReadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Failed(reason) => write!(f, "Read failed: {}", reason),
            ReadError::Parse(value) => write!(f, "Invalid word value '{}'", value),
            ReadError::Timeout => write!(f, "No reply in time"),
            ReadError::Disconnected => write!(f, "Source disconnected"),
        }
    }
}

pub type WordRead = Pin<Box<dyn Future<Output = Result<u32, ReadError>> + Send>>;

/// Supplies packed alarm words from the controller.
pub trait WordSource: Send + Sync {
    /// Read the current value of one word. A failure only concerns that word.
    fn read(&self, word_index: usize) -> WordRead;

    /// Connection generation. Changes whenever the source has reconnected,
    /// which means previously read values can't be compared with new ones.
    fn session(&self) -> u64 {
        0
    }
}

/// Word source backed by a table in memory. Used for simulation and tests.
pub struct MemoryWordSource {
    words: Mutex<Vec<Result<u32, ReadError>>>,
    session: AtomicU64,
}

impl MemoryWordSource {
    pub fn new(word_count: usize) -> MemoryWordSource {
        MemoryWordSource {
            words: Mutex::new(vec![Ok(0); word_count]),
            session: AtomicU64::new(0),
        }
    }

    fn set(&self, word_index: usize, value: Result<u32, ReadError>) {
        let mut words = self.words.lock().unwrap_or_else(PoisonError::into_inner);
        if word_index >= words.len() {
            words.resize(word_index + 1, Ok(0));
        }
        words[word_index] = value;
    }

    pub fn set_word(&self, word_index: usize, word: u32) {
        self.set(word_index, Ok(word));
    }

    /// Make reads of a word fail until it's set again
    pub fn fail_word(&self, word_index: usize, error: ReadError) {
        self.set(word_index, Err(error));
    }

    pub fn fail_all(&self, error: ReadError) {
        let mut words = self.words.lock().unwrap_or_else(PoisonError::into_inner);
        words.iter_mut().for_each(|w| *w = Err(error.clone()));
    }

    pub fn reconnect(&self) {
        self.session.fetch_add(1, Ordering::AcqRel);
    }
}

impl WordSource for MemoryWordSource {
    fn read(&self, word_index: usize) -> WordRead {
        let words = self.words.lock().unwrap_or_else(PoisonError::into_inner);
        let res = words
            .get(word_index)
            .cloned()
            .unwrap_or_else(|| Err(ReadError::Failed(format!("No word {}", word_index))));
        Box::pin(async move { res })
    }

    fn session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }
}

#[tokio::test]
async fn test_memory_source() {
    let source = MemoryWordSource::new(2);
    source.set_word(1, 0xff);
    assert_eq!(source.read(0).await, Ok(0));
    assert_eq!(source.read(1).await, Ok(0xff));
    assert!(matches!(source.read(2).await, Err(ReadError::Failed(_))));
    source.fail_word(0, ReadError::Timeout);
    assert_eq!(source.read(0).await, Err(ReadError::Timeout));
    assert_eq!(source.session(), 0);
    source.reconnect();
    assert_eq!(source.session(), 1);
}
