pub mod connection;
pub mod pipe_word_source;

pub use pipe_word_source::PipeWordSource;
