//! Chunked serializing file
//!
//! An append-only container of encoded records, block-compressed
//! end-to-end with the LZ4 frame format. Two record framings are
//! supported:
//!
//! - **Dynamic**: each record is a 4-byte big-endian length followed by
//!   that many payload bytes
//! - **Fixed**: each record is exactly `fixed_length` bytes, no header
//!
//! Writers create the file lazily on first append and may flush to make
//! current contents visible to concurrent readers. Readers iterate
//! forward until EOF (or up to an observed record count for still-open
//! writers); a truncated trailing record terminates iteration silently.

mod reader;
mod writer;

pub use reader::{read_records, ChunkReader};
pub use writer::ChunkWriter;
