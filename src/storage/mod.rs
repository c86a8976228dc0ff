//! Storage layer - durable page-file I/O.

mod page_file;

pub use page_file::PageFile;
