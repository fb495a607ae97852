pub use buffer_pool::{BufferHandle, BufferPool};
pub use byte_cursor::ByteCursor;
pub use channel_table::{ChannelTable, MAX_TABLE_CAPACITY};
mod buffer_pool;
mod byte_cursor;
mod channel_table;
