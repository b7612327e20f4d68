pub mod mmap;
pub mod page_pool;
pub mod query_arena;
