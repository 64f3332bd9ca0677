pub mod client;
pub mod pool;
pub mod script;

pub use client::{parse_reply, RedisBucketStore};
pub use pool::create_redis_pool;
