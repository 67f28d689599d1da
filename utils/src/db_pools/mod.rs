#[cfg(feature = "redis-pool")]
pub mod redis;
