pub mod db_pools;

#[cfg(feature = "id")]
pub mod id_macro;

#[cfg(feature = "ip")]
pub mod process;

#[cfg(feature = "logger")]
pub mod logger;
