pub mod config;
pub mod protocol;
pub mod test_util;
