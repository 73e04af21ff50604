#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate lazy_static;

#[cfg(test)]
pub(crate) mod test_util;

pub mod configuration;
pub mod gateway;
pub mod payload;
pub mod report;
pub mod row_key;
pub mod run;
pub mod schema;
pub mod sharded_stats;
pub mod version;
