//! tickstore: a local-first partitioned columnar store for quant research
//! datasets, with SQL-style querying, scheduled incremental updates and a
//! dependency-aware factor engine on top.

pub mod factor;
pub mod query;
pub mod scheduler;
pub mod store;
