mod catalog_db;
mod collections;
mod contents;
mod edges;
mod head_client;
mod requests;

pub use catalog_db::CatalogDB;
pub use head_client::{head_error_reply, HeadClient};

#[cfg(test)]
mod test_catalog;
#[cfg(test)]
mod test_head_client;
