//! Persistent stores (§4.2): the Metadata Store and the File DB.
//!
//! Both are specified as logical contracts with at least two interchangeable
//! physical implementations. This crate ships an LSM-backed variant (`sled`)
//! and a relational variant (`rusqlite`) for each, mirroring the
//! `rdb_meta_db` / `sqlite_meta_db` pair in the source this spec was
//! distilled from. The File Manager and Provider depend only on the trait.

pub mod file_db;
pub mod metadata_store;

pub use file_db::FileDb;
pub use metadata_store::MetadataStore;
