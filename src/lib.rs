pub mod config;
pub mod context;
pub mod duplicates;
pub mod error;
pub mod form;
pub mod machine;
pub mod quarantine;
pub mod records;
pub mod service;
pub mod store;
pub mod utils;
pub mod versioned;
pub mod versioning;
