pub mod accounts;
pub mod ddl;
pub mod lessons;
pub mod metadata;
pub mod recordings;
