pub mod config;
pub mod constants;
pub mod credentials;
pub mod db;
pub mod ingest;
pub mod lifecycle;
pub mod pool;
pub mod provider;
pub mod queries;
pub mod schema;
pub mod serve;
pub mod sftp;
pub mod storage;
pub mod sweeper;
pub mod workers;
