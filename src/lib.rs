pub mod app;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod manifest;
pub mod output;
pub mod reconcile;
pub mod runner;
pub mod sorter_spec;
pub mod store;
pub mod workspace;
