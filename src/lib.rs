pub mod api;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod geometry;
pub mod http;
pub mod humanize;
pub mod ledger;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod planner;
pub mod regions;
pub mod storage;
pub mod tasks;
