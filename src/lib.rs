// ABOUTME: Library root for dataflow-replicator
// ABOUTME: Exports the capture, apply, storage and configuration modules

pub mod apply;
pub mod capture;
pub mod commands;
pub mod config;
pub mod error;
pub mod logdb;
pub mod logging;
pub mod mapping;
pub mod model;
pub mod queue;
pub mod retry;
