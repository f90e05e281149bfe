//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use flowline_engine::config::EngineConfig;
use flowline_engine::model::{FlowId, Package};
use flowline_engine::processor::{Processor, ProcessorBuilder, ProcessorSettings};
use flowline_engine::retry::RetryConfig;
use flowline_engine::source::VecSource;
use flowline_engine::storage::{FileStorage, StateRepository};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Record as it arrives from an upstream export
#[derive(Debug, Clone, PartialEq)]
pub struct RawAsset {
    pub external_id: String,
    pub name: String,
}

/// Record as the pipeline writes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub external_id: String,
    pub name: String,
}

pub fn raw(external_id: &str, name: &str) -> RawAsset {
    RawAsset {
        external_id: external_id.to_string(),
        name: name.to_string(),
    }
}

pub fn to_asset(raw: &RawAsset) -> anyhow::Result<Asset> {
    if raw.external_id.is_empty() {
        anyhow::bail!("record has no external id");
    }
    Ok(Asset {
        external_id: raw.external_id.clone(),
        name: raw.name.clone(),
    })
}

/// File-backed repository in a fresh temporary directory
pub struct TestStore {
    pub dir: TempDir,
    pub repo: StateRepository,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let repo = StateRepository::new(Arc::new(FileStorage::new(dir.path())));
        Self { dir, repo }
    }

    pub fn path(&self, relative: impl Into<PathBuf>) -> PathBuf {
        self.dir.path().join(relative.into())
    }

    pub async fn package(&self, key: &std::path::Path) -> Package<Asset> {
        self.repo
            .load_package(key)
            .await
            .expect("Failed to read package")
            .expect("Package missing")
    }
}

pub fn settings(page_size: usize) -> ProcessorSettings {
    let config = EngineConfig {
        page_size,
        retry: RetryConfig {
            max_attempts: 2,
            wait_ms: 1,
        },
        ..Default::default()
    };
    ProcessorSettings::new(FlowId::from("assets"), "asset", &config)
}

/// Processor over a single in-memory export
pub fn asset_processor(
    store: &TestStore,
    records: Vec<RawAsset>,
    page_size: usize,
) -> ProcessorBuilder<Asset, RawAsset> {
    Processor::builder(settings(page_size), store.repo.clone(), to_asset)
        .with_record_source("asset_export", Arc::new(VecSource::new(records)))
}
