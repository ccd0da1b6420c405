// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Application registry seam and its in-memory default backend.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use smol_str::SmolStr;

/// Effective options of one registered application.
#[derive(Debug, Clone, Default)]
pub struct AppOpts {
    /// Identity placed in `From` for requests this application originates.
    pub from: Option<SmolStr>,
    /// Extensions advertised in `Supported`.
    pub supported: Vec<SmolStr>,
    /// Methods advertised in `Allow`.
    pub allow: Vec<SmolStr>,
    /// Per-application cap on concurrent calls; `None` means only the global
    /// cap applies.
    pub max_calls: Option<usize>,
}

impl AppOpts {
    /// Builder-style helper to cap this application's concurrent calls.
    pub fn with_max_calls(mut self, max_calls: usize) -> Self {
        self.max_calls = Some(max_calls);
        self
    }
}

/// Source of application options. Default impl is in-memory; deployments can
/// plug their own (database, control plane).
#[async_trait]
pub trait AppDirectory: Send + Sync + 'static {
    /// Resolves the effective options for an application.
    ///
    /// `Ok(None)` means the application is not registered. Lookups are
    /// memoized per shard for the lifetime of the router, so options must be
    /// stable between restarts of the router.
    async fn get_app_opts(&self, app: &SmolStr) -> Result<Option<AppOpts>>;
}

/// In-memory application directory (default).
#[derive(Debug, Default)]
pub struct InMemoryAppDirectory {
    inner: DashMap<SmolStr, AppOpts>,
}

impl InMemoryAppDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces an application.
    pub fn register(&self, app: impl Into<SmolStr>, opts: AppOpts) {
        self.inner.insert(app.into(), opts);
    }

    /// Removes an application; existing calls keep their cached options.
    pub fn unregister(&self, app: &SmolStr) {
        self.inner.remove(app);
    }

    /// Returns the current number of registered applications.
    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl AppDirectory for InMemoryAppDirectory {
    async fn get_app_opts(&self, app: &SmolStr) -> Result<Option<AppOpts>> {
        Ok(self.inner.get(app).map(|opts| opts.clone()))
    }
}
