// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide context.
//!
//! Holds the configuration snapshot, the adapter registry and the per-family
//! media caches. Created at the first [`init`], destroyed at the last
//! [`finish`]; every subsystem receives an explicit `Arc<Context>` on
//! construction, so nothing reaches for hidden globals and tests can wire a
//! private context with injected adapters.

use crate::adapters::AdapterRegistry;
use crate::cache::MediaCache;
use crate::config::Config;
use crate::dss::LockOwner;
use crate::types::Family;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared context handed to every subsystem.
pub struct Context {
    config: ArcSwap<Config>,
    adapters: AdapterRegistry,
    caches: DashMap<Family, Arc<MediaCache>>,
    owner: LockOwner,
}

impl Context {
    /// Standalone context (tests, embedded wiring). The process-wide
    /// refcounted instance goes through [`init`]/[`finish`].
    pub fn new(config: Config, adapters: AdapterRegistry, owner: LockOwner) -> Arc<Self> {
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            adapters,
            caches: DashMap::new(),
            owner,
        })
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Replace the configuration snapshot (config reload, configure-set).
    pub fn set_config(&self, config: Config) {
        self.config.store(Arc::new(config));
    }

    /// Media cache of a family, created on first use.
    pub fn cache(&self, family: Family) -> Arc<MediaCache> {
        self.caches
            .entry(family)
            .or_insert_with(|| MediaCache::new(family))
            .clone()
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Lock owner identity of this daemon: (short hostname, pid).
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }
}

static GLOBAL: Mutex<Option<(Arc<Context>, u32)>> = Mutex::new(None);

/// Acquire the process-wide context, creating it on the first call.
///
/// Later calls ignore `config` and return the existing instance with its
/// reference count bumped; pair every `init` with a [`finish`].
pub fn init(config: Config) -> Arc<Context> {
    let mut global = GLOBAL.lock();
    match global.as_mut() {
        Some((ctx, count)) => {
            *count += 1;
            Arc::clone(ctx)
        }
        None => {
            let ctx = Context::new(
                config,
                AdapterRegistry::with_defaults(),
                LockOwner::for_current_process(),
            );
            *global = Some((Arc::clone(&ctx), 1));
            ctx
        }
    }
}

/// Release one reference to the process-wide context; the last release
/// destroys it.
pub fn finish() {
    let mut global = GLOBAL.lock();
    if let Some((_, count)) = global.as_mut() {
        *count -= 1;
        if *count == 0 {
            *global = None;
        }
    }
}
