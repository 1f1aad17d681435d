// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hook Pipeline
//!
//! Named extension points where external code may rewrite an intermediate
//! [`SqlFragment`] before it is used.
//!
//! # Hook Points
//!
//! | Name                | Fragment                                      |
//! |---------------------|-----------------------------------------------|
//! | `filter.attribute`  | one attribute's predicate (or a cross-attribute OR group) |
//! | `filter.global`     | conjunction applied to the hits query         |
//! | `facet.aggregation` | each facet count / facet value search SELECT  |
//! | `stats.aggregation` | each numeric stats SELECT                     |
//! | `query.assembled`   | hits, count and combined aggregate statements |
//!
//! These names are a stable contract surface.
//!
//! # Invocation
//!
//! ```text
//! value ─→ cb₁ ─→ check ─→ cb₂ ─→ check ─→ ... ─→ value'
//! ```
//!
//! Callbacks run in registration order, each receiving the previous output.
//! After each callback the fragment must keep its [`FragmentKind`] and its
//! placeholder count must match its parameter count. A failing callback or a
//! contract violation aborts compilation with a [`HookError`].
//!
//! The registry is an explicit instance (share it with `Arc`). Registration
//! takes the write lock; invocation snapshots the callback list under the
//! read lock and folds outside it, so a callback may itself read the
//! registry without deadlocking.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics;
use crate::sql::SqlFragment;

/// Stable hook identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    FilterAttribute,
    FilterGlobal,
    FacetAggregation,
    StatsAggregation,
    AssembledQuery,
}

impl HookName {
    pub const ALL: [HookName; 5] = [
        HookName::FilterAttribute,
        HookName::FilterGlobal,
        HookName::FacetAggregation,
        HookName::StatsAggregation,
        HookName::AssembledQuery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::FilterAttribute => "filter.attribute",
            HookName::FilterGlobal => "filter.global",
            HookName::FacetAggregation => "facet.aggregation",
            HookName::StatsAggregation => "stats.aggregation",
            HookName::AssembledQuery => "query.assembled",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|h| h.as_str() == name)
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a callback is looking at
#[derive(Debug, Clone)]
pub struct HookContext {
    pub hook: HookName,
    /// Index (table) being compiled
    pub index: String,
    /// Attributes the fragment constrains or aggregates (empty for whole queries)
    pub attributes: Vec<String>,
    /// Which fragment of the stage: `predicate`, `hits`, `count`, `facet_search`, ...
    pub label: &'static str,
}

impl HookContext {
    pub fn new(hook: HookName, index: impl Into<String>, label: &'static str) -> Self {
        Self {
            hook,
            index: index.into(),
            attributes: Vec::new(),
            label,
        }
    }

    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }
}

/// Boxed error a callback may return
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

type HookFn = dyn Fn(SqlFragment, &HookContext) -> Result<SqlFragment, CallbackError> + Send + Sync;

#[derive(Clone)]
struct RegisteredHook {
    source: String,
    callback: Arc<HookFn>,
}

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Hook '{hook}' callback '{source_name}' failed: {message}")]
    CallbackFailed {
        hook: HookName,
        source_name: String,
        message: String,
    },

    #[error("Hook '{hook}' callback '{source_name}' violated the fragment contract: {reason}")]
    ContractViolation {
        hook: HookName,
        source_name: String,
        reason: String,
    },
}

/// Registry of named hook callbacks
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<HookName, Vec<RegisteredHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. `source` identifies it in errors and logs
    /// (e.g. `"tenant-filter"` or a module path).
    pub fn register<F>(&self, hook: HookName, source: impl Into<String>, callback: F)
    where
        F: Fn(SqlFragment, &HookContext) -> Result<SqlFragment, CallbackError> + Send + Sync + 'static,
    {
        let source = source.into();
        debug!(hook = %hook, source = %source, "Registering hook callback");
        self.hooks.write().entry(hook).or_default().push(RegisteredHook {
            source,
            callback: Arc::new(callback),
        });
    }

    /// Number of callbacks registered for `hook`
    pub fn len(&self, hook: HookName) -> usize {
        self.hooks.read().get(&hook).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().values().all(Vec::is_empty)
    }

    /// Registered callback sources for `hook`, in invocation order
    pub fn sources(&self, hook: HookName) -> Vec<String> {
        self.hooks
            .read()
            .get(&hook)
            .map(|list| list.iter().map(|h| h.source.clone()).collect())
            .unwrap_or_default()
    }

    /// Fold `value` through every callback registered for `context.hook`.
    pub fn invoke(&self, value: SqlFragment, context: &HookContext) -> Result<SqlFragment, HookError> {
        let callbacks: Vec<RegisteredHook> = match self.hooks.read().get(&context.hook) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return Ok(value),
        };

        let kind = value.kind;
        let mut current = value;
        for registered in callbacks {
            current = match (registered.callback)(current, context) {
                Ok(next) => next,
                Err(err) => {
                    metrics::record_hook_invocation(context.hook.as_str(), "error");
                    return Err(HookError::CallbackFailed {
                        hook: context.hook,
                        source_name: registered.source,
                        message: err.to_string(),
                    });
                }
            };

            if let Err(reason) = check_contract(&current, kind) {
                metrics::record_hook_invocation(context.hook.as_str(), "contract_violation");
                warn!(hook = %context.hook, source = %registered.source, %reason, "Hook broke fragment contract");
                return Err(HookError::ContractViolation {
                    hook: context.hook,
                    source_name: registered.source,
                    reason,
                });
            }
            metrics::record_hook_invocation(context.hook.as_str(), "success");
        }

        Ok(current)
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read();
        let mut map = f.debug_map();
        for name in HookName::ALL {
            if let Some(list) = hooks.get(&name) {
                let sources: Vec<&str> = list.iter().map(|h| h.source.as_str()).collect();
                map.entry(&name.as_str(), &sources);
            }
        }
        map.finish()
    }
}

fn check_contract(fragment: &SqlFragment, expected: crate::sql::FragmentKind) -> Result<(), String> {
    if fragment.kind != expected {
        return Err(format!("expected a {} fragment, got a {}", expected, fragment.kind));
    }
    if fragment.sql.trim().is_empty() {
        return Err("returned empty SQL".to_string());
    }
    let placeholders = fragment.placeholder_count();
    if placeholders != fragment.params.len() {
        return Err(format!(
            "{} placeholders but {} parameters",
            placeholders,
            fragment.params.len()
        ));
    }
    Ok(())
}
