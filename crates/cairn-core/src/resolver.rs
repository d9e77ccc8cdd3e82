//! Dependency graph resolution.
//!
//! [`resolve`] validates a plugin list and computes its start order with a
//! fixpoint scan: every pass walks the still-unplaced descriptors in their
//! original relative order and places each one whose consumes are all
//! resolved. A placed descriptor's provides become resolved immediately, so a
//! later descriptor in the same pass may already depend on them. The scan
//! stops when a pass places nothing.
//!
//! When descriptors remain, the stuck set is inspected: a consumed name no
//! stuck descriptor provides is reported as missing; if there is none, the
//! failure is a cycle.
//!
//! ```rust,ignore
//! let order = resolve(&descriptors, None)?;
//!
//! // Hot-loading: services already registered count as resolved.
//! let order = resolve(&batch, Some(&|name| registry.contains(name)))?;
//! ```

use std::collections::HashSet;

use tracing::{debug, trace};

use crate::descriptor::PluginDescriptor;
use crate::error::{DescriptorField, PluginError, PluginResult, ResolutionFailure};
use crate::hub::HUB_SERVICE;

/// External predicate consulted for names the current pass has not resolved.
pub type Lookup<'a> = &'a dyn Fn(&str) -> bool;

/// Checks that every unchecked descriptor declares a setup, a provides list
/// and a consumes list.
pub fn check_config(descriptors: &[PluginDescriptor]) -> PluginResult<()> {
    for desc in descriptors.iter().filter(|d| !d.checked) {
        let missing = if desc.setup.is_none() {
            Some(DescriptorField::Setup)
        } else if desc.provides.is_none() {
            Some(DescriptorField::Provides)
        } else if desc.consumes.is_none() {
            Some(DescriptorField::Consumes)
        } else {
            None
        };
        if let Some(field) = missing {
            return Err(PluginError::InvalidDescriptor {
                plugin: desc.package_path.clone(),
                field,
            });
        }
    }
    Ok(())
}

/// Validates `descriptors` and returns them in start order.
///
/// `lookup` is consulted for consumed names not provided within the list
/// itself, such as services already registered in a running application.
pub fn resolve(
    descriptors: &[PluginDescriptor],
    lookup: Option<Lookup<'_>>,
) -> PluginResult<Vec<PluginDescriptor>> {
    check_config(descriptors)?;

    let mut state = ResolutionState::new(descriptors);
    while !state.remaining.is_empty() {
        let placed = state.pass(lookup);
        trace!(placed, remaining = state.remaining.len(), "Resolution pass finished");
        if placed == 0 {
            let failure = state.failure();
            debug!(
                unresolved = ?failure.unresolved,
                stuck = ?failure.stuck,
                "Dependency resolution failed"
            );
            return Err(PluginError::Unresolvable(failure));
        }
    }

    Ok(state.sorted)
}

// =============================================================================
// ResolutionState
// =============================================================================

/// A descriptor not placed yet, with the consumes still outstanding.
struct Scratch<'a> {
    original: &'a PluginDescriptor,
    consumes: Vec<String>,
}

struct ResolutionState<'a> {
    /// Resolved names in resolution order.
    resolved: Vec<String>,
    resolved_set: HashSet<String>,
    remaining: Vec<Scratch<'a>>,
    sorted: Vec<PluginDescriptor>,
}

impl<'a> ResolutionState<'a> {
    fn new(descriptors: &'a [PluginDescriptor]) -> Self {
        let mut state = Self {
            resolved: Vec::new(),
            resolved_set: HashSet::new(),
            remaining: descriptors
                .iter()
                .map(|original| Scratch {
                    original,
                    consumes: original.consumed().to_vec(),
                })
                .collect(),
            sorted: Vec::with_capacity(descriptors.len()),
        };
        state.mark_resolved(HUB_SERVICE);
        state
    }

    fn mark_resolved(&mut self, name: &str) {
        if self.resolved_set.insert(name.to_string()) {
            self.resolved.push(name.to_string());
        }
    }

    fn is_resolved(&self, name: &str, lookup: Option<Lookup<'_>>) -> bool {
        self.resolved_set.contains(name) || lookup.is_some_and(|f| f(name))
    }

    /// Runs one scan over the remaining descriptors and returns how many were
    /// placed.
    fn pass(&mut self, lookup: Option<Lookup<'_>>) -> usize {
        let pending = std::mem::take(&mut self.remaining);
        let before = pending.len();

        for mut scratch in pending {
            scratch
                .consumes
                .retain(|name| !self.is_resolved(name, lookup));

            if scratch.consumes.is_empty() {
                trace!(plugin = %scratch.original.package_path, "Plugin placed");
                for name in scratch.original.provided() {
                    self.mark_resolved(name);
                }
                self.sorted.push(scratch.original.clone());
            } else {
                self.remaining.push(scratch);
            }
        }

        before - self.remaining.len()
    }

    fn failure(&self) -> ResolutionFailure {
        let stuck_provides: HashSet<&str> = self
            .remaining
            .iter()
            .flat_map(|s| s.original.provided())
            .map(String::as_str)
            .collect();

        let mut unresolved: Vec<String> = Vec::new();
        for name in self.remaining.iter().flat_map(|s| &s.consumes) {
            if !stuck_provides.contains(name.as_str()) && !unresolved.contains(name) {
                unresolved.push(name.clone());
            }
        }

        ResolutionFailure {
            unresolved,
            resolved: self.resolved.clone(),
            stuck: self
                .remaining
                .iter()
                .map(|s| s.original.package_path.clone())
                .collect(),
        }
    }
}
