// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device dispatch: proportional reassignment between schedulers.
//!
//! Every main-loop iteration recomputes per-scheduler weights from pending
//! request counts, then migrates devices toward the proportional targets.
//! Migration is monotone and hysteretic: only idle devices move, a device
//! in the middle of an operation stays where it is, and a scheduler with
//! pending work never drops to zero devices while any device is movable.
//! Every device remains owned by exactly one scheduler.

use super::{DeviceClaim, IoScheduler};
use crate::device::DeviceHandle;
use std::sync::Arc;

/// Rebalance device ownership across the family's schedulers.
pub fn dispatch_devices(schedulers: &mut [&mut dyn IoScheduler]) {
    let total_devices: usize = schedulers.iter().map(|s| s.devices().len()).sum();
    if total_devices == 0 {
        return;
    }
    let weights: Vec<usize> = schedulers.iter().map(|s| s.queue_len()).collect();
    let total_weight: usize = weights.iter().sum();
    if total_weight == 0 {
        // Idle daemon: leave the current assignment alone.
        return;
    }

    let targets = proportional_targets(&weights, total_devices);

    // Surplus pass: over-quota schedulers surrender idle devices.
    let mut pool: Vec<Arc<DeviceHandle>> = Vec::new();
    for (i, sched) in schedulers.iter_mut().enumerate() {
        while sched.devices().len() > targets[i] {
            match sched.claim_device(DeviceClaim::Take) {
                Some(dev) => pool.push(dev),
                // Only busy devices left: hysteresis keeps them in place.
                None => break,
            }
        }
    }

    // Deficit pass: hand the pool to under-quota schedulers, hungriest
    // first.
    let mut order: Vec<usize> = (0..schedulers.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(targets[i].saturating_sub(schedulers[i].devices().len())));
    for i in order {
        while schedulers[i].devices().len() < targets[i] {
            match pool.pop() {
                Some(dev) => schedulers[i].add_device(dev),
                None => break,
            }
        }
    }

    // Nothing may end up ownerless.
    if !pool.is_empty() {
        let fallback = weights
            .iter()
            .enumerate()
            .max_by_key(|(_, w)| **w)
            .map(|(i, _)| i)
            .unwrap_or(0);
        for dev in pool {
            schedulers[fallback].add_device(dev);
        }
    }
}

/// Integer targets proportional to `weights`, summing to `total`. A nonzero
/// weight is guaranteed at least one device when enough devices exist.
fn proportional_targets(weights: &[usize], total: usize) -> Vec<usize> {
    let total_weight: usize = weights.iter().sum();
    let active = weights.iter().filter(|w| **w > 0).count();
    let mut targets: Vec<usize> = weights
        .iter()
        .map(|w| {
            if *w == 0 {
                0
            } else if total >= active {
                ((w * total) / total_weight).max(1)
            } else {
                (w * total) / total_weight
            }
        })
        .collect();

    // Fix rounding drift against the exact total.
    let mut assigned: usize = targets.iter().sum();
    while assigned > total {
        if let Some((i, _)) = targets
            .iter()
            .enumerate()
            .filter(|(_, t)| **t > 1)
            .max_by_key(|(_, t)| **t)
        {
            targets[i] -= 1;
            assigned -= 1;
        } else {
            break;
        }
    }
    while assigned < total {
        if let Some((i, _)) = weights
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0)
            .max_by_key(|(_, w)| **w)
        {
            targets[i] += 1;
            assigned += 1;
        } else {
            break;
        }
    }
    targets
}
