//! Configuration merger.
//!
//! Folds the [`ConfigRequest`] of every attached client, in attach order,
//! into the single [`EffectiveConfig`] pushed to the HAL.
//!
//! | field | rule |
//! |---|---|
//! | cluster range | non-default ranges must agree; default defers to any other |
//! | master preference | max of the non-zero values |
//! | band support | logical OR |
//! | discovery window | per band, min of the explicitly set values |
//! | vendor data | last client merged wins, even when empty |
//! | identity callbacks | OR of `wants_identity` |

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::request::{BAND_COUNT, ConfigRequest};

/// Configuration actually applied to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub request: ConfigRequest,
    pub identity_change_callbacks: bool,
    pub instant_mode: bool,
}

/// Two clients asked for cluster ranges that cannot both be honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeConflict {
    pub existing: (u16, u16),
    pub requested: (u16, u16),
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cluster range {:#06x}-{:#06x} conflicts with {:#06x}-{:#06x}",
            self.requested.0, self.requested.1, self.existing.0, self.existing.1
        )
    }
}

impl std::error::Error for MergeConflict {}

/// Merge every `(request, wants_identity)` pair.
///
/// Returns `Ok(None)` when there is nothing to merge, i.e. no client is
/// attached and the device should be disabled.
pub fn merge<'a, I>(
    requests: I,
    instant_mode: bool,
) -> Result<Option<EffectiveConfig>, MergeConflict>
where
    I: IntoIterator<Item = (&'a ConfigRequest, bool)>,
{
    let mut acc: Option<EffectiveConfig> = None;
    for (req, wants_identity) in requests {
        acc = Some(match acc {
            None => EffectiveConfig {
                request: req.clone(),
                identity_change_callbacks: wants_identity,
                instant_mode,
            },
            Some(mut eff) => {
                fold(&mut eff.request, req)?;
                eff.identity_change_callbacks |= wants_identity;
                eff
            }
        });
    }
    Ok(acc)
}

fn fold(into: &mut ConfigRequest, next: &ConfigRequest) -> Result<(), MergeConflict> {
    if !next.has_default_cluster_range() {
        if into.has_default_cluster_range() {
            into.cluster_low = next.cluster_low;
            into.cluster_high = next.cluster_high;
        } else if (into.cluster_low, into.cluster_high) != (next.cluster_low, next.cluster_high) {
            return Err(MergeConflict {
                existing: (into.cluster_low, into.cluster_high),
                requested: (next.cluster_low, next.cluster_high),
            });
        }
    }

    if next.master_preference != 0 {
        into.master_preference = into.master_preference.max(next.master_preference);
    }

    into.support_5g |= next.support_5g;
    into.support_6g |= next.support_6g;

    for band in 0..BAND_COUNT {
        into.discovery_window[band] = match (into.discovery_window[band], next.discovery_window[band]) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    into.vendor_data.clone_from(&next.vendor_data);
    Ok(())
}
