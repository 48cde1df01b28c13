// SPDX-License-Identifier: GPL-3.0-only

//! Hold-list selection policies

use crate::backends::AfState;
use crate::config::TimingConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a still-capture request asks of the frame it gets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureIntent {
    /// Frame count on which the main flash fires
    pub flash_fcount: Option<u32>,
    /// Frame count the HDR bracket starts at
    pub hdr_trigger: Option<u32>,
    /// Only frames produced after this frame count
    pub after_fcount: Option<u32>,
    /// Skip frames whose focus is still scanning
    pub wait_focus: bool,
}

/// Policy applied to one selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionPolicy {
    Oldest,
    /// First frame at or after the main-flash frame
    Flash { fcount: u32 },
    /// Shot k takes the frame at `trigger + k`
    Hdr { trigger: u32 },
    /// First frame newer than `fcount`
    AfterFcount { fcount: u32 },
    /// First frame with settled focus
    Focused,
}

/// Snapshot of a held frame that the policies look at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldInfo {
    pub fcount: u32,
    pub af: AfState,
}

/// Outcome of evaluating a policy against the hold list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Choice {
    /// Oldest entries to evict as unusable
    pub stale: usize,
    /// Position of the chosen entry, counted before eviction
    pub pick: Option<usize>,
}

impl SelectionPolicy {
    /// Highest-priority policy the intent asks for
    ///
    /// Flash wins over HDR, HDR over a frame-count bound, that over focus.
    pub fn from_intent(intent: &CaptureIntent) -> Self {
        if let Some(fcount) = intent.flash_fcount {
            SelectionPolicy::Flash { fcount }
        } else if let Some(trigger) = intent.hdr_trigger {
            SelectionPolicy::Hdr { trigger }
        } else if let Some(fcount) = intent.after_fcount {
            SelectionPolicy::AfterFcount { fcount }
        } else if intent.wait_focus {
            SelectionPolicy::Focused
        } else {
            SelectionPolicy::Oldest
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SelectionPolicy::Oldest => "oldest",
            SelectionPolicy::Flash { .. } => "flash",
            SelectionPolicy::Hdr { .. } => "hdr",
            SelectionPolicy::AfterFcount { .. } => "after-fcount",
            SelectionPolicy::Focused => "focused",
        }
    }

    /// Polls before falling back to the oldest frame
    pub fn retries(&self, timing: &TimingConfig) -> u32 {
        match self {
            SelectionPolicy::Oldest | SelectionPolicy::AfterFcount { .. } => timing.total_waiting_count,
            SelectionPolicy::Flash { .. } => timing.flash_waiting_count,
            SelectionPolicy::Hdr { .. } => timing.hdr_retry_count,
            SelectionPolicy::Focused => timing.capture_waiting_count,
        }
    }

    pub fn poll_interval(&self, timing: &TimingConfig) -> Duration {
        match self {
            SelectionPolicy::Focused => timing.dm_waiting_time(),
            _ => timing.waiting_time(),
        }
    }

    /// Evaluate against `held`, oldest first
    pub fn choose(&self, held: &[HeldInfo], shot: u32) -> Choice {
        let position = match *self {
            SelectionPolicy::Oldest => (!held.is_empty()).then_some(0),
            SelectionPolicy::Flash { fcount } => held.iter().position(|h| h.fcount >= fcount),
            SelectionPolicy::Hdr { trigger } => {
                let target = trigger.saturating_add(shot);
                held.iter().position(|h| h.fcount >= target)
            }
            SelectionPolicy::AfterFcount { fcount } => held.iter().position(|h| h.fcount > fcount),
            SelectionPolicy::Focused => held.iter().position(|h| h.af.is_settled()),
        };
        match position {
            Some(index) => Choice {
                stale: index,
                pick: Some(index),
            },
            None => Choice {
                stale: held.len(),
                pick: None,
            },
        }
    }
}

impl std::fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(fcounts: &[u32]) -> Vec<HeldInfo> {
        fcounts
            .iter()
            .map(|&fcount| HeldInfo {
                fcount,
                af: AfState::Focused,
            })
            .collect()
    }

    #[test]
    fn test_priority_order() {
        let intent = CaptureIntent {
            flash_fcount: Some(10),
            hdr_trigger: Some(5),
            after_fcount: Some(3),
            wait_focus: true,
        };
        assert_eq!(SelectionPolicy::from_intent(&intent), SelectionPolicy::Flash { fcount: 10 });

        let intent = CaptureIntent {
            after_fcount: Some(3),
            wait_focus: true,
            ..Default::default()
        };
        assert_eq!(
            SelectionPolicy::from_intent(&intent),
            SelectionPolicy::AfterFcount { fcount: 3 }
        );
        assert_eq!(
            SelectionPolicy::from_intent(&CaptureIntent::default()),
            SelectionPolicy::Oldest
        );
    }

    #[test]
    fn test_flash_evicts_older_frames() {
        let choice = SelectionPolicy::Flash { fcount: 7 }.choose(&held(&[5, 6, 7, 8]), 0);
        assert_eq!(choice, Choice { stale: 2, pick: Some(2) });
    }

    #[test]
    fn test_hdr_targets_shot_offset() {
        let list = held(&[10, 11, 12, 13]);
        let policy = SelectionPolicy::Hdr { trigger: 10 };
        assert_eq!(policy.choose(&list, 0).pick, Some(0));
        assert_eq!(policy.choose(&list, 2).pick, Some(2));
        let late = policy.choose(&list, 5);
        assert_eq!(late, Choice { stale: 4, pick: None });
    }

    #[test]
    fn test_focus_skips_scanning() {
        let mut list = held(&[1, 2, 3]);
        list[0].af = AfState::Scanning;
        list[1].af = AfState::Scanning;
        let choice = SelectionPolicy::Focused.choose(&list, 0);
        assert_eq!(choice, Choice { stale: 2, pick: Some(2) });
    }

    #[test]
    fn test_retry_budgets_follow_timing() {
        let timing = TimingConfig::default();
        assert_eq!(SelectionPolicy::Hdr { trigger: 0 }.retries(&timing), 15);
        assert_eq!(SelectionPolicy::Flash { fcount: 0 }.retries(&timing), 10);
        assert_eq!(SelectionPolicy::Oldest.retries(&timing), 3);
        assert_eq!(
            SelectionPolicy::Focused.poll_interval(&timing),
            std::time::Duration::from_millis(30)
        );
    }
}
