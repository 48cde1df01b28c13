// SPDX-License-Identifier: GPL-3.0-only

//! Reprocessing bayer mode and dynamic arming
//!
//! The mode decides which stage's output feeds the capture hold list and
//! whether every frame is held or only frames armed by a capture trigger.

use crate::config::BayerConfig;
use crate::pipes::PipeId;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReprocessingBayerMode {
    /// No reprocessing; stills come from the SCC output
    None,
    PureAlwaysOn,
    DirtyAlwaysOn,
    PureDynamic,
    DirtyDynamic,
}

impl ReprocessingBayerMode {
    pub fn from_config(bayer: &BayerConfig) -> Self {
        match (bayer.reprocessing, bayer.pure, bayer.dynamic) {
            (false, _, _) => ReprocessingBayerMode::None,
            (true, true, false) => ReprocessingBayerMode::PureAlwaysOn,
            (true, false, false) => ReprocessingBayerMode::DirtyAlwaysOn,
            (true, true, true) => ReprocessingBayerMode::PureDynamic,
            (true, false, true) => ReprocessingBayerMode::DirtyDynamic,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReprocessingBayerMode::None => "none",
            ReprocessingBayerMode::PureAlwaysOn => "pure-always-on",
            ReprocessingBayerMode::DirtyAlwaysOn => "dirty-always-on",
            ReprocessingBayerMode::PureDynamic => "pure-dynamic",
            ReprocessingBayerMode::DirtyDynamic => "dirty-dynamic",
        }
    }

    pub fn is_reprocessing(&self) -> bool {
        *self != ReprocessingBayerMode::None
    }

    /// Frames are held only after a capture trigger
    pub fn is_dynamic(&self) -> bool {
        matches!(
            self,
            ReprocessingBayerMode::None
                | ReprocessingBayerMode::PureDynamic
                | ReprocessingBayerMode::DirtyDynamic
        )
    }

    /// Stage whose dst buffer goes to the hold list
    pub fn hold_pipe(&self) -> PipeId {
        match self {
            ReprocessingBayerMode::None => PipeId::Scc,
            ReprocessingBayerMode::PureAlwaysOn | ReprocessingBayerMode::PureDynamic => PipeId::Flite,
            ReprocessingBayerMode::DirtyAlwaysOn | ReprocessingBayerMode::DirtyDynamic => {
                PipeId::ThreeAc
            }
        }
    }
}

impl std::fmt::Display for ReprocessingBayerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What the feeder does with the frame it is about to generate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationFlags {
    /// Send the frame to the hold list once it completes
    pub hold: bool,
    /// Optional stage to add to the frame's route
    pub request: Option<PipeId>,
    /// Stage on the route whose entity is bypassed
    pub skip: Option<PipeId>,
}

/// Dynamic bayer arming state
#[derive(Debug, Clone)]
pub struct BayerArming {
    mode: ReprocessingBayerMode,
    armed: u32,
}

impl BayerArming {
    pub fn new(mode: ReprocessingBayerMode) -> Self {
        Self { mode, armed: 0 }
    }

    pub fn mode(&self) -> ReprocessingBayerMode {
        self.mode
    }

    /// Frames still to be flagged for holding
    pub fn armed(&self) -> u32 {
        self.armed
    }

    /// Flag the next `frames` generated frames; no-op in always-on modes
    pub fn arm(&mut self, frames: u32) {
        if self.mode.is_dynamic() && frames > 0 {
            self.armed = self.armed.saturating_add(frames);
            debug!(mode = %self.mode, armed = self.armed, "Dynamic bayer armed");
        }
    }

    /// Drop the remaining arming; returns how many flags went unused
    pub fn disarm(&mut self) -> u32 {
        std::mem::take(&mut self.armed)
    }

    /// Decide the flags for the next generated frame
    pub fn next_frame(&mut self) -> GenerationFlags {
        let armed = self.mode.is_dynamic() && self.armed > 0;
        if armed {
            self.armed -= 1;
        }
        match self.mode {
            ReprocessingBayerMode::PureAlwaysOn => GenerationFlags {
                hold: true,
                ..Default::default()
            },
            ReprocessingBayerMode::DirtyAlwaysOn => GenerationFlags {
                hold: true,
                request: Some(PipeId::ThreeAc),
                skip: None,
            },
            ReprocessingBayerMode::PureDynamic => GenerationFlags {
                hold: armed,
                ..Default::default()
            },
            // 3AC stays on the route; unarmed frames bypass it
            ReprocessingBayerMode::DirtyDynamic => GenerationFlags {
                hold: armed,
                request: Some(PipeId::ThreeAc),
                skip: (!armed).then_some(PipeId::ThreeAc),
            },
            ReprocessingBayerMode::None => GenerationFlags {
                hold: armed,
                request: armed.then_some(PipeId::Scc),
                skip: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bayer(reprocessing: bool, pure: bool, dynamic: bool) -> BayerConfig {
        BayerConfig {
            reprocessing,
            pure,
            dynamic,
            ..BayerConfig::default()
        }
    }

    #[test]
    fn test_mode_from_config() {
        assert_eq!(
            ReprocessingBayerMode::from_config(&BayerConfig::default()),
            ReprocessingBayerMode::PureAlwaysOn
        );
        assert_eq!(
            ReprocessingBayerMode::from_config(&bayer(true, false, true)),
            ReprocessingBayerMode::DirtyDynamic
        );
        assert_eq!(
            ReprocessingBayerMode::from_config(&bayer(false, false, true)),
            ReprocessingBayerMode::None
        );
    }

    #[test]
    fn test_hold_pipes() {
        assert_eq!(ReprocessingBayerMode::PureDynamic.hold_pipe(), PipeId::Flite);
        assert_eq!(ReprocessingBayerMode::DirtyAlwaysOn.hold_pipe(), PipeId::ThreeAc);
        assert_eq!(ReprocessingBayerMode::None.hold_pipe(), PipeId::Scc);
    }

    #[test]
    fn test_always_on_ignores_arming() {
        let mut arming = BayerArming::new(ReprocessingBayerMode::PureAlwaysOn);
        arming.arm(3);
        assert_eq!(arming.armed(), 0);
        assert!(arming.next_frame().hold);
    }

    #[test]
    fn test_pure_dynamic_holds_armed_frames_only() {
        let mut arming = BayerArming::new(ReprocessingBayerMode::PureDynamic);
        assert!(!arming.next_frame().hold);
        arming.arm(2);
        assert!(arming.next_frame().hold);
        assert!(arming.next_frame().hold);
        assert!(!arming.next_frame().hold);
    }

    #[test]
    fn test_dirty_dynamic_skips_unarmed_3ac() {
        let mut arming = BayerArming::new(ReprocessingBayerMode::DirtyDynamic);
        let idle = arming.next_frame();
        assert_eq!(idle.request, Some(PipeId::ThreeAc));
        assert_eq!(idle.skip, Some(PipeId::ThreeAc));
        arming.arm(1);
        let armed = arming.next_frame();
        assert!(armed.hold);
        assert_eq!(armed.skip, None);
    }

    #[test]
    fn test_non_reprocessing_requests_scc_on_trigger() {
        let mut arming = BayerArming::new(ReprocessingBayerMode::None);
        assert_eq!(arming.next_frame().request, None);
        arming.arm(1);
        assert_eq!(arming.next_frame().request, Some(PipeId::Scc));
        arming.arm(4);
        arming.next_frame();
        assert_eq!(arming.disarm(), 3);
        assert_eq!(arming.armed(), 0);
        assert_eq!(arming.disarm(), 0);
    }
}
