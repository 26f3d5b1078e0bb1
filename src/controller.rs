//! Convergence controller implementing the auto-popout feedback loop.
//!
//! This module contains the state machine that retargets stereo convergence
//! from per-frame depth samples. An anti-judder lock breaks limit-cycle
//! feedback between the depth-driven target and the occlusion clamp by
//! pinning convergence to the lower bound for a fixed duration.

use std::collections::VecDeque;

use crate::config::Tunables;
use crate::stereo;

/// Control phase for the anti-judder hysteresis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlPhase {
    /// Normal closed-loop target tracking
    Tracking,
    /// Convergence pinned to the lower bound until the timer expires
    LockedLow { remaining: f32 },
}

/// Direction of a manual convergence nudge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustDirection {
    Increase,
    Decrease,
}

/// Per-frame input from the host renderer.
///
/// `nearest_w` is the view-space depth of the nearest fragment the host
/// considers relevant for occlusion; `frame_time` is the elapsed time of the
/// frame in seconds.
#[derive(Debug, Clone, Copy)]
pub struct FrameSample {
    pub nearest_w: f32,
    pub frame_time: f32,
}

/// Closed-loop controller for the stereo popout (convergence) value.
///
/// Owns its state exclusively and is mutated once per rendered frame via
/// [`update`](ConvergenceController::update). The emitted value is always
/// within the configured convergence bounds.
pub struct ConvergenceController {
    /// Whether the automatic loop is engaged
    enabled: bool,
    /// Value emitted to the stereo compositor this frame
    current_popout: f32,
    /// Value the loop is ramping toward
    target_popout: f32,
    /// Tracking or locked-low hysteresis phase
    phase: ControlPhase,
    /// Recent emitted values, oldest first, bounded by the judder window
    history: VecDeque<f32>,
    /// Read-only tuning, validated at load time
    tunables: Tunables,
}

impl ConvergenceController {
    /// Create a controller starting at the configured initial popout.
    pub fn new(tunables: Tunables) -> Self {
        let start = tunables
            .initial_popout
            .clamp(tunables.min_convergence, tunables.max_convergence);
        Self {
            enabled: true,
            current_popout: start,
            target_popout: start,
            phase: ControlPhase::Tracking,
            history: VecDeque::with_capacity(tunables.judder_detection_window),
            tunables,
        }
    }

    /// Advance the loop by one rendered frame and return the convergence
    /// value to apply this frame.
    ///
    /// While disabled this is a no-op returning the last emitted value, so
    /// the compositor keeps using it statically.
    pub fn update(&mut self, sample: FrameSample, delta: f32) -> f32 {
        if !self.enabled {
            return self.current_popout;
        }
        let delta = if delta.is_finite() && delta > 0.0 { delta } else { 0.0 };

        if let ControlPhase::LockedLow { remaining } = self.phase {
            let remaining = remaining - delta;
            if remaining > 0.0 {
                self.phase = ControlPhase::LockedLow { remaining };
                return self.current_popout;
            }
            // Lock expired, resume tracking this same frame.
            self.phase = ControlPhase::Tracking;
        }

        let desired = self.compute_target(sample);
        if (desired - self.target_popout).abs() > self.tunables.popout_deviation_threshold {
            self.target_popout = desired;
        }

        // Exponential approach toward the target. delta = 0 moves nothing,
        // so repeated zero-time updates are idempotent.
        let step = 1.0 - 0.5f32.powf(delta / self.tunables.ramp_halflife_seconds);
        self.current_popout += (self.target_popout - self.current_popout) * step;
        self.current_popout = self
            .current_popout
            .clamp(self.tunables.min_convergence, self.tunables.max_convergence);

        self.push_history(self.current_popout);
        if self.sign_flips() > self.tunables.judder_threshold {
            self.engage_lock();
        }

        self.current_popout
    }

    /// Depth-driven target: the comfort bound at the nearest depth wins over
    /// the maximum-popout preference, favoring visibility over effect
    /// strength.
    fn compute_target(&self, sample: FrameSample) -> f32 {
        let t = &self.tunables;
        if !sample.nearest_w.is_finite() || sample.nearest_w <= 0.0 {
            // No usable depth signal this frame: prefer full popout.
            return t.max_convergence;
        }
        let comfort =
            stereo::max_comfortable_convergence(sample.nearest_w, t.separation, t.max_crossed_parallax);
        comfort.clamp(t.min_convergence, t.max_convergence)
    }

    /// Pin convergence to the lower bound for the configured duration.
    fn engage_lock(&mut self) {
        self.phase = ControlPhase::LockedLow {
            remaining: self.tunables.lock_duration_seconds,
        };
        self.current_popout = self.tunables.min_convergence;
        self.target_popout = self.tunables.min_convergence;
        self.history.clear();
    }

    fn push_history(&mut self, value: f32) {
        if self.history.len() >= self.tunables.judder_detection_window {
            self.history.pop_front();
        }
        self.history.push_back(value);
    }

    /// Count strict sign flips between consecutive nonzero deltas of the
    /// recorded history. Repeated crossings back and forth mean the loop is
    /// chattering instead of converging.
    fn sign_flips(&self) -> u32 {
        let mut flips = 0u32;
        let mut last_sign = 0i8;
        let mut prev: Option<f32> = None;
        for &value in &self.history {
            if let Some(p) = prev {
                let diff = value - p;
                let sign = if diff > 0.0 {
                    1
                } else if diff < 0.0 {
                    -1
                } else {
                    0
                };
                if sign != 0 {
                    if last_sign != 0 && sign != last_sign {
                        flips += 1;
                    }
                    last_sign = sign;
                }
            }
            prev = Some(value);
        }
        flips
    }

    /// Engage or disengage the automatic loop.
    ///
    /// Disengaging freezes the current value; re-engaging retargets to the
    /// frozen value so tracking resumes without a visible jump.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            self.target_popout = self.current_popout;
            self.phase = ControlPhase::Tracking;
            self.history.clear();
        }
    }

    /// Flip the enabled state (bound to the host's toggle action).
    pub fn toggle_enabled(&mut self) {
        self.set_enabled(!self.enabled);
    }

    /// Nudge the target by one manual step, clamped to bounds.
    ///
    /// Returns the new target for the caller to surface on the OSD, or
    /// `None` when the nudge is rejected (loop disabled, or an increase
    /// while locked low).
    pub fn adjust_manual(&mut self, direction: AdjustDirection) -> Option<f32> {
        if !self.enabled {
            return None;
        }
        let step = match direction {
            AdjustDirection::Increase => {
                if self.is_locked_low() {
                    return None;
                }
                self.tunables.manual_step_size
            }
            AdjustDirection::Decrease => -self.tunables.manual_step_size,
        };
        self.target_popout = (self.target_popout + step)
            .clamp(self.tunables.min_convergence, self.tunables.max_convergence);
        Some(self.target_popout)
    }

    /// Swap in a new tuning set (profile switch or config update).
    ///
    /// The current value is re-clamped to the new bounds and tracking state
    /// is reset, mirroring a fresh enable without a popout jump.
    pub fn retune(&mut self, tunables: Tunables) {
        self.tunables = tunables;
        self.current_popout = self
            .current_popout
            .clamp(self.tunables.min_convergence, self.tunables.max_convergence);
        self.target_popout = self.current_popout;
        self.phase = ControlPhase::Tracking;
        self.history.clear();
    }

    pub fn current_popout(&self) -> f32 {
        self.current_popout
    }

    pub fn target_popout(&self) -> f32 {
        self.target_popout
    }

    pub fn phase(&self) -> ControlPhase {
        self.phase
    }

    pub fn is_locked_low(&self) -> bool {
        matches!(self.phase, ControlPhase::LockedLow { .. })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DT: f32 = 1.0 / 60.0;

    fn test_tunables() -> Tunables {
        Tunables {
            initial_popout: 0.3,
            min_convergence: 0.0,
            max_convergence: 1.0,
            popout_deviation_threshold: 0.02,
            judder_detection_window: 8,
            judder_threshold: 3,
            lock_duration_seconds: 0.5,
            manual_step_size: 0.05,
            ramp_halflife_seconds: 0.05,
            separation: 0.06,
            max_crossed_parallax: 0.02,
        }
    }

    fn far_sample() -> FrameSample {
        FrameSample {
            nearest_w: 1000.0,
            frame_time: DT,
        }
    }

    fn near_sample() -> FrameSample {
        FrameSample {
            nearest_w: 0.05,
            frame_time: DT,
        }
    }

    /// Drive the controller into the locked-low phase with an alternating
    /// depth signal that flips the target every frame.
    fn drive_into_lock(controller: &mut ConvergenceController) {
        for i in 0..32 {
            let sample = if i % 2 == 0 { near_sample() } else { far_sample() };
            controller.update(sample, DT);
            if controller.is_locked_low() {
                return;
            }
        }
        panic!("oscillating signal never engaged the lock");
    }

    #[test]
    fn test_new_controller_starts_tracking() {
        let controller = ConvergenceController::new(test_tunables());
        assert!(controller.is_enabled());
        assert!(!controller.is_locked_low());
        assert_eq!(controller.phase(), ControlPhase::Tracking);
        assert_eq!(controller.current_popout(), 0.3);
        assert_eq!(controller.target_popout(), 0.3);
    }

    #[test]
    fn test_initial_popout_clamped_to_bounds() {
        let mut tunables = test_tunables();
        tunables.initial_popout = 5.0;
        let controller = ConvergenceController::new(tunables);
        assert_eq!(controller.current_popout(), 1.0);
    }

    #[test]
    fn test_no_occlusion_rises_monotonically_toward_max() {
        let mut controller = ConvergenceController::new(test_tunables());
        let mut last = controller.current_popout();
        for _ in 0..60 {
            let value = controller.update(far_sample(), DT);
            assert!(value >= last, "popout regressed: {} -> {}", last, value);
            assert!(value <= 1.0);
            last = value;
        }
        // Ramp half-life of 50ms leaves nothing visible of the gap after 1s.
        assert!(last > 0.95);
    }

    #[test]
    fn test_near_intrusion_pulls_target_down() {
        let mut controller = ConvergenceController::new(test_tunables());
        for _ in 0..30 {
            controller.update(far_sample(), DT);
        }
        let high = controller.current_popout();
        for _ in 0..30 {
            controller.update(near_sample(), DT);
        }
        assert!(controller.current_popout() < high);
    }

    #[test]
    fn test_update_with_zero_delta_is_idempotent() {
        let mut a = ConvergenceController::new(test_tunables());
        let mut b = ConvergenceController::new(test_tunables());
        let sample = near_sample();

        let once = a.update(sample, 0.0);
        b.update(sample, 0.0);
        let twice = b.update(sample, 0.0);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_disabled_update_returns_frozen_value() {
        let mut controller = ConvergenceController::new(test_tunables());
        for _ in 0..10 {
            controller.update(far_sample(), DT);
        }
        let frozen = controller.current_popout();
        controller.toggle_enabled();
        assert!(!controller.is_enabled());
        for _ in 0..10 {
            assert_eq!(controller.update(near_sample(), DT), frozen);
        }
    }

    #[test]
    fn test_toggle_off_on_preserves_value_and_resumes_smoothly() {
        let mut controller = ConvergenceController::new(test_tunables());
        for _ in 0..10 {
            controller.update(far_sample(), DT);
        }
        let before = controller.current_popout();

        controller.toggle_enabled();
        controller.toggle_enabled();
        assert!(controller.is_enabled());
        assert_eq!(controller.current_popout(), before);
        // Target was reset to the frozen value, so the next frame cannot jump.
        assert_eq!(controller.target_popout(), before);

        let after = controller.update(far_sample(), DT);
        assert!((after - before).abs() < 0.1);
    }

    #[test]
    fn test_oscillation_engages_lock_at_floor() {
        let mut controller = ConvergenceController::new(test_tunables());
        drive_into_lock(&mut controller);
        assert!(controller.is_locked_low());
        assert_eq!(controller.current_popout(), 0.0);
    }

    #[test]
    fn test_lock_holds_floor_then_expires() {
        let mut controller = ConvergenceController::new(test_tunables());
        drive_into_lock(&mut controller);

        // lock_duration_seconds = 0.5 -> 30 frames at 60 fps. The lock holds
        // the floor while the timer runs.
        for _ in 0..28 {
            let value = controller.update(far_sample(), DT);
            assert!(controller.is_locked_low());
            assert_eq!(value, 0.0);
        }

        // Timer reaches zero within a frame or two of the nominal duration,
        // then tracking resumes and the value starts rising.
        let mut unlocked = false;
        for _ in 0..4 {
            let value = controller.update(far_sample(), DT);
            if !controller.is_locked_low() {
                assert!(value > 0.0);
                unlocked = true;
                break;
            }
            assert_eq!(value, 0.0);
        }
        assert!(unlocked, "lock never expired");
    }

    #[test]
    fn test_manual_increase_rejected_while_locked() {
        let mut controller = ConvergenceController::new(test_tunables());
        drive_into_lock(&mut controller);

        assert_eq!(controller.adjust_manual(AdjustDirection::Increase), None);
        assert_eq!(controller.target_popout(), 0.0);

        // Decrease stays honored, a no-op at the floor.
        assert_eq!(
            controller.adjust_manual(AdjustDirection::Decrease),
            Some(0.0)
        );
    }

    #[test]
    fn test_manual_adjust_nudges_target() {
        let mut controller = ConvergenceController::new(test_tunables());
        let up = controller.adjust_manual(AdjustDirection::Increase).unwrap();
        assert!((up - 0.35).abs() < 1e-6);
        let down = controller.adjust_manual(AdjustDirection::Decrease).unwrap();
        assert!((down - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_manual_adjust_rejected_while_disabled() {
        let mut controller = ConvergenceController::new(test_tunables());
        controller.toggle_enabled();
        assert_eq!(controller.adjust_manual(AdjustDirection::Increase), None);
        assert_eq!(controller.adjust_manual(AdjustDirection::Decrease), None);
    }

    #[test]
    fn test_manual_adjust_clamped_at_bounds() {
        let mut controller = ConvergenceController::new(test_tunables());
        for _ in 0..100 {
            controller.adjust_manual(AdjustDirection::Increase);
        }
        assert_eq!(controller.target_popout(), 1.0);
        for _ in 0..100 {
            controller.adjust_manual(AdjustDirection::Decrease);
        }
        assert_eq!(controller.target_popout(), 0.0);
    }

    #[test]
    fn test_small_target_deviation_is_ignored() {
        let mut controller = ConvergenceController::new(test_tunables());
        // Settle on a steady mid-range target first (comfort bound ~0.667).
        let settle = FrameSample {
            nearest_w: 0.5,
            frame_time: DT,
        };
        for _ in 0..120 {
            controller.update(settle, DT);
        }
        let target = controller.target_popout();

        // A depth change whose comfort bound moves the desired target by
        // less than the deviation threshold must not retarget.
        let nudged = FrameSample {
            nearest_w: 0.49,
            frame_time: DT,
        };
        controller.update(nudged, DT);
        assert_eq!(controller.target_popout(), target);
    }

    #[test]
    fn test_retune_reclamps_and_resets_tracking() {
        let mut controller = ConvergenceController::new(test_tunables());
        for _ in 0..60 {
            controller.update(far_sample(), DT);
        }
        let mut narrow = test_tunables();
        narrow.max_convergence = 0.5;
        controller.retune(narrow);
        assert!(controller.current_popout() <= 0.5);
        assert_eq!(controller.phase(), ControlPhase::Tracking);
        assert_eq!(controller.target_popout(), controller.current_popout());
    }

    proptest! {
        // The emitted value stays within the configured bounds for any
        // sequence of depth samples and frame times, including degenerate
        // ones.
        #[test]
        fn prop_popout_always_within_bounds(
            samples in prop::collection::vec(
                (prop_oneof![0.001f32..2000.0, Just(f32::NAN), Just(-1.0f32)], 0.0f32..0.1),
                1..200,
            )
        ) {
            let tunables = test_tunables();
            let mut controller = ConvergenceController::new(tunables.clone());
            for (nearest_w, delta) in samples {
                let value = controller.update(
                    FrameSample { nearest_w, frame_time: delta },
                    delta,
                );
                prop_assert!(value >= tunables.min_convergence);
                prop_assert!(value <= tunables.max_convergence);
            }
        }

        // Manual nudges respect the same bounds regardless of interleaved
        // updates and toggles.
        #[test]
        fn prop_manual_adjust_within_bounds(
            actions in prop::collection::vec(0u8..4, 1..100)
        ) {
            let tunables = test_tunables();
            let mut controller = ConvergenceController::new(tunables.clone());
            for action in actions {
                match action {
                    0 => {
                        controller.update(far_sample(), DT);
                    }
                    1 => {
                        if let Some(v) = controller.adjust_manual(AdjustDirection::Increase) {
                            prop_assert!(v <= tunables.max_convergence);
                        }
                    }
                    2 => {
                        if let Some(v) = controller.adjust_manual(AdjustDirection::Decrease) {
                            prop_assert!(v >= tunables.min_convergence);
                        }
                    }
                    _ => controller.toggle_enabled(),
                }
                prop_assert!(controller.current_popout() >= tunables.min_convergence);
                prop_assert!(controller.current_popout() <= tunables.max_convergence);
            }
        }
    }
}
