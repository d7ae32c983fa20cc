//! Pin-to-bottom scrolling for a growing transcript.
//!
//! The engine never reads a real viewport. The host implements [`ScrollHost`]
//! and forwards scroll events, user input, and content mutations; the engine
//! decides whether to follow new content and eases the viewport down with a
//! cubic ease-out advanced by [`AutoscrollEngine::tick`].

use std::time::Duration;

use tokio::time::Instant;

/// Default animation length for `scroll_to_bottom`.
pub const SCROLL_ANIMATION: Duration = Duration::from_millis(160);

/// Remaining distance below which the engine snaps instead of animating.
pub const SNAP_DISTANCE: f64 = 0.5;

/// Distance from the top at which older history should be loaded.
pub const LOAD_OLDER_THRESHOLD: f64 = 96.0;

/// Viewport geometry in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollMetrics {
    /// Current offset from the top.
    pub scroll_top: f64,
    /// Total content height.
    pub scroll_height: f64,
    /// Visible height.
    pub client_height: f64,
}

impl ScrollMetrics {
    /// Largest valid `scroll_top`.
    #[must_use]
    pub fn max_scroll_top(&self) -> f64 {
        (self.scroll_height - self.client_height).max(0.0)
    }

    /// How far the viewport is from the bottom.
    #[must_use]
    pub fn distance_from_bottom(&self) -> f64 {
        (self.max_scroll_top() - self.scroll_top).max(0.0)
    }
}

/// The viewport the engine drives.
pub trait ScrollHost {
    /// Current geometry.
    fn metrics(&self) -> ScrollMetrics;

    /// Move the viewport.
    fn set_scroll_top(&mut self, scroll_top: f64);
}

/// How `scroll_to_bottom` should move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollBehavior {
    /// Eased animation.
    #[default]
    Smooth,
    /// Jump, e.g. on session switch.
    Instant,
}

/// User-originated scroll input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UserScrollInput {
    /// Mouse wheel or trackpad; negative `delta_y` scrolls up.
    Wheel {
        /// Vertical delta.
        delta_y: f64,
    },
    /// Touch drag.
    Touch,
}

/// Kinds of content change that may pull the viewport down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMutation {
    /// Streaming text grew.
    TextGrew,
    /// A new message, tool call, or other block appeared.
    BlockAdded,
    /// A permission prompt appeared.
    PermissionPrompt,
}

/// Pin and release distances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollThresholds {
    /// Within this distance from the bottom the viewport is pinned.
    pub pinned: f64,
    /// Beyond this distance the pin is released.
    pub release: f64,
}

impl ScrollThresholds {
    /// Pointer-driven layouts.
    #[must_use]
    pub const fn desktop() -> Self {
        Self {
            pinned: 72.0,
            release: 110.0,
        }
    }

    /// Touch layouts, where momentum scrolling overshoots more.
    #[must_use]
    pub const fn mobile() -> Self {
        Self {
            pinned: 110.0,
            release: 150.0,
        }
    }
}

impl Default for ScrollThresholds {
    fn default() -> Self {
        Self::desktop()
    }
}

/// Observable scroll state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollState {
    /// Following new content.
    pub is_pinned: bool,
    /// Viewport is at the very top.
    pub is_at_top: bool,
    /// The "jump to latest" affordance should be visible.
    pub show_scroll_button: bool,
}

impl Default for ScrollState {
    fn default() -> Self {
        Self {
            is_pinned: true,
            is_at_top: false,
            show_scroll_button: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Animation {
    from: f64,
    started: Instant,
}

/// Cubic ease-out.
#[must_use]
pub fn ease_out_cubic(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    1.0 - (1.0 - t).powi(3)
}

/// Pin/release state machine for one viewport.
#[derive(Debug, Clone)]
pub struct AutoscrollEngine {
    state: ScrollState,
    manual_override: bool,
    thresholds: ScrollThresholds,
    duration: Duration,
    last_scroll_top: f64,
    animation: Option<Animation>,
}

impl Default for AutoscrollEngine {
    fn default() -> Self {
        Self::new(ScrollThresholds::desktop())
    }
}

impl AutoscrollEngine {
    /// Create an engine that starts pinned.
    #[must_use]
    pub fn new(thresholds: ScrollThresholds) -> Self {
        Self {
            state: ScrollState::default(),
            manual_override: false,
            thresholds,
            duration: SCROLL_ANIMATION,
            last_scroll_top: 0.0,
            animation: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ScrollState {
        self.state
    }

    /// Returns true while following new content.
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.state.is_pinned
    }

    /// Returns true once the user has scrolled by hand.
    #[must_use]
    pub const fn manual_override(&self) -> bool {
        self.manual_override
    }

    /// Returns true while an eased scroll is running.
    #[must_use]
    pub const fn is_animating(&self) -> bool {
        self.animation.is_some()
    }

    /// Switch layouts.
    pub fn set_thresholds(&mut self, thresholds: ScrollThresholds) {
        self.thresholds = thresholds;
    }

    fn release(&mut self) {
        self.state.is_pinned = false;
        self.state.show_scroll_button = true;
        self.animation = None;
    }

    fn pin(&mut self) {
        self.state.is_pinned = true;
        self.state.show_scroll_button = false;
    }

    /// The user touched the wheel or the screen.
    pub fn on_user_input(&mut self, input: UserScrollInput) {
        self.manual_override = true;
        if let UserScrollInput::Wheel { delta_y } = input {
            if delta_y < 0.0 && self.state.is_pinned {
                self.release();
            }
        }
    }

    /// The viewport scrolled, by the user or by us.
    pub fn on_scroll(&mut self, host: &dyn ScrollHost) {
        let metrics = host.metrics();
        let delta = metrics.scroll_top - self.last_scroll_top;
        self.last_scroll_top = metrics.scroll_top;
        self.state.is_at_top = metrics.scroll_top <= SNAP_DISTANCE;

        if self.animation.is_some() && !self.manual_override {
            return;
        }

        if delta < 0.0 && self.state.is_pinned && self.manual_override {
            self.release();
            return;
        }

        let distance = metrics.distance_from_bottom();
        if distance <= self.thresholds.pinned {
            self.pin();
            self.manual_override = false;
        } else if distance > self.thresholds.release {
            self.release();
        }
    }

    /// Re-pin and move to the bottom.
    ///
    /// Returns true if an animation was started; call [`tick`](Self::tick)
    /// on every frame until it returns false.
    pub fn scroll_to_bottom(
        &mut self,
        host: &mut dyn ScrollHost,
        behavior: ScrollBehavior,
        now: Instant,
    ) -> bool {
        self.pin();
        self.manual_override = false;

        let metrics = host.metrics();
        let target = metrics.max_scroll_top();
        if behavior == ScrollBehavior::Instant || (target - metrics.scroll_top).abs() <= SNAP_DISTANCE
        {
            self.snap(host, target);
            return false;
        }
        if self.animation.is_none() {
            self.animation = Some(Animation {
                from: metrics.scroll_top,
                started: now,
            });
        }
        true
    }

    fn snap(&mut self, host: &mut dyn ScrollHost, target: f64) {
        host.set_scroll_top(target);
        self.last_scroll_top = target;
        self.animation = None;
    }

    /// Advance the running animation. Returns true while it is still running.
    ///
    /// The target is re-read every frame, so content that keeps growing
    /// during the animation is still reached.
    pub fn tick(&mut self, host: &mut dyn ScrollHost, now: Instant) -> bool {
        let Some(animation) = self.animation else {
            return false;
        };
        let target = host.metrics().max_scroll_top();
        let elapsed = now.saturating_duration_since(animation.started);
        let t = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        if t >= 1.0 {
            self.snap(host, target);
            return false;
        }
        let position = animation.from + (target - animation.from) * ease_out_cubic(t);
        host.set_scroll_top(position);
        self.last_scroll_top = position;
        true
    }

    /// Content changed. Only acts while pinned.
    ///
    /// Returns true if an animation is running afterwards.
    pub fn on_content_mutation(
        &mut self,
        host: &mut dyn ScrollHost,
        _mutation: ContentMutation,
        now: Instant,
    ) -> bool {
        if !self.state.is_pinned {
            return false;
        }
        self.scroll_to_bottom(host, ScrollBehavior::Smooth, now)
    }

    /// Returns true when the viewport is close enough to the top that older
    /// history should be fetched.
    #[must_use]
    pub fn should_load_older(&self, host: &dyn ScrollHost) -> bool {
        host.metrics().scroll_top <= LOAD_OLDER_THRESHOLD
    }
}
