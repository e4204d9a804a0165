//! 签名手势回放
//!
//! 将笔画坐标转换为绝对坐标的指针事件序列。每一笔：按下、逐点移动、抬起。

use std::time::Duration;

use chartpilot_core::{PilotError, Stroke};
use tracing::{debug, info, warn};

use crate::config::GestureConfig;
use crate::driver::{PointerEvent, PointerKind, PortalDriver};
use crate::resolver::ElementResolver;

/// 回放时序
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GestureTiming {
    pub point_delay: Duration,
    pub stroke_pause: Duration,
}

impl Default for GestureTiming {
    fn default() -> Self {
        Self {
            point_delay: Duration::from_millis(10),
            stroke_pause: Duration::from_millis(50),
        }
    }
}

impl From<&GestureConfig> for GestureTiming {
    fn from(config: &GestureConfig) -> Self {
        Self {
            point_delay: Duration::from_millis(config.point_delay_ms),
            stroke_pause: Duration::from_millis(config.stroke_pause_ms),
        }
    }
}

/// 回放结果，由调用方决定是否降级处理
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    Completed { strokes: usize, events: usize },
    /// 未找到签名画布，没有派发任何事件
    SurfaceMissing,
    /// 中途失败，已派发的事件无法撤回
    Aborted { dispatched: usize, reason: String },
}

impl ReplayOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, ReplayOutcome::Completed { .. })
    }

    pub fn to_error(&self) -> Option<PilotError> {
        match self {
            ReplayOutcome::Completed { .. } => None,
            ReplayOutcome::SurfaceMissing => Some(PilotError::GestureAbort("signature surface not found".to_string())),
            ReplayOutcome::Aborted { dispatched, reason } => Some(PilotError::GestureAbort(format!(
                "aborted after {} events: {}",
                dispatched, reason
            ))),
        }
    }
}

/// 手势回放器
#[derive(Debug, Clone, Default)]
pub struct GestureReplay {
    timing: GestureTiming,
}

impl GestureReplay {
    pub fn new(timing: GestureTiming) -> Self {
        Self { timing }
    }

    pub fn timing(&self) -> GestureTiming {
        self.timing
    }

    /// 在画布上回放签名笔画，结束后总是回到默认文档
    pub async fn replay(
        &self,
        driver: &dyn PortalDriver,
        surface_candidates: &[String],
        strokes: &[Stroke],
    ) -> ReplayOutcome {
        let surface = match ElementResolver::resolve(driver, surface_candidates, true).await {
            Ok(surface) => surface,
            Err(PilotError::ElementNotFound(selectors)) => {
                warn!("Signature surface not found ({})", selectors);
                return ReplayOutcome::SurfaceMissing;
            }
            Err(e) => {
                warn!("Signature surface lookup failed: {}", e);
                return ReplayOutcome::Aborted {
                    dispatched: 0,
                    reason: e.to_string(),
                };
            }
        };

        let outcome = self.draw(driver, &surface.element, strokes).await;
        ElementResolver::release(driver).await;

        match &outcome {
            ReplayOutcome::Completed { strokes, events } => {
                info!("Signature replayed: {} strokes, {} pointer events", strokes, events)
            }
            ReplayOutcome::Aborted { dispatched, reason } => {
                warn!("Signature replay aborted after {} events: {}", dispatched, reason)
            }
            ReplayOutcome::SurfaceMissing => {}
        }
        outcome
    }

    async fn draw(
        &self,
        driver: &dyn PortalDriver,
        surface: &crate::driver::ElementRef,
        strokes: &[Stroke],
    ) -> ReplayOutcome {
        let origin = match driver.rect(surface).await {
            Ok(rect) => rect,
            Err(e) => {
                return ReplayOutcome::Aborted {
                    dispatched: 0,
                    reason: e.to_string(),
                }
            }
        };

        let drawable: Vec<&Stroke> = strokes.iter().filter(|stroke| !stroke.is_empty()).collect();
        let mut dispatched = 0usize;

        for (index, stroke) in drawable.iter().enumerate() {
            let (first, last) = match (stroke.first(), stroke.last()) {
                (Some(first), Some(last)) => (first, last),
                _ => continue,
            };

            let mut events = Vec::with_capacity(stroke.len() + 1);
            events.push(PointerEvent::new(PointerKind::Down, origin.x + first.x(), origin.y + first.y()));
            for point in &stroke[1..] {
                events.push(PointerEvent::new(PointerKind::Move, origin.x + point.x(), origin.y + point.y()));
            }
            events.push(PointerEvent::new(PointerKind::Up, origin.x + last.x(), origin.y + last.y()));

            for event in events {
                if event.kind == PointerKind::Move {
                    tokio::time::sleep(self.timing.point_delay).await;
                }
                if let Err(e) = driver.dispatch_pointer(event).await {
                    return ReplayOutcome::Aborted {
                        dispatched,
                        reason: e.to_string(),
                    };
                }
                dispatched += 1;
            }
            debug!("Stroke {} dispatched ({} points)", index, stroke.len());

            if index + 1 < drawable.len() {
                tokio::time::sleep(self.timing.stroke_pause).await;
            }
        }

        ReplayOutcome::Completed {
            strokes: drawable.len(),
            events: dispatched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Rect;
    use crate::scripted::{ScriptedDriver, ScriptedElement, ScriptedPage};
    use chartpilot_core::Point;

    fn canvas_selectors() -> Vec<String> {
        vec!["#signatureCanvas".to_string()]
    }

    async fn canvas_driver(in_frame: bool) -> ScriptedDriver {
        let canvas = ScriptedElement::new("canvas").matching("#signatureCanvas").rect(Rect {
            x: 100.0,
            y: 200.0,
            width: 400.0,
            height: 150.0,
        });
        let page = if in_frame {
            ScriptedPage::new().frame(vec![canvas])
        } else {
            ScriptedPage::new().element(canvas)
        };
        let driver = ScriptedDriver::new().with_page("sign", page);
        driver.start().await.unwrap();
        driver.navigate("sign").await.unwrap();
        driver
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_counts_and_order() {
        let driver = canvas_driver(false).await;
        let strokes: Vec<Stroke> = vec![
            vec![Point(0.0, 0.0), Point(5.0, 5.0), Point(10.0, 5.0)],
            vec![],
            vec![Point(20.0, 20.0)],
            vec![Point(1.0, 1.0), Point(2.0, 2.0)],
        ];

        let outcome = GestureReplay::default().replay(&driver, &canvas_selectors(), &strokes).await;
        assert_eq!(outcome, ReplayOutcome::Completed { strokes: 3, events: 9 });

        let kinds: Vec<PointerKind> = driver.pointer_events().iter().map(|e| e.kind).collect();
        use PointerKind::*;
        assert_eq!(kinds, vec![Down, Move, Move, Up, Down, Up, Down, Move, Up]);

        // N 次按下、N 次抬起、P - N 次移动
        let downs = kinds.iter().filter(|k| **k == Down).count();
        let moves = kinds.iter().filter(|k| **k == Move).count();
        assert_eq!(downs, 3);
        assert_eq!(moves, 6 - 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinates_offset_by_surface_origin() {
        let driver = canvas_driver(false).await;
        let strokes: Vec<Stroke> = vec![vec![Point(7.0, 3.0)]];

        GestureReplay::default().replay(&driver, &canvas_selectors(), &strokes).await;
        let events = driver.pointer_events();
        assert_eq!(events[0], PointerEvent::new(PointerKind::Down, 107.0, 203.0));
        assert_eq!(events[1], PointerEvent::new(PointerKind::Up, 107.0, 203.0));
    }

    #[tokio::test]
    async fn test_missing_surface_has_no_side_effects() {
        let driver = ScriptedDriver::new().with_page("sign", ScriptedPage::new());
        driver.start().await.unwrap();
        driver.navigate("sign").await.unwrap();

        let outcome = GestureReplay::default()
            .replay(&driver, &canvas_selectors(), &[vec![Point(1.0, 1.0)]])
            .await;
        assert_eq!(outcome, ReplayOutcome::SurfaceMissing);
        assert!(!outcome.succeeded());
        assert!(driver.pointer_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_replay_failure_reports_dispatched_and_restores_context() {
        let driver = canvas_driver(true).await;
        driver.fail_pointer_after(2);
        let strokes: Vec<Stroke> = vec![vec![Point(0.0, 0.0), Point(1.0, 1.0), Point(2.0, 2.0)]];

        let outcome = GestureReplay::default().replay(&driver, &canvas_selectors(), &strokes).await;
        assert!(matches!(outcome, ReplayOutcome::Aborted { dispatched: 2, .. }));
        assert!(matches!(outcome.to_error(), Some(PilotError::GestureAbort(_))));
        assert_eq!(driver.pointer_events().len(), 2);
        assert_eq!(driver.context(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_surface_is_released_after_success() {
        let driver = canvas_driver(true).await;
        let outcome = GestureReplay::default()
            .replay(&driver, &canvas_selectors(), &[vec![Point(1.0, 1.0), Point(2.0, 2.0)]])
            .await;
        assert!(outcome.succeeded());
        assert_eq!(driver.context(), None);
    }
}
