//! 元素定位
//!
//! 依次尝试候选选择器，先在当前文档中查找，再逐个进入默认文档的子框架。
//! 命中框架时停留在该框架内，直到调用 `release`；其余任何退出路径都会回到默认文档。

use chartpilot_core::{PilotError, Result};
use tracing::{debug, warn};

use crate::driver::{ElementRef, PortalDriver};

/// 定位结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub element: ElementRef,
    /// 由定位器切入的框架序号，`None` 表示在调用时的文档上下文中命中
    pub frame: Option<usize>,
}

/// 元素定位器
pub struct ElementResolver;

impl ElementResolver {
    /// 定位第一个满足条件的元素
    pub async fn resolve(
        driver: &dyn PortalDriver,
        candidates: &[String],
        must_be_visible: bool,
    ) -> Result<Resolved> {
        match Self::search(driver, candidates, must_be_visible).await {
            Ok(Some(resolved)) => {
                debug!("Resolved element {} (frame {:?})", resolved.element.id(), resolved.frame);
                Ok(resolved)
            }
            Ok(None) => {
                Self::release(driver).await;
                Err(PilotError::ElementNotFound(candidates.join(", ")))
            }
            Err(e) => {
                Self::release(driver).await;
                Err(e)
            }
        }
    }

    /// 回到默认文档
    pub async fn release(driver: &dyn PortalDriver) {
        if let Err(e) = driver.enter_default().await {
            warn!("Failed to restore default document context: {}", e);
        }
    }

    async fn search(
        driver: &dyn PortalDriver,
        candidates: &[String],
        must_be_visible: bool,
    ) -> Result<Option<Resolved>> {
        if let Some(element) = Self::search_context(driver, candidates, must_be_visible).await? {
            return Ok(Some(Resolved { element, frame: None }));
        }

        driver.enter_default().await?;
        let frames = driver.frame_count().await?;
        for index in 0..frames {
            driver.enter_default().await?;
            driver.enter_frame(index).await?;
            if let Some(element) = Self::search_context(driver, candidates, must_be_visible).await? {
                return Ok(Some(Resolved {
                    element,
                    frame: Some(index),
                }));
            }
        }

        Ok(None)
    }

    async fn search_context(
        driver: &dyn PortalDriver,
        candidates: &[String],
        must_be_visible: bool,
    ) -> Result<Option<ElementRef>> {
        for selector in candidates {
            let found = match driver.find_elements(selector).await {
                Ok(found) => found,
                Err(PilotError::ElementNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            for element in found {
                if !must_be_visible || driver.is_displayed(&element).await? {
                    return Ok(Some(element));
                }
            }
        }
        Ok(None)
    }
}
