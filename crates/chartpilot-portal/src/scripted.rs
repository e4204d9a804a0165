//! 内存脚本驱动
//!
//! 以声明的方式描述页面、框架和元素，确定性地模拟门户行为。用于测试和本地演示，
//! 同时记录所有驱动事件以便断言。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chartpilot_core::{PilotError, Result};

use crate::driver::{ElementRef, PointerEvent, PortalDriver, Rect};

/// 页面中的元素声明
#[derive(Debug, Clone)]
pub struct ScriptedElement {
    tag: String,
    selectors: Vec<String>,
    text: String,
    attributes: HashMap<String, String>,
    displayed: bool,
    selected: bool,
    rect: Rect,
    navigates_to: Option<String>,
    children: Vec<ScriptedElement>,
}

impl ScriptedElement {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into().to_lowercase(),
            selectors: Vec::new(),
            text: String::new(),
            attributes: HashMap::new(),
            displayed: true,
            selected: false,
            rect: Rect::default(),
            navigates_to: None,
            children: Vec::new(),
        }
    }

    /// 复选框
    pub fn checkbox() -> Self {
        Self::new("input").attr("type", "checkbox")
    }

    /// 下拉选项
    pub fn option(label: &str, value: &str) -> Self {
        Self::new("option").text(label).attr("value", value)
    }

    /// 声明该元素能被哪个选择器命中
    pub fn matching(mut self, selector: impl Into<String>) -> Self {
        self.selectors.push(selector.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.displayed = false;
        self
    }

    pub fn selected(mut self, selected: bool) -> Self {
        self.selected = selected;
        self
    }

    pub fn rect(mut self, rect: Rect) -> Self {
        self.rect = rect;
        self
    }

    /// 点击后跳转
    pub fn navigates_to(mut self, url: impl Into<String>) -> Self {
        self.navigates_to = Some(url.into());
        self
    }

    pub fn child(mut self, child: ScriptedElement) -> Self {
        self.children.push(child);
        self
    }
}

/// 页面声明：默认文档加上若干子框架
#[derive(Debug, Clone, Default)]
pub struct ScriptedPage {
    elements: Vec<ScriptedElement>,
    frames: Vec<Vec<ScriptedElement>>,
}

impl ScriptedPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element(mut self, element: ScriptedElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn frame(mut self, elements: Vec<ScriptedElement>) -> Self {
        self.frames.push(elements);
        self
    }
}

/// 驱动事件记录
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Started,
    Navigated(String),
    EnteredFrame(usize),
    EnteredDefault,
    Clicked(String),
    Cleared(String),
    Typed { element: String, text: String },
    Pointer(PointerEvent),
    Quit,
}

#[derive(Debug)]
struct Node {
    tag: String,
    selectors: Vec<String>,
    text: String,
    attributes: HashMap<String, String>,
    displayed: bool,
    selected: bool,
    rect: Rect,
    navigates_to: Option<String>,
    value: String,
    parent: Option<usize>,
    children: Vec<usize>,
}

impl Node {
    fn matches(&self, selector: &str) -> bool {
        selector
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .any(|part| part == self.tag || self.selectors.iter().any(|s| s == part))
    }

    fn input_type(&self) -> Option<&str> {
        if self.tag == "input" {
            self.attributes.get("type").map(String::as_str)
        } else {
            None
        }
    }
}

enum Control {
    Checkbox,
    Radio,
    Option,
    Plain,
}

#[derive(Debug, Default)]
struct State {
    pages: HashMap<String, ScriptedPage>,
    nodes: Vec<Node>,
    roots: Vec<usize>,
    frames: Vec<Vec<usize>>,
    context: Option<usize>,
    current_url: Option<String>,
    started: bool,
    events: Vec<DriverEvent>,
    pointer_count: usize,
    fail_start: bool,
    fail_probe: bool,
    fail_frame_switch: bool,
    pointer_budget: Option<usize>,
}

impl State {
    fn load(&mut self, url: &str) {
        let page = self.pages.get(url).cloned().unwrap_or_default();
        self.nodes.clear();
        self.roots = page.elements.iter().map(|e| self.instantiate(e, None)).collect();
        self.frames = page
            .frames
            .iter()
            .map(|elements| elements.iter().map(|e| self.instantiate(e, None)).collect())
            .collect();
        self.context = None;
        self.current_url = Some(url.to_string());
    }

    fn instantiate(&mut self, element: &ScriptedElement, parent: Option<usize>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            tag: element.tag.clone(),
            selectors: element.selectors.clone(),
            text: element.text.clone(),
            attributes: element.attributes.clone(),
            displayed: element.displayed,
            selected: element.selected,
            rect: element.rect,
            navigates_to: element.navigates_to.clone(),
            value: element.attributes.get("value").cloned().unwrap_or_default(),
            parent,
            children: Vec::new(),
        });
        let children: Vec<usize> = element
            .children
            .iter()
            .map(|child| self.instantiate(child, Some(index)))
            .collect();
        self.nodes[index].children = children;
        index
    }

    fn ensure_started(&self) -> Result<()> {
        if self.started {
            Ok(())
        } else {
            Err(PilotError::ConnectionLost("scripted session not started".to_string()))
        }
    }

    fn node(&self, element: &ElementRef) -> Result<&Node> {
        Self::index_of(element)
            .and_then(|index| self.nodes.get(index))
            .ok_or_else(|| PilotError::ElementNotFound(format!("stale element {}", element.id())))
    }

    fn node_mut(&mut self, element: &ElementRef) -> Result<&mut Node> {
        Self::index_of(element)
            .and_then(|index| self.nodes.get_mut(index))
            .ok_or_else(|| PilotError::ElementNotFound(format!("stale element {}", element.id())))
    }

    fn index_of(element: &ElementRef) -> Option<usize> {
        element.id().strip_prefix("node-").and_then(|n| n.parse().ok())
    }

    fn collect(&self, from: &[usize], selector: &str, out: &mut Vec<ElementRef>) {
        for &index in from {
            let node = &self.nodes[index];
            if node.matches(selector) {
                out.push(ElementRef(format!("node-{}", index)));
            }
            self.collect(&node.children, selector, out);
        }
    }

    fn context_roots(&self) -> &[usize] {
        match self.context {
            Some(frame) => self.frames.get(frame).map(Vec::as_slice).unwrap_or(&[]),
            None => &self.roots,
        }
    }

    fn click(&mut self, element: &ElementRef) -> Result<()> {
        let index = Self::index_of(element)
            .filter(|i| *i < self.nodes.len())
            .ok_or_else(|| PilotError::ElementNotFound(format!("stale element {}", element.id())))?;
        self.events.push(DriverEvent::Clicked(element.id().to_string()));

        let node = &self.nodes[index];
        let target = node.navigates_to.clone();
        let parent = node.parent;
        let control = match (node.tag.as_str(), node.input_type()) {
            ("input", Some("checkbox")) => Control::Checkbox,
            ("input", Some("radio")) => Control::Radio,
            ("option", _) => Control::Option,
            _ => Control::Plain,
        };

        match control {
            Control::Checkbox => {
                let node = &mut self.nodes[index];
                node.selected = !node.selected;
            }
            Control::Radio => self.nodes[index].selected = true,
            Control::Option => {
                if let Some(parent) = parent {
                    let siblings = self.nodes[parent].children.clone();
                    for sibling in siblings {
                        self.nodes[sibling].selected = false;
                    }
                    let value = self.nodes[index].value.clone();
                    self.nodes[parent].value = value;
                }
                self.nodes[index].selected = true;
            }
            Control::Plain => {}
        }

        if let Some(url) = target {
            self.events.push(DriverEvent::Navigated(url.clone()));
            self.load(&url);
        }
        Ok(())
    }
}

/// 确定性的内存门户驱动，克隆共享同一状态
#[derive(Debug, Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<Mutex<State>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 注册页面
    pub fn with_page(self, url: impl Into<String>, page: ScriptedPage) -> Self {
        self.add_page(url, page);
        self
    }

    pub fn add_page(&self, url: impl Into<String>, page: ScriptedPage) {
        self.lock().pages.insert(url.into(), page);
    }

    /// 启动失败
    pub fn fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    /// 存活探测失败
    pub fn fail_probe(&self, fail: bool) {
        self.lock().fail_probe = fail;
    }

    /// 框架切换失败
    pub fn fail_frame_switch(&self, fail: bool) {
        self.lock().fail_frame_switch = fail;
    }

    /// 成功派发 `count` 个指针事件后开始失败
    pub fn fail_pointer_after(&self, count: usize) {
        self.lock().pointer_budget = Some(count);
    }

    pub fn events(&self) -> Vec<DriverEvent> {
        self.lock().events.clone()
    }

    pub fn pointer_events(&self) -> Vec<PointerEvent> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                DriverEvent::Pointer(pointer) => Some(*pointer),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// 当前所在框架，`None` 表示默认文档
    pub fn context(&self) -> Option<usize> {
        self.lock().context
    }

    pub fn current_page(&self) -> Option<String> {
        self.lock().current_url.clone()
    }

    /// 当前页面中第一个匹配元素的值（包括框架内）
    pub fn value_of(&self, selector: &str) -> Option<String> {
        self.first_node(selector, |node| node.value.clone())
    }

    /// 当前页面中第一个匹配元素是否被选中（包括框架内）
    pub fn is_checked(&self, selector: &str) -> Option<bool> {
        self.first_node(selector, |node| node.selected)
    }

    fn first_node<T>(&self, selector: &str, read: impl Fn(&Node) -> T) -> Option<T> {
        let state = self.lock();
        let mut found = Vec::new();
        state.collect(&state.roots, selector, &mut found);
        for frame in &state.frames {
            state.collect(frame, selector, &mut found);
        }
        found
            .first()
            .and_then(|element| state.node(element).ok())
            .map(read)
    }
}

#[async_trait::async_trait]
impl PortalDriver for ScriptedDriver {
    async fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if state.fail_start {
            return Err(PilotError::ConnectionLost("browser failed to start".to_string()));
        }
        state.started = true;
        state.events.push(DriverEvent::Started);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let mut state = self.lock();
        state.ensure_started()?;
        state.events.push(DriverEvent::Navigated(url.to_string()));
        state.load(url);
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let state = self.lock();
        state.ensure_started()?;
        if state.fail_probe {
            return Err(PilotError::ConnectionLost("browser not responding".to_string()));
        }
        Ok(state.current_url.clone().unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn find_elements(&self, selector: &str) -> Result<Vec<ElementRef>> {
        let state = self.lock();
        state.ensure_started()?;
        let mut found = Vec::new();
        state.collect(state.context_roots(), selector, &mut found);
        Ok(found)
    }

    async fn find_child_elements(&self, parent: &ElementRef, selector: &str) -> Result<Vec<ElementRef>> {
        let state = self.lock();
        state.ensure_started()?;
        let children = state.node(parent)?.children.clone();
        let mut found = Vec::new();
        state.collect(&children, selector, &mut found);
        Ok(found)
    }

    async fn frame_count(&self) -> Result<usize> {
        let state = self.lock();
        state.ensure_started()?;
        Ok(state.frames.len())
    }

    async fn enter_frame(&self, index: usize) -> Result<()> {
        let mut state = self.lock();
        state.ensure_started()?;
        if state.fail_frame_switch {
            return Err(PilotError::ConnectionLost("frame switch failed".to_string()));
        }
        if index >= state.frames.len() {
            return Err(PilotError::ElementNotFound(format!("no such frame: {}", index)));
        }
        state.context = Some(index);
        state.events.push(DriverEvent::EnteredFrame(index));
        Ok(())
    }

    async fn enter_default(&self) -> Result<()> {
        let mut state = self.lock();
        state.ensure_started()?;
        state.context = None;
        state.events.push(DriverEvent::EnteredDefault);
        Ok(())
    }

    async fn is_displayed(&self, element: &ElementRef) -> Result<bool> {
        Ok(self.lock().node(element)?.displayed)
    }

    async fn tag_name(&self, element: &ElementRef) -> Result<String> {
        Ok(self.lock().node(element)?.tag.clone())
    }

    async fn attribute(&self, element: &ElementRef, name: &str) -> Result<Option<String>> {
        let state = self.lock();
        let node = state.node(element)?;
        if name == "value" && (node.attributes.contains_key("value") || matches!(node.tag.as_str(), "input" | "textarea" | "select")) {
            return Ok(Some(node.value.clone()));
        }
        Ok(node.attributes.get(name).cloned())
    }

    async fn text(&self, element: &ElementRef) -> Result<String> {
        Ok(self.lock().node(element)?.text.clone())
    }

    async fn is_selected(&self, element: &ElementRef) -> Result<bool> {
        Ok(self.lock().node(element)?.selected)
    }

    async fn click(&self, element: &ElementRef) -> Result<()> {
        let mut state = self.lock();
        state.ensure_started()?;
        state.click(element)
    }

    async fn clear(&self, element: &ElementRef) -> Result<()> {
        let mut state = self.lock();
        state.node_mut(element)?.value.clear();
        state.events.push(DriverEvent::Cleared(element.id().to_string()));
        Ok(())
    }

    async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<()> {
        let mut state = self.lock();
        state.node_mut(element)?.value.push_str(text);
        state.events.push(DriverEvent::Typed {
            element: element.id().to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn rect(&self, element: &ElementRef) -> Result<Rect> {
        Ok(self.lock().node(element)?.rect)
    }

    async fn dispatch_pointer(&self, event: PointerEvent) -> Result<()> {
        let mut state = self.lock();
        state.ensure_started()?;
        if let Some(budget) = state.pointer_budget {
            if state.pointer_count >= budget {
                return Err(PilotError::ConnectionLost("pointer dispatch failed".to_string()));
            }
        }
        state.pointer_count += 1;
        state.events.push(DriverEvent::Pointer(event));
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        let mut state = self.lock();
        state.started = false;
        state.events.push(DriverEvent::Quit);
        Ok(())
    }
}
