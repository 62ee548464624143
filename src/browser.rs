//! Browser driver contract and accessibility types.
//!
//! The engine never talks to a concrete automation backend; it consumes this
//! trait. Network traffic is delivered as a push stream: the driver forwards
//! every completed request/response pair into the sink registered with
//! [`BrowserDriver::on_request_response`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::Result;

/// One completed request/response pair as delivered by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExchange {
    pub method: String,
    pub url: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: Option<String>,
    pub status: u16,
    pub response_headers: HashMap<String, String>,
    pub response_body: Option<String>,
}

/// Sink for the driver's network push stream.
pub type NetworkSink = mpsc::UnboundedSender<RawExchange>;

/// Click target: a CSS selector or an overlay element id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickTarget {
    Selector(String),
    Element(u32),
}

impl std::fmt::Display for ClickTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Selector(s) => write!(f, "{}", s),
            Self::Element(id) => write!(f, "[{}]", id),
        }
    }
}

/// Scroll direction for [`BrowserDriver::scroll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// Kind of UI action the engine can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Select,
    Scroll,
    Navigate,
    Back,
    Hover,
    Wait,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Click => write!(f, "click"),
            Self::Type => write!(f, "type"),
            Self::Select => write!(f, "select"),
            Self::Scroll => write!(f, "scroll"),
            Self::Navigate => write!(f, "navigate"),
            Self::Back => write!(f, "back"),
            Self::Hover => write!(f, "hover"),
            Self::Wait => write!(f, "wait"),
        }
    }
}

/// Timestamped description of one executed UI action. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ActionRecord {
    pub fn new(kind: ActionKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            payload: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Contract with the browser automation backend.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Start the browser and open the session page.
    async fn start(&self) -> Result<()>;

    /// Stop the browser and release resources.
    async fn stop(&self) -> Result<()>;

    async fn navigate(&self, url: &str) -> Result<()>;
    async fn click(&self, target: &ClickTarget) -> Result<()>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;
    async fn select(&self, selector: &str, value: &str) -> Result<()>;
    async fn scroll(&self, direction: ScrollDirection) -> Result<()>;
    async fn go_back(&self) -> Result<()>;
    async fn hover(&self, selector: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;
    async fn title(&self) -> Result<String>;
    async fn screenshot(&self) -> Result<Vec<u8>>;
    async fn page_eval(&self, script: &str) -> Result<Value>;

    /// Current accessibility tree snapshot, if the page exposes one.
    async fn accessibility_snapshot(&self) -> Result<Option<AxNode>>;

    /// Refresh the element overlay and return the enumerated elements.
    async fn overlay_elements(&self) -> Result<Vec<OverlayElement>>;

    /// Direct query of anchors/buttons/onclick elements, bypassing the overlay.
    async fn query_clickables(&self) -> Result<Vec<OverlayElement>>;

    /// Forms currently present on the page with their input fields.
    async fn forms(&self) -> Result<Vec<FormInfo>>;

    /// Register the sink that receives every request/response pair.
    fn on_request_response(&self, sink: NetworkSink);
}

/// Accessibility roles considered interactive (clickable/focusable).
pub const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "checkbox",
    "radio",
    "combobox",
    "listbox",
    "option",
    "menuitem",
    "tab",
    "searchbox",
    "slider",
    "spinbutton",
    "switch",
    "treeitem",
    "gridcell",
];

/// A node of the accessibility tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AxNode {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AxNode>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub selected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

impl AxNode {
    pub fn new(role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_children(mut self, children: Vec<AxNode>) -> Self {
        self.children = children;
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn is_interactive(&self) -> bool {
        INTERACTIVE_ROLES.contains(&self.role.as_str())
    }
}

/// Render the tree as an indented, token-efficient listing. Interactive
/// elements get `[n]` overlay ids so an LLM can reference them.
pub fn format_tree(node: &AxNode, include_ids: bool) -> String {
    let mut lines = Vec::new();
    let mut counter = 0u32;
    format_node(node, include_ids, 0, &mut counter, &mut lines);
    lines.join("\n")
}

fn format_node(
    node: &AxNode,
    include_ids: bool,
    depth: usize,
    counter: &mut u32,
    lines: &mut Vec<String>,
) {
    if node.role.is_empty() && node.name.is_empty() {
        for child in &node.children {
            format_node(child, include_ids, depth, counter, lines);
        }
        return;
    }

    let mut parts = Vec::new();

    if include_ids && node.is_interactive() {
        parts.push(format!("[{}]", counter));
        *counter += 1;
    }

    if !node.role.is_empty() {
        parts.push(node.role.to_uppercase());
    }

    if !node.name.is_empty() {
        parts.push(format!("\"{}\"", truncate(&node.name, 100)));
    }

    if let Some(value) = &node.value {
        if !value.is_empty() {
            parts.push(format!("(value: \"{}\")", truncate(value, 50)));
        }
    }

    let mut states = Vec::new();
    if node.disabled {
        states.push("disabled");
    }
    if node.checked == Some(true) {
        states.push("checked");
    }
    if node.selected {
        states.push("selected");
    }
    match node.expanded {
        Some(true) => states.push("expanded"),
        Some(false) => states.push("collapsed"),
        None => {}
    }
    if node.required {
        states.push("required");
    }
    if !states.is_empty() {
        parts.push(format!("[{}]", states.join(", ")));
    }

    lines.push(format!("{}{}", "  ".repeat(depth), parts.join(" ")));

    for child in &node.children {
        format_node(child, include_ids, depth + 1, counter, lines);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let prefix: String = s.chars().take(max).collect();
        format!("{}...", prefix)
    } else {
        s.to_string()
    }
}

/// Collect interactive elements with the same id assignment order as
/// [`format_tree`].
pub fn collect_interactive(node: &AxNode) -> Vec<InteractiveNode> {
    let mut elements = Vec::new();
    let mut counter = 0u32;
    collect_interactive_inner(node, &mut counter, &mut elements);
    elements
}

fn collect_interactive_inner(node: &AxNode, counter: &mut u32, out: &mut Vec<InteractiveNode>) {
    if node.is_interactive() {
        out.push(InteractiveNode {
            id: *counter,
            role: node.role.clone(),
            name: node.name.clone(),
            disabled: node.disabled,
        });
        *counter += 1;
    }
    for child in &node.children {
        collect_interactive_inner(child, counter, out);
    }
}

/// An interactive element extracted from the accessibility tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveNode {
    pub id: u32,
    pub role: String,
    pub name: String,
    pub disabled: bool,
}

/// An element enumerated by the injected page overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayElement {
    /// Integer id assigned by the overlay
    pub id: u32,
    /// Tag name, lower-case (a, button, div, ...)
    pub tag: String,
    /// Visible/accessible text
    #[serde(default)]
    pub text: String,
    /// href attribute for anchors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    /// Input type for form controls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
}

/// A form detected on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormInfo {
    pub index: usize,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub method: String,
    pub fields: Vec<FormField>,
}

/// One input field of a form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub tag: String,
    #[serde(default)]
    pub input_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub required: bool,
}
