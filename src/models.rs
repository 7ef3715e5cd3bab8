use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Template {
    pub id: i64,
    #[serde(rename = "adminId")]
    pub admin_id: String,
    #[serde(rename = "eventId")]
    pub event_id: i64,
    pub name: String,
    pub design: TemplateDesign,
    pub assets: std::collections::HashMap<String, String>,
    pub placeholders: std::collections::HashMap<String, String>,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TemplateDesign {
    pub layers: Vec<Layer>,
    pub settings: Settings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "paperWidth")]
    pub paper_width: f64,
    #[serde(rename = "paperHeight")]
    pub paper_height: f64,
    pub dpi: u32,
    pub orientation: String,
    #[serde(rename = "defaultLanguage")]
    pub default_language: String,
    #[serde(rename = "rtlSupport")]
    pub rtl_support: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Layer {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub position: Position,
    pub size: Size,
    pub style: Style,
    pub content: String,
    #[serde(rename = "dataBinding")]
    pub data_binding: String,
    pub children: Vec<Layer>,
    #[serde(rename = "zIndex")]
    pub z_index: i32,
    pub visible: bool,
    #[serde(rename = "parentId")]
    pub parent_id: String,
    #[serde(rename = "containerLayout")]
    pub container_layout: Option<ContainerLayout>,
    #[serde(rename = "autoFontSize")]
    pub auto_font_size: bool,
}

impl Default for Layer {
    fn default() -> Self {
        Self {
            id: String::new(),
            kind: String::new(),
            position: Position::default(),
            size: Size::default(),
            style: Style::default(),
            content: String::new(),
            data_binding: String::new(),
            children: Vec::new(),
            z_index: 0,
            visible: true,
            parent_id: String::new(),
            container_layout: None,
            auto_font_size: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Style {
    #[serde(rename = "fontSize")]
    pub font_size: f64,
    #[serde(rename = "fontFamily")]
    pub font_family: String,
    #[serde(rename = "fontWeight")]
    pub font_weight: String,
    pub color: String,
    #[serde(rename = "textAlign")]
    pub text_align: String,
    pub opacity: f64,
    #[serde(rename = "backgroundColor")]
    pub background_color: String,
    pub rotation: f64,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            font_size: 0.0,
            font_family: String::new(),
            font_weight: String::new(),
            color: String::new(),
            text_align: String::new(),
            opacity: 1.0,
            background_color: String::new(),
            rotation: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerLayout {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "flexDirection")]
    pub flex_direction: String,
    #[serde(rename = "justifyContent")]
    pub justify_content: String,
    #[serde(rename = "alignItems")]
    pub align_items: String,
    #[serde(rename = "flexGap")]
    pub flex_gap: f64,
    #[serde(rename = "flexWrap")]
    pub flex_wrap: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
    pub email: String,
    pub identifier: String,
    #[serde(rename = "customFieldValues")]
    pub custom_field_values: Vec<CustomFieldValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CustomFieldValue {
    #[serde(rename = "fieldId")]
    pub field_id: String,
    pub name: String,
    #[serde(rename = "fieldType")]
    pub field_type: String,
    pub value: String,
    pub label: String,
}

impl Template {
    /// Paper size in mm, falling back to the legacy top-level dimensions and
    /// finally to A4.
    pub fn paper_size(&self) -> (f64, f64) {
        let mut width = self.design.settings.paper_width;
        let mut height = self.design.settings.paper_height;
        if width == 0.0 {
            width = self.width;
        }
        if height == 0.0 {
            height = self.height;
        }
        if width == 0.0 {
            width = 210.0;
        }
        if height == 0.0 {
            height = 297.0;
        }
        (width, height)
    }

    pub fn dpi(&self) -> u32 {
        if self.design.settings.dpi == 0 {
            300
        } else {
            self.design.settings.dpi
        }
    }

    /// Resolve an `asset_<n>` layer reference against the asset map: exact
    /// key first, then substring containment for timestamped keys like
    /// `asset_0_1763558759124`.
    pub fn asset_url(&self, reference: &str) -> Option<&str> {
        if let Some(url) = self.assets.get(reference) {
            return Some(url.as_str());
        }
        self.assets
            .iter()
            .find(|(key, _)| key.contains(reference))
            .map(|(_, url)| url.as_str())
    }
}

impl User {
    pub fn field_value(&self, field_id: &str) -> Option<&str> {
        self.custom_field_values
            .iter()
            .find(|field| field.field_id == field_id)
            .map(|field| field.value.as_str())
    }
}

/// Unit of work for the preloader: one URL at one placed size.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub url: String,
    pub width_mm: f64,
    pub height_mm: f64,
    pub dpi: u32,
}

impl ImageRequest {
    pub fn pixel_size(&self) -> (u32, u32) {
        (
            mm_to_px(self.width_mm, self.dpi),
            mm_to_px(self.height_mm, self.dpi),
        )
    }
}

pub fn mm_to_px(mm: f64, dpi: u32) -> u32 {
    ((mm * dpi as f64) / 25.4).round() as u32
}

#[derive(Debug, Deserialize)]
pub struct GenerateBadgeRequest {
    #[serde(default)]
    pub template: Template,
    #[serde(default)]
    pub user: UserData,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserData {
    #[serde(default)]
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct BatchGenerateRequest {
    #[serde(default)]
    pub template: Template,
    #[serde(default)]
    pub users: Vec<UserData>,
}

#[derive(Debug, Deserialize)]
pub struct PreloadTemplateRequest {
    #[serde(default)]
    pub template: Template,
}

#[derive(Debug, Serialize)]
pub struct BatchGenerateResponse {
    pub success: bool,
    pub total: usize,
    pub results: Vec<BadgeResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BadgeResult {
    pub user_id: String,
    pub identifier: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdf_base64: Option<String>,
}
