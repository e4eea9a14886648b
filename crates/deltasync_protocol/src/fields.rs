//! Entity kinds and their typed field keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// The kinds of entity a delta can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A single emoji.
    Emoji,
    /// A named group of emojis.
    Group,
    /// Application settings.
    Settings,
    /// The favorites list.
    Favorites,
}

impl EntityKind {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Emoji => "emoji",
            EntityKind::Group => "group",
            EntityKind::Settings => "settings",
            EntityKind::Favorites => "favorites",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed field key for one entity kind.
pub trait FieldKey: Clone + Eq + Ord + Hash + fmt::Debug {
    /// Returns the field name as stored in snapshots.
    fn as_str(&self) -> &str;
}

/// Fields of an emoji.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmojiField {
    /// Display name.
    Name,
    /// Source URL.
    Url,
    /// Resolved display URL.
    DisplayUrl,
    /// Owning group.
    GroupId,
    /// Search tags.
    Tags,
    /// Pixel width.
    Width,
    /// Pixel height.
    Height,
    /// Sort position inside the group.
    Order,
}

impl FieldKey for EmojiField {
    fn as_str(&self) -> &str {
        match self {
            EmojiField::Name => "name",
            EmojiField::Url => "url",
            EmojiField::DisplayUrl => "display_url",
            EmojiField::GroupId => "group_id",
            EmojiField::Tags => "tags",
            EmojiField::Width => "width",
            EmojiField::Height => "height",
            EmojiField::Order => "order",
        }
    }
}

/// Fields of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupField {
    /// Display name.
    Name,
    /// Icon reference.
    Icon,
    /// Accent color.
    Color,
    /// Sort position among groups.
    Order,
    /// Ordered emoji ids.
    Emojis,
    /// Free-form description.
    Detail,
}

impl FieldKey for GroupField {
    fn as_str(&self) -> &str {
        match self {
            GroupField::Name => "name",
            GroupField::Icon => "icon",
            GroupField::Color => "color",
            GroupField::Order => "order",
            GroupField::Emojis => "emojis",
            GroupField::Detail => "detail",
        }
    }
}

/// Settings keys. Unknown keys are carried as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsField {
    /// Emoji image scale.
    ImageScale,
    /// Picker grid column count.
    GridColumns,
    /// Group shown on open.
    DefaultGroup,
    /// Whether the search bar is visible.
    ShowSearchBar,
    /// Color theme.
    Theme,
    /// Any other key.
    Custom(String),
}

impl FieldKey for SettingsField {
    fn as_str(&self) -> &str {
        match self {
            SettingsField::ImageScale => "image_scale",
            SettingsField::GridColumns => "grid_columns",
            SettingsField::DefaultGroup => "default_group",
            SettingsField::ShowSearchBar => "show_search_bar",
            SettingsField::Theme => "theme",
            SettingsField::Custom(key) => key,
        }
    }
}

/// Fields of a favorites entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FavoritesField {
    /// The favorited emoji.
    EmojiId,
}

impl FieldKey for FavoritesField {
    fn as_str(&self) -> &str {
        match self {
            FavoritesField::EmojiId => "emoji_id",
        }
    }
}
