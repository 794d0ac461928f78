//! Per-layer field schema.
//!
//! A [`FieldCatalog`] is the ordered list of declared fields for one
//! layer. Indices are handed out at registration and stay stable for the
//! layer's lifetime; fields are only ever appended. Lookup keys are the
//! raw (unlaundered) names so that tag matching keeps working when the
//! visible name had its punctuation rewritten.

use std::collections::HashMap;

/// Semantic type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    Integer64,
    /// Double-precision float.
    Real,
    /// UTF-8 text.
    Text,
    /// Civil date and time.
    DateTime,
}

/// Optional refinement of a field's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldSubtype {
    /// No refinement.
    #[default]
    None,
    /// Boolean stored in an integer field.
    Boolean,
    /// Single-precision float stored in a real field.
    Float32,
}

/// Role a field plays during materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain attribute, populated from a matching tag key.
    Ordinary,
    /// The node identifier field (`osm_id`).
    Id,
    /// The way identifier field (`osm_way_id`).
    WayId,
    /// Aggregated blob of tags not mapped to a declared field.
    OtherTags,
    /// Aggregated blob of every tag.
    AllTags,
}

/// One declared field.
#[derive(Debug, Clone)]
pub struct FieldDef {
    name: String,
    visible_name: String,
    field_type: FieldType,
    subtype: FieldSubtype,
    kind: FieldKind,
}

impl FieldDef {
    /// Raw name as registered; the tag-matching key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Externally visible name, possibly laundered.
    pub fn visible_name(&self) -> &str {
        &self.visible_name
    }

    /// Declared semantic type.
    pub const fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Declared subtype refinement.
    pub const fn subtype(&self) -> FieldSubtype {
        self.subtype
    }

    /// Role during materialization.
    pub const fn kind(&self) -> FieldKind {
        self.kind
    }
}

/// Ordered, append-only schema for one layer.
#[derive(Debug, Default)]
pub struct FieldCatalog {
    fields: Vec<FieldDef>,
    by_name: HashMap<String, usize>,
    launder: bool,
    id_index: Option<usize>,
    way_id_index: Option<usize>,
    other_tags_index: Option<usize>,
    all_tags_index: Option<usize>,
}

impl FieldCatalog {
    /// Create an empty catalog. `launder` rewrites colons to underscores
    /// in visible names.
    pub fn new(launder: bool) -> Self {
        Self {
            launder,
            ..Self::default()
        }
    }

    /// Append a field and return its stable index.
    ///
    /// The names `osm_id`, `osm_way_id`, `other_tags` and `all_tags` are
    /// recognised case-sensitively and given their special roles.
    pub fn add_field(&mut self, name: &str, field_type: FieldType, subtype: FieldSubtype) -> usize {
        let index = self.fields.len();
        let kind = match name {
            "osm_id" => {
                self.id_index = Some(index);
                FieldKind::Id
            }
            "osm_way_id" => {
                self.way_id_index = Some(index);
                FieldKind::WayId
            }
            "other_tags" => {
                self.other_tags_index = Some(index);
                FieldKind::OtherTags
            }
            "all_tags" => {
                self.all_tags_index = Some(index);
                FieldKind::AllTags
            }
            _ => FieldKind::Ordinary,
        };
        self.fields.push(FieldDef {
            name: name.to_owned(),
            visible_name: self.launder_name(name),
            field_type,
            subtype,
            kind,
        });
        self.by_name.insert(name.to_owned(), index);
        index
    }

    /// Look up a field index by its raw name.
    pub fn find_field(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// True when `name` collides with a raw or visible field name.
    pub fn has_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
            || self.fields.iter().any(|field| field.visible_name == name)
    }

    /// The field at `index`, if declared.
    pub fn field(&self, index: usize) -> Option<&FieldDef> {
        self.fields.get(index)
    }

    /// Number of declared fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no field is declared.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over declared fields in index order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }

    /// Index of the `osm_id` field, if declared.
    pub const fn id_index(&self) -> Option<usize> {
        self.id_index
    }

    /// Index of the `osm_way_id` field, if declared.
    pub const fn way_id_index(&self) -> Option<usize> {
        self.way_id_index
    }

    /// Index of the `other_tags` blob field, if declared.
    pub const fn other_tags_index(&self) -> Option<usize> {
        self.other_tags_index
    }

    /// Index of the `all_tags` blob field, if declared.
    pub const fn all_tags_index(&self) -> Option<usize> {
        self.all_tags_index
    }

    fn launder_name(&self, name: &str) -> String {
        if self.launder && name.contains(':') {
            name.replace(':', "_")
        } else {
            name.to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn catalog_with(names: &[&str]) -> FieldCatalog {
        let mut catalog = FieldCatalog::new(true);
        for name in names {
            catalog.add_field(name, FieldType::Text, FieldSubtype::None);
        }
        catalog
    }

    #[rstest]
    fn launders_visible_name_but_keeps_raw_lookup() {
        let catalog = catalog_with(&["a:b:c"]);
        let index = catalog.find_field("a:b:c").expect("raw lookup");
        let field = catalog.field(index).expect("declared field");
        assert_eq!(field.visible_name(), "a_b_c");
        assert_eq!(field.name(), "a:b:c");
        assert_eq!(catalog.find_field("a_b_c"), None);
    }

    #[rstest]
    fn laundering_disabled_keeps_colons() {
        let mut catalog = FieldCatalog::new(false);
        let index = catalog.add_field("addr:city", FieldType::Text, FieldSubtype::None);
        assert_eq!(
            catalog.field(index).map(FieldDef::visible_name),
            Some("addr:city")
        );
    }

    #[rstest]
    #[case("osm_id", FieldKind::Id)]
    #[case("osm_way_id", FieldKind::WayId)]
    #[case("other_tags", FieldKind::OtherTags)]
    #[case("all_tags", FieldKind::AllTags)]
    #[case("name", FieldKind::Ordinary)]
    fn recognises_special_names(#[case] name: &str, #[case] kind: FieldKind) {
        let catalog = catalog_with(&[name]);
        assert_eq!(catalog.field(0).map(FieldDef::kind), Some(kind));
    }

    #[rstest]
    fn indices_are_stable_and_append_only() {
        let mut catalog = catalog_with(&["name", "highway"]);
        assert_eq!(catalog.find_field("name"), Some(0));
        assert_eq!(catalog.find_field("highway"), Some(1));
        let appended = catalog.add_field("railway", FieldType::Text, FieldSubtype::None);
        assert_eq!(appended, 2);
        assert_eq!(catalog.find_field("name"), Some(0));
    }

    #[rstest]
    fn collision_check_covers_visible_names() {
        let catalog = catalog_with(&["a:b"]);
        assert!(catalog.has_name("a:b"));
        assert!(catalog.has_name("a_b"));
        assert!(!catalog.has_name("a-b"));
    }
}
