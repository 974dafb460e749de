//! Entity metadata catalog
//!
//! Describes the entities exposed by the backend: their attributes, primary
//! key, relationships and which alternative row stores (recycle bin,
//! long-term archive) they support. Catalogs are read-only during a build.

use crate::error::{QueryError, Result};
use crate::planner::{datetime_type, Collation, GUID_TYPE};
use arrow::datatypes::DataType;
use serde::Deserialize;
use std::collections::HashMap;

/// Backend attribute types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Memo,
    Integer,
    BigInt,
    Decimal,
    Money,
    Double,
    Boolean,
    DateTime,
    UniqueIdentifier,
    Lookup,
    Owner,
    Customer,
    Picklist,
    State,
    Status,
    EntityName,
}

impl AttributeType {
    pub fn to_arrow(&self) -> DataType {
        match self {
            AttributeType::String | AttributeType::Memo | AttributeType::EntityName => {
                DataType::Utf8
            }
            AttributeType::Integer
            | AttributeType::Picklist
            | AttributeType::State
            | AttributeType::Status => DataType::Int32,
            AttributeType::BigInt => DataType::Int64,
            AttributeType::Decimal => DataType::Decimal128(23, 10),
            AttributeType::Money => DataType::Decimal128(19, 4),
            AttributeType::Double => DataType::Float64,
            AttributeType::Boolean => DataType::Boolean,
            AttributeType::DateTime => datetime_type(),
            AttributeType::UniqueIdentifier
            | AttributeType::Lookup
            | AttributeType::Owner
            | AttributeType::Customer => GUID_TYPE,
        }
    }
}

/// Attribute metadata
#[derive(Debug, Clone, Deserialize)]
pub struct AttributeMetadata {
    pub logical_name: String,
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Overrides the default collation of string attributes
    #[serde(default)]
    pub collation: Option<Collation>,
}

fn default_nullable() -> bool {
    true
}

impl AttributeMetadata {
    pub fn new(logical_name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            logical_name: logical_name.into(),
            attribute_type,
            nullable: true,
            collation: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn data_type(&self) -> DataType {
        self.attribute_type.to_arrow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RelationshipKind {
    #[serde(rename = "1:N")]
    OneToMany,
    #[serde(rename = "N:1")]
    ManyToOne,
    #[serde(rename = "N:N")]
    ManyToMany,
}

/// A relationship between this entity and another
#[derive(Debug, Clone, Deserialize)]
pub struct RelationshipMetadata {
    pub name: String,
    pub kind: RelationshipKind,
    /// Attribute on this entity
    pub attribute: String,
    pub related_entity: String,
    /// Attribute on the related entity
    pub related_attribute: String,
    /// Self-referencing parent/child relationship
    #[serde(default)]
    pub hierarchical: bool,
}

/// Entity metadata
#[derive(Debug, Clone, Deserialize)]
pub struct EntityMetadata {
    pub logical_name: String,
    pub primary_key: String,
    pub attributes: Vec<AttributeMetadata>,
    #[serde(default)]
    pub relationships: Vec<RelationshipMetadata>,
    #[serde(default)]
    pub recycle_bin_enabled: bool,
    #[serde(default)]
    pub archival_enabled: bool,
    #[serde(default)]
    pub estimated_row_count: Option<u64>,
}

impl EntityMetadata {
    /// Create entity metadata whose primary key is a non-null unique identifier
    pub fn new(logical_name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        let primary_key = primary_key.into();
        Self {
            logical_name: logical_name.into(),
            attributes: vec![
                AttributeMetadata::new(primary_key.clone(), AttributeType::UniqueIdentifier)
                    .not_null(),
            ],
            primary_key,
            relationships: vec![],
            recycle_bin_enabled: false,
            archival_enabled: false,
            estimated_row_count: None,
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeMetadata) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_relationship(mut self, relationship: RelationshipMetadata) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn with_recycle_bin(mut self, enabled: bool) -> Self {
        self.recycle_bin_enabled = enabled;
        self
    }

    pub fn with_archival(mut self, enabled: bool) -> Self {
        self.archival_enabled = enabled;
        self
    }

    pub fn with_estimated_rows(mut self, rows: u64) -> Self {
        self.estimated_row_count = Some(rows);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeMetadata> {
        self.attributes
            .iter()
            .find(|a| a.logical_name.eq_ignore_ascii_case(name))
    }

    /// Find the relationship joining `attribute` to `related_entity.related_attribute`
    pub fn find_relationship(
        &self,
        attribute: &str,
        related_entity: &str,
        related_attribute: &str,
    ) -> Option<&RelationshipMetadata> {
        self.relationships.iter().find(|r| {
            r.attribute.eq_ignore_ascii_case(attribute)
                && r.related_entity.eq_ignore_ascii_case(related_entity)
                && r.related_attribute.eq_ignore_ascii_case(related_attribute)
        })
    }

    fn validate(&self) -> Result<()> {
        if self.attribute(&self.primary_key).is_none() {
            return Err(QueryError::Metadata(format!(
                "Entity '{}' has no attribute for its primary key '{}'",
                self.logical_name, self.primary_key
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for attr in &self.attributes {
            if !seen.insert(attr.logical_name.to_lowercase()) {
                return Err(QueryError::Metadata(format!(
                    "Entity '{}' defines attribute '{}' more than once",
                    self.logical_name, attr.logical_name
                )));
            }
        }
        Ok(())
    }
}

/// Source of entity metadata
pub trait MetadataCatalog: Send + Sync {
    /// Look up an entity by logical name (case-insensitive)
    fn lookup(&self, name: &str) -> Result<EntityMetadata>;

    /// Names of all known entities
    fn entity_names(&self) -> Vec<String>;
}

/// Simple in-memory catalog
#[derive(Debug, Default)]
pub struct InMemoryMetadataCatalog {
    entities: HashMap<String, EntityMetadata>,
}

#[derive(Deserialize)]
struct CatalogDocument {
    entities: Vec<EntityMetadata>,
}

impl InMemoryMetadataCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity(&mut self, entity: EntityMetadata) {
        self.entities
            .insert(entity.logical_name.to_lowercase(), entity);
    }

    pub fn with_entity(mut self, entity: EntityMetadata) -> Self {
        self.register_entity(entity);
        self
    }

    /// Load a catalog from `{"entities": [...]}`
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: CatalogDocument = serde_json::from_str(json)?;
        let mut catalog = Self::new();
        for entity in doc.entities {
            entity.validate()?;
            catalog.register_entity(entity);
        }
        Ok(catalog)
    }
}

impl MetadataCatalog for InMemoryMetadataCatalog {
    fn lookup(&self, name: &str) -> Result<EntityMetadata> {
        self.entities
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| invalid_object_name(name, self.entity_names()))
    }

    fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entities
            .values()
            .map(|e| e.logical_name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Build an "invalid object name" error with close matches from `candidates`
pub fn invalid_object_name(name: &str, candidates: Vec<String>) -> QueryError {
    QueryError::InvalidObjectName {
        name: name.to_string(),
        suggestions: suggest(name, candidates),
    }
}

/// Candidates within a small edit distance of `name`, closest first
pub fn suggest(name: &str, candidates: Vec<String>) -> Vec<String> {
    let target = name.to_lowercase();
    let max_distance = (target.chars().count() / 3).clamp(1, 3);
    let mut scored: Vec<(usize, String)> = candidates
        .into_iter()
        .filter_map(|c| {
            let d = levenshtein_distance(&target, &c.to_lowercase());
            (d <= max_distance).then_some((d, c))
        })
        .collect();
    scored.sort();
    scored.into_iter().take(3).map(|(_, c)| c).collect()
}

/// Compute Levenshtein edit distance between two strings
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let m = s1_chars.len();
    let n = s2_chars.len();

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    let mut prev = (0..=n).collect::<Vec<_>>();
    let mut curr = vec![0; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(s1_chars[i - 1] != s2_chars[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[n]
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "entities": [
            {
                "logical_name": "account",
                "primary_key": "accountid",
                "attributes": [
                    {"logical_name": "accountid", "type": "uniqueidentifier", "nullable": false},
                    {"logical_name": "name", "type": "string"},
                    {"logical_name": "revenue", "type": "money"},
                    {"logical_name": "primarycontactid", "type": "lookup"}
                ],
                "relationships": [
                    {"name": "account_primary_contact", "kind": "N:1", "attribute": "primarycontactid",
                     "related_entity": "contact", "related_attribute": "contactid"}
                ],
                "recycle_bin_enabled": true
            },
            {
                "logical_name": "contact",
                "primary_key": "contactid",
                "attributes": [
                    {"logical_name": "contactid", "type": "uniqueidentifier", "nullable": false},
                    {"logical_name": "fullname", "type": "string", "collation": "Latin1_General_CS_AS"}
                ]
            }
        ]
    }"#;

    #[test]
    fn test_load_from_json() {
        let catalog = InMemoryMetadataCatalog::from_json(CATALOG).unwrap();
        let account = catalog.lookup("Account").unwrap();
        assert_eq!(account.primary_key, "accountid");
        assert!(account.recycle_bin_enabled);
        assert!(!account.archival_enabled);
        assert_eq!(account.attribute("REVENUE").unwrap().data_type(), DataType::Decimal128(19, 4));
        assert!(account
            .find_relationship("primarycontactid", "contact", "contactid")
            .is_some());

        let contact = catalog.lookup("contact").unwrap();
        let fullname = contact.attribute("fullname").unwrap();
        assert!(fullname.collation.as_ref().unwrap().is_case_sensitive());
    }

    #[test]
    fn test_unknown_entity_suggests_close_names() {
        let catalog = InMemoryMetadataCatalog::from_json(CATALOG).unwrap();
        let err = catalog.lookup("acount").unwrap_err();
        match err {
            QueryError::InvalidObjectName { suggestions, .. } => {
                assert_eq!(suggestions, vec!["account".to_string()])
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_missing_primary_key_attribute_rejected() {
        let json = r#"{"entities": [{"logical_name": "x", "primary_key": "xid", "attributes": []}]}"#;
        assert!(InMemoryMetadataCatalog::from_json(json).is_err());
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
    }
}
