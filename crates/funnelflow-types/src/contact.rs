//! Contact and activity types.
//!
//! Contacts are owned by the contact store; the engine reads them, mutates
//! tags under a version precondition, and applies allow-listed field updates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A marketing contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Set semantics, insertion ordered.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: Map<String, Value>,
    /// Optimistic concurrency counter, bumped on every write.
    #[serde(default)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// A new contact at version 0 with no tags or custom fields.
    pub fn new(email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            email: email.into(),
            first_name: None,
            last_name: None,
            phone: None,
            company: None,
            job_title: None,
            source: None,
            tags: Vec::new(),
            custom_fields: Map::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Apply an allow-listed field update in place. Returns true if anything changed.
    pub fn apply_update(
        &mut self,
        update: &ContactFieldUpdate,
        custom_fields: Option<&Map<String, Value>>,
    ) -> bool {
        let mut changed = false;
        let slots: [(&mut Option<String>, &Option<String>); 6] = [
            (&mut self.first_name, &update.first_name),
            (&mut self.last_name, &update.last_name),
            (&mut self.phone, &update.phone),
            (&mut self.company, &update.company),
            (&mut self.job_title, &update.job_title),
            (&mut self.source, &update.source),
        ];
        for (slot, value) in slots {
            if let Some(value) = value
                && slot.as_deref() != Some(value.as_str())
            {
                *slot = Some(value.clone());
                changed = true;
            }
        }
        if let Some(extra) = custom_fields {
            for (key, value) in extra {
                if self.custom_fields.get(key) != Some(value) {
                    self.custom_fields.insert(key.clone(), value.clone());
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Top-level contact fields the workflow engine is allowed to overwrite.
///
/// Identity (`email`), tags and custom fields are deliberately absent.
/// Numbers and booleans in a step config are accepted and stored as text,
/// so `phone: 5551234` reads the same as `phone: "5551234"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactFieldUpdate {
    #[serde(default, deserialize_with = "scalar_text", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, deserialize_with = "scalar_text", skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "scalar_text", skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "scalar_text", skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "scalar_text", skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(default, deserialize_with = "scalar_text", skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Read a string, number or boolean as text. `null` reads as unset.
fn scalar_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string, number or boolean, found {other}"
        ))),
    }
}

impl ContactFieldUpdate {
    pub fn is_empty(&self) -> bool {
        self.field_names().is_empty()
    }

    /// camelCase names of the fields this update sets.
    pub fn field_names(&self) -> Vec<&'static str> {
        [
            ("firstName", &self.first_name),
            ("lastName", &self.last_name),
            ("phone", &self.phone),
            ("company", &self.company),
            ("jobTitle", &self.job_title),
            ("source", &self.source),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_some())
        .map(|(name, _)| name)
        .collect()
    }

    /// Transform every set value (used for merge-tag resolution).
    pub fn map_values(&self, mut f: impl FnMut(&str) -> String) -> Self {
        let mut apply = |v: &Option<String>| v.as_deref().map(&mut f);
        Self {
            first_name: apply(&self.first_name),
            last_name: apply(&self.last_name),
            phone: apply(&self.phone),
            company: apply(&self.company),
            job_title: apply(&self.job_title),
            source: apply(&self.source),
        }
    }
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// Kind of activity recorded against a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    EmailSent,
    TagAdded,
    TagRemoved,
    ContactUpdated,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::EmailSent => "email_sent",
            ActivityType::TagAdded => "tag_added",
            ActivityType::TagRemoved => "tag_removed",
            ActivityType::ContactUpdated => "contact_updated",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_sent" => Ok(ActivityType::EmailSent),
            "tag_added" => Ok(ActivityType::TagAdded),
            "tag_removed" => Ok(ActivityType::TagRemoved),
            "contact_updated" => Ok(ActivityType::ContactUpdated),
            other => Err(format!("invalid activity type: {other}")),
        }
    }
}

/// One append-only activity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub activity_type: ActivityType,
    pub description: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        contact_id: Uuid,
        activity_type: ActivityType,
        description: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            contact_id,
            activity_type,
            description: description.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_contact_serializes_camel_case() {
        let mut contact = Contact::new("ada@example.com");
        contact.first_name = Some("Ada".to_string());
        contact.job_title = Some("Engineer".to_string());
        let json = serde_json::to_value(&contact).unwrap();
        assert_eq!(json["firstName"], "Ada");
        assert_eq!(json["jobTitle"], "Engineer");
        assert_eq!(json["version"], 0);
        assert!(json["tags"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_field_update_accepts_scalar_values() {
        let update: ContactFieldUpdate = serde_json::from_value(json!({
            "phone": 5551234,
            "company": "Analytical Engines",
            "source": true,
            "jobTitle": null,
        }))
        .unwrap();
        assert_eq!(update.phone.as_deref(), Some("5551234"));
        assert_eq!(update.company.as_deref(), Some("Analytical Engines"));
        assert_eq!(update.source.as_deref(), Some("true"));
        assert!(update.job_title.is_none());
        assert_eq!(update.field_names(), vec!["phone", "company", "source"]);

        let err = serde_json::from_value::<ContactFieldUpdate>(json!({ "phone": ["555"] }))
            .unwrap_err();
        assert!(err.to_string().contains("expected a string"), "{err}");
    }

    #[test]
    fn test_apply_update_merges_custom_fields() {
        let mut contact = Contact::new("ada@example.com");
        contact
            .custom_fields
            .insert("plan".to_string(), json!("free"));
        contact
            .custom_fields
            .insert("seats".to_string(), json!(1));

        let update = ContactFieldUpdate {
            company: Some("Analytical Engines".to_string()),
            ..Default::default()
        };
        let mut extra = Map::new();
        extra.insert("plan".to_string(), json!("pro"));

        assert!(contact.apply_update(&update, Some(&extra)));
        assert_eq!(contact.company.as_deref(), Some("Analytical Engines"));
        assert_eq!(contact.custom_fields["plan"], "pro");
        assert_eq!(contact.custom_fields["seats"], 1);

        // Same update again changes nothing.
        assert!(!contact.apply_update(&update, Some(&extra)));
    }

    #[test]
    fn test_field_update_names_and_map() {
        let update = ContactFieldUpdate {
            first_name: Some("{{ data.name }}".to_string()),
            source: Some("webinar".to_string()),
            ..Default::default()
        };
        assert_eq!(update.field_names(), vec!["firstName", "source"]);
        assert!(!update.is_empty());
        assert!(ContactFieldUpdate::default().is_empty());

        let upper = update.map_values(|s| s.to_uppercase());
        assert_eq!(upper.source.as_deref(), Some("WEBINAR"));
        assert!(upper.phone.is_none());
    }

    #[test]
    fn test_activity_type_roundtrip() {
        for ty in [
            ActivityType::EmailSent,
            ActivityType::TagAdded,
            ActivityType::TagRemoved,
            ActivityType::ContactUpdated,
        ] {
            assert_eq!(ty.as_str().parse::<ActivityType>().unwrap(), ty);
            assert_eq!(
                serde_json::to_string(&ty).unwrap(),
                format!("\"{}\"", ty.as_str())
            );
        }
        assert!("page_view".parse::<ActivityType>().is_err());
    }
}
