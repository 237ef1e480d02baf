//! Per-dispatch execution context and merge-tag resolution.
//!
//! `ExecutionContext` is the transient state handed to each step: the
//! resolved contact (if any), the accumulated data bag, and the identifiers
//! of the execution and workflow. Steps return new data entries which the
//! executor merges back.

use funnelflow_types::contact::Contact;
use funnelflow_types::workflow::DataBag;
use serde_json::{Value, json};
use uuid::Uuid;

use super::condition::resolve_path;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub contact: Option<Contact>,
    pub data: DataBag,
}

impl ExecutionContext {
    pub fn new(
        execution_id: Uuid,
        workflow_id: Uuid,
        contact: Option<Contact>,
        data: DataBag,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            contact,
            data,
        }
    }

    /// Merge step output into the data bag; later keys overwrite equal keys.
    pub fn merge(&mut self, entries: &DataBag) {
        for (key, value) in entries {
            self.data.insert(key.clone(), value.clone());
        }
    }

    /// The contact as JSON (camelCase), or `null`.
    pub fn contact_json(&self) -> Value {
        self.contact
            .as_ref()
            .and_then(|c| serde_json::to_value(c).ok())
            .unwrap_or(Value::Null)
    }

    /// JSON view used by the condition evaluator and merge tags:
    ///
    /// ```json
    /// { "contact": { "firstName": .., "tags": [..], .. } | null, "data": { .. } }
    /// ```
    pub fn to_value(&self) -> Value {
        json!({
            "contact": self.contact_json(),
            "data": self.data,
        })
    }

    /// Resolve `{{ contact.<path> }}` and `{{ data.<path> }}` merge tags.
    ///
    /// Whitespace inside the braces is optional. Tags that resolve to
    /// undefined or null render as an empty string. Tags with any other root
    /// are left untouched.
    pub fn resolve_template(&self, template: &str) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        let root = self.to_value();
        render_merge_tags(template, &root)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn render_merge_tags(template: &str, root: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + len + 2;
        let expr = rest[start + 2..end - 2].trim();

        out.push_str(&rest[..start]);
        if expr.starts_with("contact.") || expr.starts_with("data.") {
            if let Some(value) = resolve_path(root, expr) {
                out.push_str(&value_to_string(value));
            }
        } else {
            out.push_str(&rest[start..end]);
        }
        rest = &rest[end..];
    }

    out.push_str(rest);
    out
}

/// Convert a JSON value to display text for merge-tag substitution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> ExecutionContext {
        let mut contact = Contact::new("ada@example.com");
        contact.first_name = Some("Ada".to_string());
        contact.tags = vec!["lead".to_string()];
        contact
            .custom_fields
            .insert("plan".to_string(), json!("pro"));

        let mut data = DataBag::new();
        data.insert("score".to_string(), json!(42));
        data.insert("order".to_string(), json!({ "total": 19.5, "items": ["book"] }));
        ExecutionContext::new(Uuid::now_v7(), Uuid::now_v7(), Some(contact), data)
    }

    #[test]
    fn test_resolve_contact_and_data_tags() {
        let ctx = test_context();
        let result = ctx.resolve_template("Hi {{ contact.firstName }}, your score is {{data.score}}");
        assert_eq!(result, "Hi Ada, your score is 42");
    }

    #[test]
    fn test_resolve_nested_paths() {
        let ctx = test_context();
        assert_eq!(ctx.resolve_template("{{ contact.customFields.plan }}"), "pro");
        assert_eq!(ctx.resolve_template("{{ data.order.total }}"), "19.5");
        assert_eq!(ctx.resolve_template("{{ data.order.items }}"), "[\"book\"]");
    }

    #[test]
    fn test_undefined_tags_render_empty() {
        let ctx = test_context();
        assert_eq!(ctx.resolve_template("Hi {{ contact.lastName }}!"), "Hi !");
        assert_eq!(ctx.resolve_template("[{{ data.missing.deep }}]"), "[]");
    }

    #[test]
    fn test_foreign_and_malformed_tags_left_asis() {
        let ctx = test_context();
        assert_eq!(ctx.resolve_template("{{ unsubscribe_url }}"), "{{ unsubscribe_url }}");
        assert_eq!(ctx.resolve_template("open {{ data.score"), "open {{ data.score");
        assert_eq!(ctx.resolve_template("plain text"), "plain text");
    }

    #[test]
    fn test_no_contact_resolves_contact_tags_empty() {
        let mut ctx = test_context();
        ctx.contact = None;
        assert_eq!(ctx.resolve_template("Hi {{ contact.firstName }}"), "Hi ");
        assert_eq!(ctx.to_value()["contact"], Value::Null);
    }

    #[test]
    fn test_merge_overwrites_equal_keys() {
        let mut ctx = test_context();
        let mut update = DataBag::new();
        update.insert("score".to_string(), json!(7));
        update.insert("tier".to_string(), json!("gold"));
        ctx.merge(&update);
        assert_eq!(ctx.data["score"], 7);
        assert_eq!(ctx.data["tier"], "gold");
        assert!(ctx.data.contains_key("order"));
    }
}
