//! Per-collection schemas
//!
//! A schema is an ordered list of declared fields (type, optional default,
//! optional uniqueness) plus optional hooks. Validation fails closed: a
//! present field whose value does not match the declared type rejects the
//! write. Uniqueness is only honored for scalar field types.

use crate::error::{DbError, DbResult};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// UTF-8 string
    String,
    /// Integer (i64/u64 range)
    Int,
    /// Any JSON number
    Float,
    /// Boolean
    Bool,
    /// JSON object
    Object,
    /// JSON array
    Array,
}

impl FieldType {
    /// Test a JSON value against this type.
    pub fn matches(&self, v: &Value) -> bool {
        match self {
            FieldType::String => v.is_string(),
            FieldType::Int => v.is_i64() || v.is_u64(),
            FieldType::Float => v.is_number(),
            FieldType::Bool => v.is_boolean(),
            FieldType::Object => v.is_object(),
            FieldType::Array => v.is_array(),
        }
    }

    /// Scalar types participate in unique constraints; containers do not.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, FieldType::Object | FieldType::Array)
    }
}

/// One declared field.
#[derive(Debug, Clone)]
pub struct SchemaField {
    /// Field name
    pub name: String,
    /// Declared type
    pub field_type: FieldType,
    /// Default inserted when the field is missing at save time
    pub default: Option<Value>,
    /// Enforce per-collection uniqueness (scalar types only)
    pub unique: bool,
}

impl SchemaField {
    /// Declare a field with no default.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        SchemaField {
            name: name.into(),
            field_type,
            default: None,
            unique: false,
        }
    }

    /// Attach a default value.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark the field unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Pre-save hook: may mutate the document; returns a message on rejection.
pub type PreSaveFn = Arc<dyn Fn(&mut Map<String, Value>) -> Result<(), String> + Send + Sync>;
/// Validation hook: read-only; returns a message on rejection.
pub type ValidateFn = Arc<dyn Fn(&Map<String, Value>) -> Result<(), String> + Send + Sync>;
/// Post-load hook: may mutate the freshly decoded document.
pub type PostLoadFn = Arc<dyn Fn(&mut Map<String, Value>) + Send + Sync>;

/// Declared field list plus optional hooks.
#[derive(Clone, Default)]
pub struct Schema {
    /// Ordered field declarations
    pub fields: Vec<SchemaField>,
    pre_save: Option<PreSaveFn>,
    post_load: Option<PostLoadFn>,
    validate: Option<ValidateFn>,
}

impl Schema {
    /// An empty schema (no validation).
    pub fn new() -> Self {
        Schema::default()
    }

    /// Add a field declaration.
    pub fn field(mut self, field: SchemaField) -> Self {
        self.fields.push(field);
        self
    }

    /// Install a pre-save hook. Runs after defaults and type checks.
    pub fn pre_save(
        mut self,
        f: impl Fn(&mut Map<String, Value>) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.pre_save = Some(Arc::new(f));
        self
    }

    /// Install a post-load hook. Runs after every decode.
    pub fn post_load(mut self, f: impl Fn(&mut Map<String, Value>) + Send + Sync + 'static) -> Self {
        self.post_load = Some(Arc::new(f));
        self
    }

    /// Install a validate hook. Runs when no pre-save hook is installed.
    pub fn validate(
        mut self,
        f: impl Fn(&Map<String, Value>) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(f));
        self
    }

    /// True iff saving through this schema performs any work.
    pub fn has_validate(&self) -> bool {
        self.validate.is_some() || self.pre_save.is_some() || !self.fields.is_empty()
    }

    /// True iff any field is declared unique.
    pub fn has_unique_fields(&self) -> bool {
        self.fields.iter().any(|f| f.unique)
    }

    /// Insert typed defaults for declared fields missing from `obj`.
    ///
    /// Object and Array defaults are empty containers regardless of the
    /// declared default value.
    pub fn apply_defaults(&self, obj: &mut Map<String, Value>) {
        for f in &self.fields {
            if obj.contains_key(&f.name) || f.default.is_none() {
                continue;
            }
            let value = match f.field_type {
                FieldType::Object => Value::Object(Map::new()),
                FieldType::Array => Value::Array(Vec::new()),
                _ => f.default.clone().unwrap_or(Value::Null),
            };
            obj.insert(f.name.clone(), value);
        }
    }

    /// Check every present declared field against its type. Fails closed.
    pub fn validate_types(&self, obj: &Map<String, Value>) -> bool {
        for f in &self.fields {
            match obj.get(&f.name) {
                None | Some(Value::Null) => {}
                Some(v) => {
                    if !f.field_type.matches(v) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Full pre-save pipeline: defaults, type check, then the pre-save hook
    /// if present, else the validate hook if present.
    pub fn run_pre_save(&self, obj: &mut Map<String, Value>) -> DbResult<()> {
        self.apply_defaults(obj);
        if !self.validate_types(obj) {
            return Err(DbError::validation("schema: invalid type"));
        }
        if let Some(pre) = &self.pre_save {
            return pre(obj).map_err(DbError::validation);
        }
        if let Some(check) = &self.validate {
            return check(obj).map_err(DbError::validation);
        }
        Ok(())
    }

    /// Run the post-load hook, if any.
    pub fn run_post_load(&self, obj: &mut Map<String, Value>) {
        if let Some(post) = &self.post_load {
            post(obj);
        }
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("fields", &self.fields)
            .field("pre_save", &self.pre_save.is_some())
            .field("post_load", &self.post_load.is_some())
            .field("validate", &self.validate.is_some())
            .finish()
    }
}
