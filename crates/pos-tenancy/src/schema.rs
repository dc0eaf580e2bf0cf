//! Entity kinds and collection schemas

use pos_common::{Namespace, RouterError, RouterResult, MAX_COLLECTION_NAME_LEN};
use pos_store::{CollectionSpec, Document};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

type FieldList = &'static [&'static str];
type KeyList = &'static [&'static [&'static str]];

const CATEGORY_REQUIRED: FieldList = &["_id", "name"];
const CATEGORY_UNIQUE: KeyList = &[&["name"]];
const PRODUCT_REQUIRED: FieldList = &["_id", "name", "sku", "price_cents"];
const PRODUCT_UNIQUE: KeyList = &[&["sku"]];
const CUSTOMER_REQUIRED: FieldList = &["_id", "name"];
const CUSTOMER_UNIQUE: KeyList = &[&["phone"]];
const PAYMENT_REQUIRED: FieldList = &["_id", "customer_id", "amount_cents", "method"];
const UNIT_REQUIRED: FieldList = &["_id", "name", "symbol"];
const UNIT_UNIQUE: KeyList = &[&["symbol"]];
const USER_REQUIRED: FieldList = &["_id", "username", "email", "password_hash", "role"];
const USER_UNIQUE: KeyList = &[&["tenant_id", "username"], &["tenant_id", "email"]];
const NO_UNIQUE_KEYS: KeyList = &[];

/// Tenant-scoped entity types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// `{prefix}_categories`
    Category,
    /// `{prefix}_products`
    Product,
    /// `{prefix}_customers`
    Customer,
    /// `{prefix}_customer_payments`
    CustomerPayment,
    /// `{prefix}_units`
    Unit,
    /// `{prefix}_users`, or `system_users` for administrators
    User,
}

impl EntityKind {
    /// Every kind
    pub const ALL: [EntityKind; 6] = [
        Self::Category,
        Self::Product,
        Self::Customer,
        Self::CustomerPayment,
        Self::Unit,
        Self::User,
    ];

    /// Plural collection suffix
    pub fn collection_suffix(&self) -> &'static str {
        match self {
            Self::Category => "categories",
            Self::Product => "products",
            Self::Customer => "customers",
            Self::CustomerPayment => "customer_payments",
            Self::Unit => "units",
            Self::User => "users",
        }
    }

    /// Kinds with a legacy un-prefixed collection
    pub fn supports_default_namespace(&self) -> bool {
        matches!(self, Self::Category | Self::Product | Self::Unit)
    }

    /// Kinds with a tenant-less system collection
    pub fn supports_system_namespace(&self) -> bool {
        matches!(self, Self::User)
    }

    /// Collection name for this kind in `namespace`
    pub fn collection_name(&self, namespace: &Namespace) -> RouterResult<String> {
        let suffix = self.collection_suffix();
        let name = match namespace {
            Namespace::Tenant(prefix) => format!("{}_{}", prefix, suffix),
            Namespace::System if self.supports_system_namespace() => format!("system_{}", suffix),
            Namespace::Default if self.supports_default_namespace() => suffix.to_string(),
            _ => {
                return Err(RouterError::validation(format!(
                    "{} has no {} namespace",
                    self, namespace
                )))
            }
        };

        if name.len() > MAX_COLLECTION_NAME_LEN {
            return Err(RouterError::validation(format!(
                "collection name is {} characters, limit is {}",
                name.len(),
                MAX_COLLECTION_NAME_LEN
            )));
        }
        Ok(name)
    }

    /// Schema descriptor
    pub fn schema(&self) -> SchemaDescriptor {
        let (required_fields, unique_keys) = match self {
            Self::Category => (CATEGORY_REQUIRED, CATEGORY_UNIQUE),
            Self::Product => (PRODUCT_REQUIRED, PRODUCT_UNIQUE),
            Self::Customer => (CUSTOMER_REQUIRED, CUSTOMER_UNIQUE),
            Self::CustomerPayment => (PAYMENT_REQUIRED, NO_UNIQUE_KEYS),
            Self::Unit => (UNIT_REQUIRED, UNIT_UNIQUE),
            Self::User => (USER_REQUIRED, USER_UNIQUE),
        };
        SchemaDescriptor {
            kind: *self,
            required_fields,
            unique_keys,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Category => "Category",
            Self::Product => "Product",
            Self::Customer => "Customer",
            Self::CustomerPayment => "CustomerPayment",
            Self::Unit => "Unit",
            Self::User => "User",
        };
        f.write_str(name)
    }
}

/// Shape constraints for one entity's collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaDescriptor {
    /// Entity the collection holds
    pub kind: EntityKind,
    /// Fields every document must carry
    pub required_fields: &'static [&'static str],
    /// Unique compound keys, scoped to the collection (and so to the tenant)
    pub unique_keys: &'static [&'static [&'static str]],
}

impl SchemaDescriptor {
    /// Driver spec for creating the collection
    pub fn collection_spec(&self, name: &str) -> CollectionSpec {
        CollectionSpec {
            name: name.to_string(),
            unique_indexes: self
                .unique_keys
                .iter()
                .map(|key| key.iter().map(|f| f.to_string()).collect())
                .collect(),
        }
    }

    /// Reject documents missing a required field
    pub fn validate_document(&self, doc: &Document) -> RouterResult<()> {
        if !doc.is_object() {
            return Err(RouterError::validation(format!("{} document is not an object", self.kind)));
        }
        for field in self.required_fields {
            match doc.get(*field) {
                None | Some(serde_json::Value::Null) => {
                    return Err(RouterError::validation(format!(
                        "{} document missing required field '{}'",
                        self.kind, field
                    )))
                }
                Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
                    return Err(RouterError::validation(format!(
                        "{} document has empty '{}'",
                        self.kind, field
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// A typed document stored in a per-tenant collection
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection kind this entity lives in
    const KIND: EntityKind;

    /// Primary key
    fn id(&self) -> &str;
}
