//! Tenant-scoped entities
//!
//! Only the fields needed to build and exercise collection schemas live
//! here; pricing, tax and invoice rules belong to the business services.

use crate::schema::{Entity, EntityKind};
use chrono::{DateTime, Utc};
use hmac::digest::{CtOutput, Output, OutputSizeUser};
use hmac::{Hmac, Mac};
use pos_common::normalize_key;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Product category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    /// Document id
    #[serde(rename = "_id")]
    pub id: String,
    /// Display name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Category {
    /// New category with a fresh id
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.trim().to_string(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Category {
    const KIND: EntityKind = EntityKind::Category;
    fn id(&self) -> &str {
        &self.id
    }
}

/// Sellable product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Document id
    #[serde(rename = "_id")]
    pub id: String,
    /// Display name
    pub name: String,
    /// Stock keeping unit, unique per store
    pub sku: String,
    /// Scannable barcode, unique per store when set
    #[serde(default)]
    pub barcode: Option<String>,
    /// Unit price in minor currency units
    pub price_cents: i64,
    /// Owning category
    #[serde(default)]
    pub category_id: Option<String>,
    /// Unit of measure
    #[serde(default)]
    pub unit_id: Option<String>,
    /// Units on hand
    #[serde(default)]
    pub stock: i64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// New product with no stock
    pub fn new(name: &str, sku: &str, price_cents: i64) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.trim().to_string(),
            sku: sku.trim().to_string(),
            barcode: None,
            price_cents,
            category_id: None,
            unit_id: None,
            stock: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Product {
    const KIND: EntityKind = EntityKind::Product;
    fn id(&self) -> &str {
        &self.id
    }
}

/// Store customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    /// Document id
    #[serde(rename = "_id")]
    pub id: String,
    /// Display name
    pub name: String,
    /// Contact phone, unique per store when set
    #[serde(default)]
    pub phone: Option<String>,
    /// Contact email
    #[serde(default)]
    pub email: Option<String>,
    /// Outstanding balance in minor currency units
    #[serde(default)]
    pub balance_cents: i64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    /// New customer with a zero balance
    pub fn new(name: &str, phone: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.trim().to_string(),
            phone: phone.map(|p| p.trim().to_string()),
            email: None,
            balance_cents: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Customer {
    const KIND: EntityKind = EntityKind::Customer;
    fn id(&self) -> &str {
        &self.id
    }
}

/// Payment method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Cash at the till
    Cash,
    /// Card terminal
    Card,
    /// Bank transfer
    BankTransfer,
}

/// Payment received from a customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerPayment {
    /// Document id
    #[serde(rename = "_id")]
    pub id: String,
    /// Paying customer
    pub customer_id: String,
    /// Amount in minor currency units
    pub amount_cents: i64,
    /// How the payment was made
    pub method: PaymentMethod,
    /// Free-form note
    #[serde(default)]
    pub note: Option<String>,
    /// When the payment was received
    pub paid_at: DateTime<Utc>,
}

impl CustomerPayment {
    /// Payment received now
    pub fn new(customer_id: &str, amount_cents: i64, method: PaymentMethod) -> Self {
        Self {
            id: new_id(),
            customer_id: customer_id.to_string(),
            amount_cents,
            method,
            note: None,
            paid_at: Utc::now(),
        }
    }
}

impl Entity for CustomerPayment {
    const KIND: EntityKind = EntityKind::CustomerPayment;
    fn id(&self) -> &str {
        &self.id
    }
}

/// Unit of measure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Document id
    #[serde(rename = "_id")]
    pub id: String,
    /// Display name
    pub name: String,
    /// Short symbol (`kg`, `pcs`)
    pub symbol: String,
}

impl Unit {
    /// New unit with a fresh id
    pub fn new(name: &str, symbol: &str) -> Self {
        Self {
            id: new_id(),
            name: name.trim().to_string(),
            symbol: symbol.trim().to_string(),
        }
    }
}

impl Entity for Unit {
    const KIND: EntityKind = EntityKind::Unit;
    fn id(&self) -> &str {
        &self.id
    }
}

/// PBKDF2-HMAC-SHA256 password hash, `pbkdf2-sha256$<rounds>$<salt>$<digest>`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PasswordHash(String);

type HmacSha256 = Hmac<Sha256>;

const HASH_SCHEME: &str = "pbkdf2-sha256";
const HASH_ROUNDS: u32 = 10_000;

impl PasswordHash {
    /// Hash a plaintext password with a fresh random salt
    pub fn new(password: &str) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_salt(password, &salt, HASH_ROUNDS)
    }

    fn with_salt(password: &str, salt: &[u8], rounds: u32) -> Self {
        let digest = stretch(password, salt, rounds).map(hex::encode).unwrap_or_default();
        Self(format!("{}${}${}${}", HASH_SCHEME, rounds, hex::encode(salt), digest))
    }

    /// Check a plaintext password; the digest comparison is constant time
    pub fn verify(&self, password: &str) -> bool {
        let parts: Vec<&str> = self.0.split('$').collect();
        let [scheme, rounds, salt_hex, expected_hex] = parts[..] else {
            return false;
        };
        if scheme != HASH_SCHEME {
            return false;
        }

        let (Ok(rounds), Ok(salt), Ok(expected)) =
            (rounds.parse::<u32>(), hex::decode(salt_hex), hex::decode(expected_hex))
        else {
            return false;
        };
        if rounds == 0 || expected.len() != <HmacSha256 as OutputSizeUser>::output_size() {
            return false;
        }

        match stretch(password, &salt, rounds) {
            Some(actual) => {
                CtOutput::<HmacSha256>::new(actual)
                    == CtOutput::new(Output::<HmacSha256>::clone_from_slice(&expected))
            }
            None => false,
        }
    }
}

/// Single-block PBKDF2 with HMAC-SHA256 as the PRF
fn stretch(password: &str, salt: &[u8], rounds: u32) -> Option<Output<HmacSha256>> {
    let prf = HmacSha256::new_from_slice(password.as_bytes()).ok()?;

    let mut mac = prf.clone();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut block = mac.finalize().into_bytes();
    let mut derived = block.clone();

    for _ in 1..rounds {
        let mut mac = prf.clone();
        mac.update(&block);
        block = mac.finalize().into_bytes();
        for (d, b) in derived.iter_mut().zip(block.iter()) {
            *d ^= b;
        }
    }
    Some(derived)
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordHash(***)")
    }
}

/// User role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Every permission, across all stores
    SuperAdmin,
    /// Full control of one store
    Admin,
    /// Catalog and customers, read-only payments
    Manager,
    /// Point-of-sale operator
    Cashier,
}

impl Role {
    /// Default permission set
    pub fn permissions(&self) -> Vec<&'static str> {
        match self {
            Self::SuperAdmin => vec!["*"],
            Self::Admin => vec!["products:*", "categories:*", "customers:*", "payments:*", "units:*", "users:*"],
            Self::Manager => vec!["products:*", "categories:*", "customers:*", "payments:read", "units:*"],
            Self::Cashier => vec!["products:read", "customers:read", "payments:create"],
        }
    }
}

/// Store user or system administrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Document id
    #[serde(rename = "_id")]
    pub id: String,
    /// Owning store id; `None` for system administrators
    pub tenant_id: Option<String>,
    /// Login name, lowercased
    pub username: String,
    /// Login email, lowercased
    pub email: String,
    /// Display name
    #[serde(default)]
    pub full_name: Option<String>,
    /// Salted password hash
    pub password_hash: PasswordHash,
    /// Role
    pub role: Role,
    /// Permissions on top of the role set
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Whether the account may log in
    #[serde(default = "default_active")]
    pub active: bool,
    /// Last successful login
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl User {
    /// New user; username and email are normalized to lowercase
    pub fn new(username: &str, email: &str, password: &str, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            tenant_id: None,
            username: normalize_key(username),
            email: normalize_key(email),
            full_name: None,
            password_hash: PasswordHash::new(password),
            role,
            permissions: role.permissions().into_iter().map(String::from).collect(),
            active: true,
            last_login: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check a plaintext password
    pub fn verify_password(&self, password: &str) -> bool {
        self.password_hash.verify(password)
    }

    /// Check a permission, honouring `*` and `resource:*` wildcards
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| {
            p == "*"
                || p == permission
                || (p.ends_with(":*") && permission.starts_with(&p[..p.len() - 1]))
        })
    }

    /// Outward-facing view without the password hash
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
            full_name: self.full_name.clone(),
            role: self.role,
            permissions: self.permissions.clone(),
            active: self.active,
            last_login: self.last_login,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl Entity for User {
    const KIND: EntityKind = EntityKind::User;
    fn id(&self) -> &str {
        &self.id
    }
}

/// User as returned to API clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User id
    pub id: String,
    /// Owning store id
    pub tenant_id: Option<String>,
    /// Login name
    pub username: String,
    /// Login email
    pub email: String,
    /// Display name
    pub full_name: Option<String>,
    /// Role
    pub role: Role,
    /// Effective extra permissions
    pub permissions: Vec<String>,
    /// Whether the account may log in
    pub active: bool,
    /// Last successful login
    pub last_login: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash() {
        let hash = PasswordHash::new("s3cret");
        assert!(hash.verify("s3cret"));
        assert!(!hash.verify("S3cret"));
        assert_eq!(format!("{:?}", hash), "PasswordHash(***)");

        // Same password, different salt
        assert_ne!(hash, PasswordHash::new("s3cret"));
        assert!(!PasswordHash("garbage".into()).verify("s3cret"));
    }

    #[test]
    fn test_password_hash_format() {
        let hash = PasswordHash::with_salt("pw", &[7u8; 16], 3);
        let parts: Vec<&str> = hash.0.split('$').collect();
        assert_eq!(parts[0], "pbkdf2-sha256");
        assert_eq!(parts[1], "3");
        assert_eq!(parts[3].len(), 64);
        assert!(hash.verify("pw"));

        // Stored round count is honored, not the current default
        assert_ne!(hash, PasswordHash::with_salt("pw", &[7u8; 16], HASH_ROUNDS));

        let mut tampered = parts.clone();
        let flipped = if tampered[3].starts_with('0') { "1" } else { "0" };
        let digest = format!("{}{}", flipped, &tampered[3][1..]);
        tampered[3] = &digest;
        assert!(!PasswordHash(tampered.join("$")).verify("pw"));

        let truncated = format!("pbkdf2-sha256$3${}$abcd", parts[2]);
        assert!(!PasswordHash(truncated).verify("pw"));
        assert!(!PasswordHash(format!("pbkdf2-sha256$0${}${}", parts[2], parts[3])).verify("pw"));
    }

    #[test]
    fn test_user_normalization_and_profile() {
        let user = User::new(" Bob ", "Bob@X.com", "pw", Role::Cashier);
        assert_eq!(user.username, "bob");
        assert_eq!(user.email, "bob@x.com");
        assert!(user.verify_password("pw"));

        let json = serde_json::to_value(user.profile()).unwrap();
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["username"], "bob");
    }

    #[test]
    fn test_permissions() {
        let manager = User::new("m", "m@x.com", "pw", Role::Manager);
        assert!(manager.has_permission("products:write"));
        assert!(manager.has_permission("payments:read"));
        assert!(!manager.has_permission("users:create"));

        let root = User::new("root", "root@x.com", "pw", Role::SuperAdmin);
        assert!(root.has_permission("anything:at_all"));
    }

    #[test]
    fn test_user_document_shape() {
        let user = User::new("alice", "alice@x.com", "pw", Role::Admin);
        let doc = serde_json::to_value(&user).unwrap();
        assert_eq!(doc["_id"], user.id.as_str());
        assert!(doc["tenant_id"].is_null());
        assert!(EntityKind::User.schema().validate_document(&doc).is_ok());

        let back: User = serde_json::from_value(doc).unwrap();
        assert_eq!(back, user);
    }
}
