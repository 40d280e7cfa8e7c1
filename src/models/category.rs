//! Category entries as they appear in the `reported_ips` JSONB column.
//!
//! Upstream detection processes write categories in three shapes: a bare
//! integer code, a numeric-looking or free-text string, or an object with an
//! `id`/`category_id` key. They are decoded into one tagged union here and
//! normalized to integer codes exactly once, so the mapping tables never
//! have to sniff types.

use serde::{Deserialize, Serialize};

/// One category entry from a local observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Category {
    Code(u32),
    Text(String),
    Object(CategoryRef),
}

/// Structured category reference, e.g. `{"id": 7}` or `{"category_id": 7}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<u32>,
}

impl Category {
    /// Resolve this entry to a category code, if it has one.
    ///
    /// Free-text tags like `"abuseipdb-blacklist"` resolve to `None` and are
    /// skipped by every mapping table.
    pub fn resolve(&self) -> Option<u32> {
        match self {
            Category::Code(code) => Some(*code),
            Category::Text(text) => text.trim().parse().ok(),
            Category::Object(obj) => obj.id.or(obj.category_id),
        }
    }
}

impl From<u32> for Category {
    fn from(code: u32) -> Self {
        Category::Code(code)
    }
}

/// Normalize a sequence of category entries into resolved codes, dropping
/// anything unresolvable.
pub fn resolve_codes(categories: &[Category]) -> Vec<u32> {
    categories.iter().filter_map(Category::resolve).collect()
}

/// AbuseIPDB attack category codes.
pub mod codes {
    pub const DNS_COMPROMISE: u32 = 1;
    pub const DNS_POISONING: u32 = 2;
    pub const FRAUD_ORDERS: u32 = 3;
    pub const DDOS_ATTACK: u32 = 4;
    pub const FTP_BRUTE_FORCE: u32 = 5;
    pub const PING_OF_DEATH: u32 = 6;
    pub const PHISHING: u32 = 7;
    pub const FRAUD_VOIP: u32 = 8;
    pub const OPEN_PROXY: u32 = 9;
    pub const WEB_SPAM: u32 = 10;
    pub const EMAIL_SPAM: u32 = 11;
    pub const BLOG_SPAM: u32 = 12;
    pub const VPN_IP: u32 = 13;
    pub const PORT_SCAN: u32 = 14;
    pub const HACKING: u32 = 15;
    pub const SQL_INJECTION: u32 = 16;
    pub const SPOOFING: u32 = 17;
    pub const BRUTE_FORCE: u32 = 18;
    pub const BAD_WEB_BOT: u32 = 19;
    pub const EXPLOITED_HOST: u32 = 20;
    pub const WEB_APP_ATTACK: u32 = 21;
    pub const SSH: u32 = 22;
    pub const IOT_TARGETED: u32 = 23;
}
