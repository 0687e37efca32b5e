//! Stored items

/// Index row without its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMeta {
    pub key: String,
    /// Content file name for file-backed values
    pub filename: Option<String>,
    /// Value length in bytes
    pub size: i64,
    /// Unix seconds of the last write
    pub modified_at: i64,
    /// Unix seconds of the last successful read or write
    pub accessed_at: i64,
}

/// A value together with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvItem {
    pub meta: ItemMeta,
    pub value: Vec<u8>,
}

impl KvItem {
    pub fn key(&self) -> &str {
        &self.meta.key
    }
}
