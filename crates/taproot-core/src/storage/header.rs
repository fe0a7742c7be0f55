use crate::error::{Error, Result};
use crate::types::{KeyPolicy, PageId, MIN_PAGE_SIZE};

/// Magic bytes identifying a taproot tree file.
pub const MAGIC: &[u8; 8] = b"TAPROOT1";

/// Current file format version.
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Serialized header length; the remainder of page 0 is zero.
pub const HEADER_SIZE: usize = 70;

const FLAG_UNIQUE: u32 = 1;
const FLAG_MULTI: u32 = 1 << 1;

/// Header page (page 0) contents.
///
/// Layout (all integers little-endian):
/// ```text
/// [0..8]    magic: "TAPROOT1"
/// [8..16]   signature: u64 (caller-supplied, checked on reopen)
/// [16..18]  major version: u16
/// [18..20]  minor version: u16
/// [20..24]  page_size: u32
/// [24..28]  key_size: u32
/// [28..32]  value_size: u32 (0 for the set variants)
/// [32..36]  flags: u32 (bit 0 unique, bit 1 multi)
/// [36..44]  root_page_id: u64
/// [44..46]  root_level: u16 (0 = the root is a leaf)
/// [46..54]  element_count: u64
/// [54..62]  free_list_head: u64 (0 = empty free list)
/// [62..70]  page_count: u64 (total pages, header page included)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub signature: u64,
    pub page_size: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub policy: KeyPolicy,
    pub root_page_id: PageId,
    pub root_level: u16,
    pub element_count: u64,
    pub free_list_head: PageId,
    pub page_count: u64,
}

impl FileHeader {
    /// Header for a freshly created file: the root is an empty leaf at
    /// page 1, so the file holds two pages.
    pub fn new(
        signature: u64,
        page_size: u32,
        key_size: u32,
        value_size: u32,
        policy: KeyPolicy,
    ) -> Self {
        Self {
            signature,
            page_size,
            key_size,
            value_size,
            policy,
            root_page_id: 1,
            root_level: 0,
            element_count: 0,
            free_list_head: 0,
            page_count: 2,
        }
    }

    /// Parse a header from the raw contents of page 0, validating magic,
    /// version, geometry, and policy flags.
    pub fn from_page(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Format("header page too short".to_string()));
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::Format("bad magic bytes".to_string()));
        }
        let major = u16::from_le_bytes(buf[16..18].try_into().unwrap());
        let minor = u16::from_le_bytes(buf[18..20].try_into().unwrap());
        if major != VERSION_MAJOR {
            return Err(Error::Format(format!(
                "unsupported format version {major}.{minor}"
            )));
        }

        let signature = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let page_size = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let key_size = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        let value_size = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        let flags = u32::from_le_bytes(buf[32..36].try_into().unwrap());

        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(Error::Format(format!("invalid page size {page_size}")));
        }
        let policy = match flags & (FLAG_UNIQUE | FLAG_MULTI) {
            FLAG_UNIQUE => KeyPolicy::Unique,
            FLAG_MULTI => KeyPolicy::Multi,
            _ => return Err(Error::Format(format!("invalid policy flags {flags:#x}"))),
        };
        if flags & !(FLAG_UNIQUE | FLAG_MULTI) != 0 {
            return Err(Error::Format(format!("unknown header flag bits {flags:#x}")));
        }

        Ok(Self {
            signature,
            page_size,
            key_size,
            value_size,
            policy,
            root_page_id: u64::from_le_bytes(buf[36..44].try_into().unwrap()),
            root_level: u16::from_le_bytes(buf[44..46].try_into().unwrap()),
            element_count: u64::from_le_bytes(buf[46..54].try_into().unwrap()),
            free_list_head: u64::from_le_bytes(buf[54..62].try_into().unwrap()),
            page_count: u64::from_le_bytes(buf[62..70].try_into().unwrap()),
        })
    }

    /// Serialize into a page-sized buffer.
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf.fill(0);
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..16].copy_from_slice(&self.signature.to_le_bytes());
        buf[16..18].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
        buf[18..20].copy_from_slice(&VERSION_MINOR.to_le_bytes());
        buf[20..24].copy_from_slice(&self.page_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.key_size.to_le_bytes());
        buf[28..32].copy_from_slice(&self.value_size.to_le_bytes());
        let flags = match self.policy {
            KeyPolicy::Unique => FLAG_UNIQUE,
            KeyPolicy::Multi => FLAG_MULTI,
        };
        buf[32..36].copy_from_slice(&flags.to_le_bytes());
        buf[36..44].copy_from_slice(&self.root_page_id.to_le_bytes());
        buf[44..46].copy_from_slice(&self.root_level.to_le_bytes());
        buf[46..54].copy_from_slice(&self.element_count.to_le_bytes());
        buf[54..62].copy_from_slice(&self.free_list_head.to_le_bytes());
        buf[62..70].copy_from_slice(&self.page_count.to_le_bytes());
    }
}
