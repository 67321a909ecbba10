//! Channel Positions
//!
//! A `PagedPosition` addresses one element of a channel: the page it lives in and
//! its offset within that page. Positions are totally ordered (page first, then
//! offset), which lets them double as read cursors and as exclusive upper bounds
//! for "everything before here is committed".
//!
//! The null position `(NULL_PAGE, -1)` means "nothing read yet".

use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::varint::{read_packed_i32, read_packed_i64, write_packed_i32, write_packed_i64};

/// Page id meaning "no page"
pub const NULL_PAGE: i64 = -1;

/// Largest offset within a page
pub const MAX_OFFSET: i32 = i32::MAX;

/// Position of an element within a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PagedPosition {
    /// Page id
    pub page: i64,

    /// Offset of the element within the page
    pub offset: i32,
}

/// The empty position
pub const NULL_POSITION: PagedPosition = PagedPosition {
    page: NULL_PAGE,
    offset: -1,
};

impl PagedPosition {
    pub const fn new(page: i64, offset: i32) -> Self {
        Self { page, offset }
    }

    pub fn is_null(&self) -> bool {
        self.page == NULL_PAGE
    }

    /// The position immediately after this one
    ///
    /// The null position has no successor and is returned unchanged; an offset
    /// at `MAX_OFFSET` rolls over to the start of the next page.
    pub fn next(&self) -> Self {
        if self.page == NULL_PAGE {
            *self
        } else if self.offset == MAX_OFFSET {
            Self::new(self.page + 1, 0)
        } else {
            Self::new(self.page, self.offset + 1)
        }
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        write_packed_i64(buf, self.page);
        write_packed_i32(buf, self.offset);
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        let page = read_packed_i64(buf)?;
        let offset = read_packed_i32(buf)?;
        Ok(Self { page, offset })
    }
}

impl Default for PagedPosition {
    fn default() -> Self {
        NULL_POSITION
    }
}

impl Ord for PagedPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.page
            .cmp(&other.page)
            .then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for PagedPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PagedPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.offset)
    }
}
