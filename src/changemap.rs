use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// One changed byte range, relative to [`ChangeMap::start_offset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedArea {
    pub start: u64,
    pub length: u64,
}

impl ChangedArea {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// The byte ranges of a disk that must be copied.
///
/// Areas are kept in discovery order, which is ascending.  An empty area
/// list means the disks are identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMap {
    pub start_offset: u64,
    pub length: u64,
    #[serde(rename = "changedArea", default, deserialize_with = "null_as_empty")]
    pub changed_areas: Vec<ChangedArea>,
}

/// Documents written by older tools carry `"changedArea": null` for an
/// empty list.
fn null_as_empty<'de, D>(d: D) -> std::result::Result<Vec<ChangedArea>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ChangedArea>>::deserialize(d)?.unwrap_or_default())
}

impl ChangeMap {
    pub fn new(start_offset: u64, length: u64) -> Self {
        Self {
            start_offset,
            length,
            changed_areas: Vec::new(),
        }
    }

    /// Appends an area, rejecting any that would end past the map or start
    /// before the end of the previous one.
    pub fn push_area(&mut self, start: u64, length: u64) -> Result<()> {
        let after_previous = self.changed_areas.last().map_or(0, ChangedArea::end);
        match start.checked_add(length) {
            Some(end) if start >= after_previous && end <= self.length => {
                self.changed_areas.push(ChangedArea { start, length });
                Ok(())
            }
            _ => Err(Error::InvalidExtent {
                start,
                length,
                limit: self.length,
            }),
        }
    }

    /// Checks a map produced elsewhere: the map must not wrap the disk
    /// address space, and its areas must be ascending, disjoint and inside
    /// the map.
    pub fn validate(&self) -> Result<()> {
        if self.start_offset.checked_add(self.length).is_none() {
            return Err(Error::InvalidExtent {
                start: self.start_offset,
                length: self.length,
                limit: u64::MAX,
            });
        }
        let mut after_previous = 0;
        for a in &self.changed_areas {
            let inside = a
                .start
                .checked_add(a.length)
                .is_some_and(|end| end <= self.length);
            if !inside || a.start < after_previous {
                return Err(Error::InvalidExtent {
                    start: a.start,
                    length: a.length,
                    limit: self.length,
                });
            }
            after_previous = a.end();
        }
        Ok(())
    }

    /// Total number of bytes a copy of this map will transfer.
    pub fn estimate(&self) -> u64 {
        self.changed_areas.iter().map(|a| a.length).sum()
    }

    pub fn is_identical(&self) -> bool {
        self.changed_areas.is_empty()
    }
}
