use crate::backend::reservation_station::Tag;
use crate::instructions::instructions::RegisterType;

pub struct RATEntry {
    // The reservation station that will produce the next value of the register;
    // None if the register file holds the current value.
    pub(crate) tag: Option<Tag>,
}

/// The Register Alias Table, also known as the register status table. The entry
/// for an architectural register points to the reservation station that will
/// write it. Only the most recent producer is recorded; a later dispatch to
/// the same register replaces the tag.
pub(crate) struct RAT {
    pub(crate) table: Vec<RATEntry>,
}

impl RAT {
    pub fn new(register_count: u16) -> Self {
        let mut table = Vec::with_capacity(register_count as usize);
        for _ in 0..register_count {
            table.push(RATEntry { tag: None });
        }
        Self { table }
    }

    pub fn mark_pending(&mut self, reg: RegisterType, tag: Tag) {
        self.table[reg as usize].tag = Some(tag);
    }

    /// Marks the register as ready, but only if `tag` is still its producer.
    /// Returns true if the register was cleared.
    pub fn clear(&mut self, reg: RegisterType, tag: Tag) -> bool {
        let entry = &mut self.table[reg as usize];
        if entry.tag == Some(tag) {
            entry.tag = None;
            true
        } else {
            false
        }
    }

    pub fn is_ready(&self, reg: RegisterType) -> bool {
        self.table[reg as usize].tag.is_none()
    }

    pub fn current_tag(&self, reg: RegisterType) -> Option<Tag> {
        self.table[reg as usize].tag
    }
}
